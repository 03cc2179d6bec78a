mod ids;
mod record;
mod value;

pub use ids::{RunId, SpanId, Timestamp};
pub use record::{Outcome, Run, RunStatus, Span};
pub use value::{Snapshot, Value, TRUNCATED_MARKER};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtoError {
    #[error("invalid run id `{0}`")]
    InvalidRunId(String),

    #[error("invalid span id `{0}`")]
    InvalidSpanId(String),

    #[error("unknown run status `{0}`")]
    UnknownStatus(String),
}
