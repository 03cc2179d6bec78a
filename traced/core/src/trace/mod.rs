mod span;
pub mod sampler;
pub mod snapshot;
pub mod stack;

pub use sampler::{BernoulliSampler, CallSite, Decision, Sampler};
pub use snapshot::{capture, Capture, Json, Opaque, SnapshotError};
pub use span::{current_thread_id, ActiveSpan};
pub use stack::{Frame, SpanStack};

use traced_proto::prelude::{RunId, SpanId};

use crate::store::StoreError;

/// Errors raised by tracer operations.
///
/// None of these ever reach an instrumented function: the call path records
/// or drops the event and runs the target anyway.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("run {0} is not active in this tracer")]
    UnknownRun(RunId),

    #[error("run {0} is already closing")]
    RunClosed(RunId),

    #[error("span stack out of order: expected {expected} on top, found {found:?}")]
    StackOrder {
        expected: SpanId,
        found: Option<SpanId>,
    },

    #[error("background tasks need a tokio runtime: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
