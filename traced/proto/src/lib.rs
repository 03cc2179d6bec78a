pub mod dto;
pub mod types;

pub mod prelude {
    // --- Identifiers and time ---
    pub use crate::types::{RunId, SpanId, Timestamp};

    // --- Records ---
    pub use crate::types::{Outcome, Run, RunStatus, Span};

    // --- Payload snapshots ---
    pub use crate::types::{Snapshot, Value};

    // --- Error Handling ---
    pub use crate::types::ProtoError;

    // --- DTO Structures ---
    pub use crate::dto::diff::{ChangeKind, DiffEntry, DiffResult, PathSegment, SpanPath};
    pub use crate::dto::live::{ClientMessage, DropReason, LiveMessage, Topic};
    pub use crate::dto::query::{FunctionStats, RunDetail, RunFilter, RunSummary};
}
