//! Messages of the live subscription stream.

use serde::{Deserialize, Serialize};

use crate::types::{Run, RunId, Span};

/// What an observer wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    All,
    Run(RunId),
}

impl Topic {
    pub fn matches(&self, run_id: &RunId) -> bool {
        match self {
            Topic::All => true,
            Topic::Run(id) => id == run_id,
        }
    }
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start streaming. With `backfill`, already recorded spans of the run
    /// are delivered first.
    Subscribe {
        topic: Topic,
        #[serde(default)]
        backfill: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The observer's outbound queue was full.
    SlowConsumer,
    /// The broadcaster is shutting down.
    Shutdown,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Span { span: Span },
    /// Marks the end of the backfill; live spans follow strictly after `last_seq`.
    BackfillComplete {
        run_id: RunId,
        count: usize,
        last_seq: Option<u64>,
    },
    RunClosed { run: Run },
    Dropped { reason: DropReason },
    Error { message: String },
}
