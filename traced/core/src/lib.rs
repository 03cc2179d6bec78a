//! Trace capture, sampling, buffering and persistence for traced.
//!
//! A [`Tracer`] owns everything a traced process needs: the sampler, the
//! event buffer, the registry of active runs and the background flusher.
//! Instrumented functions are produced with [`Tracer::instrument`] and run
//! their target unchanged when a call is not sampled.

pub mod blob;
pub mod buffer;
pub mod compare;
pub mod config;
pub mod instrument;
pub mod query;
pub mod stats;
pub mod store;
pub mod trace;
pub mod tracer;

pub use buffer::{BufferStats, ConsumerClass, Enqueued, Event, EventBuffer};
pub use compare::{CompareError, RunComparator};
pub use config::TracerConfig;
pub use instrument::{Instrumented, WrapOptions};
pub use query::{QueryError, QueryService};
pub use store::{open_store, StoreError, TraceStore};
pub use trace::TraceError;
pub use tracer::{RunGuard, RunOptions, RunRegistry, Tracer, TracerBuilder, TracerStats};
