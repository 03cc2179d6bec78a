use std::sync::atomic::{AtomicU64, Ordering};

use traced_proto::prelude::{Outcome, RunId, Snapshot, Span, SpanId, Timestamp};

// Process-wide counter; span ids stay unique across runs and threads.
static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// Obtain a numeric thread identifier using platform facilities where possible.
///
/// On macOS we use `pthread_self()` which is stable per thread lifetime.
/// On Linux we use the `gettid` syscall for the OS thread id.
/// On other platforms we hash the opaque `std::thread::ThreadId` debug output
/// to yield a reproducible u64 within process lifetime.
pub fn current_thread_id() -> u64 {
    #[cfg(target_os = "macos")]
    unsafe {
        return libc::pthread_self() as u64;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        return libc::syscall(libc::SYS_gettid) as u64;
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let tid = std::thread::current().id();
        let mut h = DefaultHasher::new();
        format!("{:?}", tid).hash(&mut h);
        h.finish()
    }
}

/// An invocation that has started but not yet finished.
///
/// Only the wrapper holds one of these. It becomes an immutable [`Span`]
/// through [`ActiveSpan::finish`].
#[derive(Debug, Clone)]
pub struct ActiveSpan {
    pub span_id: SpanId,
    pub run_id: RunId,
    pub parent_id: Option<SpanId>,
    pub thread_id: u64,
    pub name: String,
    pub start: Timestamp,
    pub args: Snapshot,
    pub sampled: bool,
}

impl ActiveSpan {
    pub fn open<N: Into<String>>(
        run_id: RunId,
        parent_id: Option<SpanId>,
        name: N,
        args: Snapshot,
        sampled: bool,
    ) -> Self {
        ActiveSpan {
            span_id: SpanId(NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed)),
            run_id,
            parent_id,
            thread_id: current_thread_id(),
            name: name.into(),
            start: Timestamp::now(),
            args,
            sampled,
        }
    }

    /// Creates a span with no parent in `run_id`.
    pub fn new_root<N: Into<String>>(run_id: RunId, name: N, args: Snapshot) -> Self {
        Self::open(run_id, None, name, args, true)
    }

    /// Closes the span. The sequence number is left at zero; the event
    /// buffer assigns it.
    pub fn finish(self, outcome: Outcome) -> Span {
        Span {
            id: self.span_id,
            run_id: self.run_id,
            parent_id: self.parent_id,
            seq: 0,
            name: self.name,
            thread_id: self.thread_id,
            start: self.start,
            end: Timestamp::now(),
            args: self.args,
            outcome,
            sampled: self.sampled,
        }
    }
}
