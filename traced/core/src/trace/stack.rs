//! Per-thread stack of open spans.
//!
//! Each thread owns its own stack, so concurrent calls on different threads
//! never observe each other's frames. Async callers push and pop within a
//! single poll, which keeps a suspended task from leaving frames behind on
//! a worker thread.

use std::cell::RefCell;

use traced_proto::prelude::{RunId, SpanId};

use super::TraceError;

/// One open invocation on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub span_id: SpanId,
    pub run_id: RunId,
}

#[derive(Debug, Default)]
pub struct SpanStack {
    frames: Vec<Frame>,
    run: Option<RunId>,
}

impl SpanStack {
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pops `span_id`, which must be the top frame.
    ///
    /// When it is not, the frame is still removed from wherever it sits so
    /// the stack recovers, and the misorder is reported.
    pub fn pop(&mut self, span_id: SpanId) -> Result<Frame, TraceError> {
        match self.frames.last() {
            Some(top) if top.span_id == span_id => {
                let frame = *top;
                self.frames.pop();
                Ok(frame)
            }
            top => {
                let found = top.map(|f| f.span_id);
                if let Some(pos) = self.frames.iter().rposition(|f| f.span_id == span_id) {
                    self.frames.truncate(pos);
                }
                Err(TraceError::StackOrder {
                    expected: span_id,
                    found,
                })
            }
        }
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Parent for a new span in `run`: the innermost open frame, but only
    /// when it belongs to the same run.
    pub fn parent_for(&self, run: &RunId) -> Option<SpanId> {
        self.top()
            .filter(|frame| &frame.run_id == run)
            .map(|frame| frame.span_id)
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.run
    }

    /// Replaces the run scoped to this thread and returns the previous one.
    pub fn set_current_run(&mut self, run: Option<RunId>) -> Option<RunId> {
        std::mem::replace(&mut self.run, run)
    }
}

thread_local! {
    static SPAN_STACK: RefCell<SpanStack> = RefCell::new(SpanStack::default());
}

/// Runs `f` against this thread's stack.
///
/// Returns `None` when the stack is unavailable, either during thread
/// teardown or when already borrowed further up the call chain.
pub fn with_current<R>(f: impl FnOnce(&mut SpanStack) -> R) -> Option<R> {
    SPAN_STACK
        .try_with(|stack| stack.try_borrow_mut().ok().map(|mut s| f(&mut s)))
        .ok()
        .flatten()
}
