//! Call wrappers that record a span per traced invocation.
//!
//! Tracing is fail-open: whatever happens while recording, the wrapped
//! function runs, its return value is handed back untouched, and its
//! failure (error or panic) reaches the caller unchanged.

use std::any::{type_name, Any};
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;

use serde::{Deserialize, Serialize};
use traced_proto::prelude::Outcome;

use crate::trace::snapshot::{capture, Capture};
use crate::trace::stack::{self, Frame};
use crate::trace::ActiveSpan;
use crate::tracer::Tracer;

/// Recorded as the error of a traced future dropped before completion.
pub const CANCELLED: &str = "cancelled before completion";

/// Per-function tracing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapOptions {
    /// Sampling rate for this function, overriding the run's.
    pub sample_rate: Option<f64>,
    /// Trace every call regardless of sampling.
    pub always_trace: bool,
    pub max_payload_bytes: Option<usize>,
}

impl WrapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn always_trace(mut self) -> Self {
        self.always_trace = true;
        self
    }

    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = Some(bytes);
        self
    }
}

/// A span opened by the tracer and not yet handed back.
///
/// Dropping it without finishing records the call as cancelled.
pub(crate) struct InFlight {
    tracer: Tracer,
    span: Option<ActiveSpan>,
    max_payload_bytes: usize,
}

impl InFlight {
    pub(crate) fn new(tracer: Tracer, span: ActiveSpan, max_payload_bytes: usize) -> Self {
        InFlight {
            tracer,
            span: Some(span),
            max_payload_bytes,
        }
    }

    fn frame(&self) -> Option<Frame> {
        self.span.as_ref().map(|span| Frame {
            span_id: span.span_id,
            run_id: span.run_id,
        })
    }

    /// Pushes this span onto the calling thread's stack.
    fn enter(&self) {
        if let Some(frame) = self.frame() {
            stack::with_current(|s| s.push(frame));
        }
    }

    fn exit(&self) {
        if let Some(frame) = self.frame() {
            if let Some(Err(e)) = stack::with_current(|s| s.pop(frame.span_id)) {
                log::warn!("{e}");
            }
        }
    }

    fn returned<R: Capture + ?Sized>(self, value: &R) {
        let snapshot = capture(value, self.max_payload_bytes);
        self.tracer.note_snapshot(&snapshot);
        self.finish(Outcome::Returned(snapshot));
    }

    fn failed(self, description: String) {
        self.finish(Outcome::Failed(description));
    }

    fn finish(mut self, outcome: Outcome) {
        if let Some(span) = self.span.take() {
            self.tracer.complete(span.finish(outcome));
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.tracer
                .complete(span.finish(Outcome::Failed(CANCELLED.to_string())));
        }
    }
}

/// `TypeName: message` for an error value.
pub fn describe_error<E: Display + ?Sized>(error: &E) -> String {
    let full = type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    format!("{short}: {error}")
}

pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string payload".to_string()
    };
    format!("panic: {message}")
}

/// Runs `func` inside a span when the tracer decides to trace this call.
pub(crate) fn trace_call<A, R, F>(
    tracer: &Tracer,
    name: &str,
    options: &WrapOptions,
    args: A,
    func: F,
) -> R
where
    A: Capture,
    R: Capture,
    F: FnOnce(A) -> R,
{
    let Some(inflight) = tracer.begin(name, options, &args) else {
        return func(args);
    };
    inflight.enter();
    let result = panic::catch_unwind(AssertUnwindSafe(|| func(args)));
    inflight.exit();
    match result {
        Ok(value) => {
            inflight.returned(&value);
            value
        }
        Err(payload) => {
            inflight.failed(describe_panic(payload.as_ref()));
            panic::resume_unwind(payload)
        }
    }
}

fn trace_fallible<A, T, E, F>(
    tracer: &Tracer,
    name: &str,
    options: &WrapOptions,
    args: A,
    func: F,
) -> Result<T, E>
where
    A: Capture,
    T: Capture,
    E: Display,
    F: FnOnce(A) -> Result<T, E>,
{
    let Some(inflight) = tracer.begin(name, options, &args) else {
        return func(args);
    };
    inflight.enter();
    let result = panic::catch_unwind(AssertUnwindSafe(|| func(args)));
    inflight.exit();
    match result {
        Ok(Ok(value)) => {
            inflight.returned(&value);
            Ok(value)
        }
        Ok(Err(e)) => {
            inflight.failed(describe_error(&e));
            Err(e)
        }
        Err(payload) => {
            inflight.failed(describe_panic(payload.as_ref()));
            panic::resume_unwind(payload)
        }
    }
}

/// Drives `make(args)` inside a span. The span's frame is on the polling
/// thread's stack only while the future is being polled.
async fn trace_future<A, Fut, F, O>(
    tracer: &Tracer,
    name: &str,
    options: &WrapOptions,
    args: A,
    make: F,
    outcome: O,
) -> Fut::Output
where
    A: Capture,
    Fut: Future,
    F: FnOnce(A) -> Fut,
    O: FnOnce(InFlight, &Fut::Output),
{
    let Some(inflight) = tracer.begin(name, options, &args) else {
        return make(args).await;
    };
    inflight.enter();
    let created = panic::catch_unwind(AssertUnwindSafe(|| make(args)));
    inflight.exit();
    let fut = match created {
        Ok(fut) => fut,
        Err(payload) => {
            inflight.failed(describe_panic(payload.as_ref()));
            panic::resume_unwind(payload)
        }
    };

    let mut fut = std::pin::pin!(fut);
    let polled = std::future::poll_fn(|cx| {
        inflight.enter();
        let poll = panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(cx)));
        inflight.exit();
        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    })
    .await;

    match polled {
        Ok(value) => {
            outcome(inflight, &value);
            value
        }
        Err(payload) => {
            inflight.failed(describe_panic(payload.as_ref()));
            panic::resume_unwind(payload)
        }
    }
}

/// A function wrapped for tracing.
///
/// Arguments are passed as one value; use a tuple for several. Unsampled
/// calls go straight to the function.
#[derive(Clone)]
pub struct Instrumented<F> {
    tracer: Tracer,
    name: Arc<str>,
    options: WrapOptions,
    func: F,
}

impl<F> std::fmt::Debug for Instrumented<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl<F> Instrumented<F> {
    pub(crate) fn new(tracer: Tracer, name: String, options: WrapOptions, func: F) -> Self {
        Instrumented {
            tracer,
            name: name.into(),
            options,
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &WrapOptions {
        &self.options
    }

    /// The wrapped function, for calling it without tracing.
    pub fn inner(&self) -> &F {
        &self.func
    }

    /// Calls the function. A panic is recorded and then resumed.
    pub fn call<A, R>(&self, args: A) -> R
    where
        F: Fn(A) -> R,
        A: Capture,
        R: Capture,
    {
        trace_call(&self.tracer, &self.name, &self.options, args, &self.func)
    }

    /// Calls a fallible function. An `Err` is recorded as the span's error
    /// and returned to the caller as is.
    pub fn try_call<A, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        A: Capture,
        T: Capture,
        E: Display,
    {
        trace_fallible(&self.tracer, &self.name, &self.options, args, &self.func)
    }

    pub async fn call_async<A, Fut>(&self, args: A) -> Fut::Output
    where
        F: Fn(A) -> Fut,
        A: Capture,
        Fut: Future,
        Fut::Output: Capture,
    {
        trace_future(
            &self.tracer,
            &self.name,
            &self.options,
            args,
            &self.func,
            |inflight, value: &Fut::Output| inflight.returned(value),
        )
        .await
    }

    pub async fn try_call_async<A, Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        A: Capture,
        Fut: Future<Output = Result<T, E>>,
        T: Capture,
        E: Display,
    {
        trace_future(
            &self.tracer,
            &self.name,
            &self.options,
            args,
            &self.func,
            |inflight, result: &Result<T, E>| match result {
                Ok(value) => inflight.returned(value),
                Err(e) => inflight.failed(describe_error(e)),
            },
        )
        .await
    }
}
