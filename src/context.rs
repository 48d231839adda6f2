//! The implicit per-branch binding of the current trace context.
//!
//! Each thread owns one slot holding "the current [`TraceContext`] or
//! none". Entering a span replaces the slot for the dynamic extent of the
//! wrapped work and restores the previous binding on exit, including on
//! panic. Futures carry their binding explicitly via [`FutureExt`], so a
//! task keeps its own context across suspension points no matter which
//! worker thread polls it.

use crate::trace::TraceContext;
use futures_core::stream::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

/// Applies a function to this thread's current binding.
///
/// Panics if called while the slot is already mutably borrowed, which can
/// only happen from within another `map_current*` call.
pub(crate) fn map_current<T>(f: impl FnOnce(Option<&TraceContext>) -> T) -> T {
    CURRENT_CONTEXT.with(|cx| f(cx.borrow().as_ref()))
}

/// Applies a mutating function to this thread's current binding.
pub(crate) fn map_current_mut<T>(f: impl FnOnce(Option<&mut TraceContext>) -> T) -> T {
    CURRENT_CONTEXT.with(|cx| f(cx.borrow_mut().as_mut()))
}

/// Clones this thread's current binding.
pub(crate) fn current() -> Option<TraceContext> {
    CURRENT_CONTEXT.with(|cx| cx.borrow().clone())
}

/// Replaces this thread's binding, returning a guard that restores the
/// previous one when dropped.
pub(crate) fn attach(cx: Option<TraceContext>) -> ContextGuard {
    let previous = CURRENT_CONTEXT
        .try_with(|current| current.replace(cx))
        .ok();

    ContextGuard {
        previous,
        _marker: PhantomData,
    }
}

/// A guard that restores the previous binding when dropped.
pub(crate) struct ContextGuard {
    previous: Option<Option<TraceContext>>,
    // ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous));
        }
    }
}

pin_project! {
    /// A future, stream, or sink with an associated trace context binding.
    ///
    /// The binding is attached for the duration of every poll and any
    /// mutation made during a poll is carried forward to the next one, so
    /// writes to the current context stay visible across suspension points
    /// within the one logical branch that owns this value.
    #[derive(Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Option<TraceContext>,
    }
}

impl<T> WithContext<T> {
    fn poll_scoped<R>(
        cx: &mut Option<TraceContext>,
        poll: impl FnOnce() -> Poll<R>,
    ) -> Poll<R> {
        let _guard = attach(cx.clone());
        let result = poll();
        // Persist writes made during this poll; the guard then restores
        // whatever the polling thread had bound before.
        *cx = current();
        result
    }
}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let inner = this.inner;
        Self::poll_scoped(this.cx, || inner.poll(task_cx))
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let inner = this.inner;
        Self::poll_scoped(this.cx, || inner.poll_next(task_cx))
    }
}

impl<I, T: Sink<I>> Sink<I> for WithContext<T> {
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let inner = this.inner;
        Self::poll_scoped(this.cx, || inner.poll_ready(task_cx))
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = attach(this.cx.clone());
        let result = this.inner.start_send(item);
        *this.cx = current();
        result
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let inner = this.inner;
        Self::poll_scoped(this.cx, || inner.poll_flush(task_cx))
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let inner = this.inner;
        Self::poll_scoped(this.cx, || inner.poll_close(task_cx))
    }
}

/// Extension trait attaching trace context bindings to futures, streams,
/// and sinks.
pub trait FutureExt: Sized {
    /// Binds the given context to this value for every poll.
    fn with_context(self, cx: TraceContext) -> WithContext<Self> {
        WithContext {
            inner: self,
            cx: Some(cx),
        }
    }

    /// Captures the caller's current binding (or its absence) and carries
    /// it across polls of this value.
    ///
    /// This is how a binding follows a task onto another worker thread or
    /// across an `await`: capture at creation time, re-attach at poll time.
    fn with_current_context(self) -> WithContext<Self> {
        WithContext {
            inner: self,
            cx: current(),
        }
    }
}

impl<T: Sized> FutureExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ContextSeed, Tracer};
    use crate::TraceId;

    #[test]
    fn attach_restores_previous_binding() {
        assert!(current().is_none());

        let outer = TraceContext::new("outer", ContextSeed::default());
        let outer_span = outer.span_id();
        {
            let _outer_guard = attach(Some(outer));
            assert_eq!(current().unwrap().span_id(), outer_span);

            {
                let inner = TraceContext::new("inner", ContextSeed::default());
                let inner_span = inner.span_id();
                let _inner_guard = attach(Some(inner));
                assert_eq!(current().unwrap().span_id(), inner_span);
            }

            assert_eq!(current().unwrap().span_id(), outer_span);
        }

        assert!(current().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_tasks_keep_their_own_binding() {
        async fn traced(tag: &'static str) -> TraceId {
            let tracer = Tracer::new();
            tracer
                .span_future(tag, async move {
                    let tracer = Tracer::new();
                    let trace_id = tracer.trace().unwrap().trace_id;
                    tracer.set_trace_state("task", tag).unwrap();

                    tokio::task::yield_now().await;

                    // binding and writes survive the suspension
                    assert_eq!(tracer.trace().unwrap().trace_id, trace_id);
                    assert_eq!(tracer.trace_state().unwrap().get("task"), Some(tag));
                    trace_id
                })
                .await
        }

        let left = tokio::spawn(traced("left"));
        let right = tokio::spawn(traced("right"));

        let (left, right) = (left.await.unwrap(), right.await.unwrap());
        assert_ne!(left, right);
    }

    #[tokio::test]
    async fn stream_items_are_produced_inside_the_captured_binding() {
        use futures_util::StreamExt;

        let cx = TraceContext::new("stream", ContextSeed::default());
        let span = cx.span_id();

        let mut stream = futures_util::stream::iter([(), (), ()])
            .map(|_| Tracer::new().span_id().unwrap())
            .with_context(cx);

        while let Some(id) = stream.next().await {
            assert_eq!(id, span);
        }
        assert!(!Tracer::new().is_in_span());
    }

    #[tokio::test]
    async fn unbound_future_stays_unbound() {
        let tracer = Tracer::new();
        async {
            assert!(!Tracer::new().is_in_span());
            tokio::task::yield_now().await;
            assert!(!Tracer::new().is_in_span());
        }
        .with_current_context()
        .await;
        assert!(!tracer.is_in_span());
    }
}
