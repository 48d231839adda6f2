use crate::context::{self, FutureExt, WithContext};
use crate::trace::{
    ContextData, ContextSeed, NotInSpanError, Trace, TraceContext, TraceResult, TraceState,
};
use crate::SpanId;
use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

/// The scope engine: opens spans and exposes the query/mutation surface
/// over whichever span is active on the current execution branch.
///
/// `Tracer` owns no state of its own — the binding lives in a per-branch
/// slot — so it is constructed explicitly, cloned freely, and every handle
/// observes the same binding on a given branch.
///
/// # Examples
///
/// ```
/// use tracescope::Tracer;
///
/// let tracer = Tracer::new();
/// tracer.in_span("outer", || {
///     let outer = tracer.trace().unwrap();
///     tracer.in_span("inner", || {
///         // nested spans stay in the same trace
///         assert_eq!(tracer.trace().unwrap().trace_id, outer.trace_id);
///     });
///     // exiting the nested span restores the outer binding
///     assert_eq!(tracer.trace().unwrap(), outer);
/// });
/// ```
#[derive(Clone, Debug, Default)]
pub struct Tracer {
    _private: (),
}

impl Tracer {
    /// Create a new `Tracer`.
    pub fn new() -> Self {
        Tracer { _private: () }
    }

    /// Runs `work` inside a new span, binding a derived context for exactly
    /// the dynamic extent of the call.
    ///
    /// If a span is already active on this branch, the new context is a
    /// child of it: same trace id, version, flags, and trace state; payload
    /// data is not inherited. Otherwise a fresh trace is synthesized. In
    /// both cases the span gets a freshly generated span id.
    ///
    /// The previous binding is restored when `work` returns or panics, and
    /// `work`'s return value (or panic) passes through unchanged.
    pub fn in_span<T, F>(&self, name: impl Into<Cow<'static, str>>, work: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.enter(self.derive(name.into()), work)
    }

    /// Runs `work` inside a new span built from explicitly supplied fields,
    /// resuming a trace received from an external source such as an inbound
    /// request header.
    ///
    /// ```
    /// use tracescope::{ContextSeed, Trace, Tracer};
    ///
    /// let inbound: Trace = "0-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-1"
    ///     .parse()
    ///     .unwrap();
    /// let tracer = Tracer::new();
    /// tracer.in_span_with_seed("resume", ContextSeed::from(inbound), || {
    ///     assert_eq!(tracer.trace().unwrap().trace_id, inbound.trace_id);
    /// });
    /// ```
    pub fn in_span_with_seed<T, F>(
        &self,
        name: impl Into<Cow<'static, str>>,
        seed: ContextSeed,
        work: F,
    ) -> T
    where
        F: FnOnce() -> T,
    {
        self.enter(TraceContext::new(name, seed), work)
    }

    /// Wraps a future in a new span derived exactly as for
    /// [`Tracer::in_span`], bound for the duration of every poll.
    pub fn span_future<F>(&self, name: impl Into<Cow<'static, str>>, fut: F) -> WithContext<F>
    where
        F: Future,
    {
        fut.with_context(self.derive(name.into()))
    }

    /// Wraps a future in a new span built from explicitly supplied fields.
    pub fn span_future_with_seed<F>(
        &self,
        name: impl Into<Cow<'static, str>>,
        seed: ContextSeed,
        fut: F,
    ) -> WithContext<F>
    where
        F: Future,
    {
        fut.with_context(TraceContext::new(name, seed))
    }

    fn derive(&self, name: Cow<'static, str>) -> TraceContext {
        context::map_current(|current| match current {
            Some(parent) => parent.child(name),
            None => TraceContext::root(name),
        })
    }

    fn enter<T, F: FnOnce() -> T>(&self, cx: TraceContext, work: F) -> T {
        #[cfg(feature = "internal-logs")]
        tracing::trace!(
            span_name = cx.name(),
            trace_id = %cx.trace_id(),
            span_id = %cx.span_id(),
            "span opened"
        );
        let _guard = context::attach(Some(cx));
        work()
    }

    /// Returns whether a complete trace context is bound on this branch.
    ///
    /// Never fails; use it to guard the fallible accessors.
    pub fn is_in_span(&self) -> bool {
        context::map_current(|cx| cx.is_some())
    }

    /// The active span's own identifier.
    pub fn span_id(&self) -> TraceResult<SpanId> {
        self.with_current(|cx| cx.span_id())
    }

    /// The external-facing identity of the active span's trace.
    pub fn trace(&self) -> TraceResult<Trace> {
        self.with_current(TraceContext::trace)
    }

    /// The active trace rendered as a `version-traceid-parentid-flags`
    /// header.
    pub fn trace_header(&self) -> TraceResult<String> {
        self.with_current(|cx| cx.trace().header())
    }

    /// Like [`Tracer::trace`], but naming the active span itself as the
    /// parent: the record to propagate to a downstream callee.
    pub fn child_trace(&self) -> TraceResult<Trace> {
        self.with_current(TraceContext::child_trace)
    }

    /// [`Tracer::child_trace`] rendered as a header.
    pub fn child_trace_header(&self) -> TraceResult<String> {
        self.with_current(|cx| cx.child_trace().header())
    }

    /// A snapshot of the active span's trace state; [`TraceState::NONE`]
    /// when none has been set.
    pub fn trace_state(&self) -> TraceResult<TraceState> {
        self.with_current(|cx| cx.trace_state().clone())
    }

    /// The active trace state serialized as comma-joined `key=value`
    /// pairs, or `None` when it has no entries.
    pub fn trace_state_header(&self) -> TraceResult<Option<String>> {
        self.with_current(|cx| {
            let state = cx.trace_state();
            if state.is_empty() {
                None
            } else {
                Some(state.header())
            }
        })
    }

    /// A snapshot of the payload attached to the active span, if any.
    pub fn context_data(&self) -> TraceResult<Option<ContextData>> {
        self.with_current(|cx| cx.data().cloned())
    }

    /// Replaces the active span's payload wholesale.
    pub fn set_context_data<T: Any + Send + Sync>(&self, value: T) -> TraceResult<()> {
        self.with_current_mut(move |cx| {
            let data: ContextData = Arc::new(value);
            cx.set_data(data);
        })
    }

    /// Sets `key` in the active span's trace state, creating the mapping
    /// if absent and overwriting any existing value.
    pub fn set_trace_state(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> TraceResult<()> {
        self.with_current_mut(move |cx| cx.trace_state_mut().set(key, value))
    }

    /// Removes `key` from the active span's trace state; absent keys (or an
    /// absent mapping) are ignored.
    pub fn delete_trace_state(&self, key: &str) -> TraceResult<()> {
        self.with_current_mut(|cx| cx.trace_state_mut().delete(key))
    }

    fn with_current<T>(&self, f: impl FnOnce(&TraceContext) -> T) -> TraceResult<T> {
        context::map_current(|cx| cx.map(f).ok_or(NotInSpanError))
    }

    fn with_current_mut<T>(&self, f: impl FnOnce(&mut TraceContext) -> T) -> TraceResult<T> {
        context::map_current_mut(|cx| cx.map(f).ok_or(NotInSpanError))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ParentId, TraceFlags, TraceId};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn root_span_synthesizes_a_fresh_trace() {
        let tracer = Tracer::new();
        tracer.in_span("root", || {
            let trace = tracer.trace().unwrap();
            assert_eq!(trace.parent_id, ParentId::Invalid);
            assert_ne!(trace.trace_id, TraceId::INVALID);
            assert_eq!(trace.trace_id.to_string().len(), 32);
            assert_eq!(trace.version, 0);
            assert_eq!(trace.trace_flags, TraceFlags::NOT_SAMPLED);
            assert!(tracer.trace_state().unwrap().is_empty());
        });
    }

    #[test]
    fn nested_span_links_through_the_parent_trace_id() {
        let tracer = Tracer::new();
        tracer.in_span("outer", || {
            let outer = tracer.trace().unwrap();
            let outer_span = tracer.span_id().unwrap();
            tracer.set_trace_state("tenant", "a").unwrap();

            tracer.in_span("inner", || {
                let inner = tracer.trace().unwrap();
                assert_eq!(inner.trace_id, outer.trace_id);
                assert_eq!(inner.parent_id, ParentId::Trace(outer.trace_id));
                assert_ne!(tracer.span_id().unwrap(), outer_span);
                // state is inherited, data is not
                assert_eq!(tracer.trace_state().unwrap().get("tenant"), Some("a"));
                assert!(tracer.context_data().unwrap().is_none());
            });
        });
    }

    #[test]
    fn child_trace_names_the_current_span_as_parent() {
        let tracer = Tracer::new();
        tracer.in_span("work", || {
            let span_id = tracer.span_id().unwrap();
            let child = tracer.child_trace().unwrap();
            assert_eq!(child.parent_id, ParentId::Span(span_id));
            assert_eq!(child.trace_id, tracer.trace().unwrap().trace_id);
            assert_eq!(tracer.child_trace_header().unwrap(), child.header());
        });
    }

    #[test]
    fn seeded_span_resumes_the_supplied_trace() {
        let tracer = Tracer::new();
        let parent = SpanId::from(0x00f0_67aa_0ba9_02b7);
        let seed = ContextSeed {
            parent_id: Some(ParentId::Span(parent)),
            trace_id: TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
            trace_flags: TraceFlags::SAMPLED,
            trace_state: TraceState::from_key_value([("vendor", "x")]),
            ..ContextSeed::default()
        };
        tracer.in_span_with_seed("resume", seed, || {
            let trace = tracer.trace().unwrap();
            assert_eq!(trace.parent_id, ParentId::Span(parent));
            assert_eq!(
                trace.trace_id,
                TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736)
            );
            assert!(trace.trace_flags.is_sampled());
            assert_eq!(tracer.trace_state().unwrap().get("vendor"), Some("x"));
        });
    }

    #[test]
    fn span_passes_the_work_result_through() {
        let tracer = Tracer::new();
        assert_eq!(tracer.in_span("compute", || 21 * 2), 42);
    }

    #[test]
    fn accessors_fail_outside_a_span() {
        let tracer = Tracer::new();
        assert!(!tracer.is_in_span());
        assert_eq!(tracer.span_id(), Err(NotInSpanError));
        assert_eq!(tracer.trace(), Err(NotInSpanError));
        assert_eq!(tracer.trace_header(), Err(NotInSpanError));
        assert_eq!(tracer.child_trace(), Err(NotInSpanError));
        assert_eq!(tracer.child_trace_header(), Err(NotInSpanError));
        assert_eq!(tracer.trace_state(), Err(NotInSpanError));
        assert_eq!(tracer.trace_state_header(), Err(NotInSpanError));
        assert!(tracer.context_data().is_err());
        assert!(tracer.set_context_data("x").is_err());
        assert_eq!(tracer.set_trace_state("k", "v"), Err(NotInSpanError));
        assert_eq!(tracer.delete_trace_state("k"), Err(NotInSpanError));
        // failed access leaves no residual binding behind
        assert!(!tracer.is_in_span());
    }

    #[test]
    fn trace_state_mutation_is_visible_to_later_reads() {
        let tracer = Tracer::new();
        tracer.in_span("work", || {
            assert_eq!(tracer.trace_state_header().unwrap(), None);

            tracer.set_trace_state("k", "v").unwrap();
            assert_eq!(tracer.trace_state().unwrap().get("k"), Some("v"));

            tracer.set_trace_state("k", "v2").unwrap();
            tracer.set_trace_state("k2", "w").unwrap();
            assert_eq!(
                tracer.trace_state_header().unwrap().as_deref(),
                Some("k=v2,k2=w")
            );

            tracer.delete_trace_state("does-not-exist").unwrap();
            tracer.delete_trace_state("k").unwrap();
            assert_eq!(
                tracer.trace_state_header().unwrap().as_deref(),
                Some("k2=w")
            );
        });
    }

    #[test]
    fn context_data_replaces_wholesale() {
        let tracer = Tracer::new();
        tracer.in_span("work", || {
            assert!(tracer.context_data().unwrap().is_none());

            tracer.set_context_data(vec![1u32, 2, 3]).unwrap();
            let data = tracer.context_data().unwrap().unwrap();
            assert_eq!(data.downcast_ref::<Vec<u32>>(), Some(&vec![1, 2, 3]));

            tracer.set_context_data("replaced").unwrap();
            let data = tracer.context_data().unwrap().unwrap();
            assert!(data.downcast_ref::<Vec<u32>>().is_none());
            assert_eq!(data.downcast_ref::<&str>(), Some(&"replaced"));
        });
    }

    #[test]
    fn parent_mutations_survive_a_nested_span() {
        let tracer = Tracer::new();
        tracer.in_span("outer", || {
            tracer.set_trace_state("k", "outer").unwrap();

            tracer.in_span("inner", || {
                // the child mutates its own copy
                tracer.set_trace_state("k", "inner").unwrap();
                tracer.delete_trace_state("k").unwrap();
            });

            assert_eq!(tracer.trace_state().unwrap().get("k"), Some("outer"));
        });
    }

    #[test]
    fn exit_restores_the_exact_previous_binding() {
        let tracer = Tracer::new();
        tracer.in_span("outer", || {
            let outer = tracer.trace().unwrap();
            let outer_span = tracer.span_id().unwrap();

            tracer.in_span("inner", || ());

            assert_eq!(tracer.trace().unwrap(), outer);
            assert_eq!(tracer.span_id().unwrap(), outer_span);
        });
        assert!(!tracer.is_in_span());
    }

    #[test]
    fn panic_in_nested_span_restores_the_outer_binding() {
        let tracer = Tracer::new();
        tracer.in_span("outer", || {
            let outer_span = tracer.span_id().unwrap();

            let result = catch_unwind(AssertUnwindSafe(|| {
                tracer.in_span("inner", || panic!("boom"))
            }));
            assert!(result.is_err());

            assert_eq!(tracer.span_id().unwrap(), outer_span);
        });
        assert!(!tracer.is_in_span());
    }

    #[test]
    fn concurrent_spans_are_isolated() {
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |tag: &'static str, writes: bool, barrier: Arc<Barrier>| {
            thread::spawn(move || {
                let tracer = Tracer::new();
                tracer.in_span(tag, || {
                    if writes {
                        tracer.set_context_data(tag).unwrap();
                        tracer.set_trace_state("owner", tag).unwrap();
                    }
                    barrier.wait(); // both spans are now active
                    if writes {
                        let data = tracer.context_data().unwrap().unwrap();
                        assert_eq!(data.downcast_ref::<&str>(), Some(&tag));
                    } else {
                        assert!(tracer.context_data().unwrap().is_none());
                        assert!(tracer.trace_state().unwrap().is_empty());
                    }
                    barrier.wait();
                    tracer.trace().unwrap().trace_id
                })
            })
        };

        let writer = spawn("writer", true, barrier.clone());
        let reader = spawn("reader", false, barrier);

        let writer_trace = writer.join().unwrap();
        let reader_trace = reader.join().unwrap();
        assert_ne!(writer_trace, reader_trace);
    }
}
