//! Implicit W3C-style trace context propagation for scoped units of work.
//!
//! `tracescope` carries a distributed-tracing identity through a call tree
//! without threading a context value through every function signature. A
//! caller opens a named span around a unit of work; inside that unit, any
//! code — including code many call levels deep — can query the active
//! trace, read and write trace-state key-value pairs, attach payload data,
//! and derive the child record to propagate to a downstream call.
//!
//! # Getting started
//!
//! ```
//! use tracescope::Tracer;
//!
//! let tracer = Tracer::new();
//! tracer.in_span("handle-request", || {
//!     // visible to everything this unit of work invokes
//!     tracer.set_trace_state("tenant", "acme").unwrap();
//!
//!     // `version-traceid-parentid-flags`, e.g. for an outgoing header,
//!     // naming this span as the callee's parent
//!     let outgoing = tracer.child_trace_header().unwrap();
//!     assert_eq!(outgoing.split('-').count(), 4);
//! });
//! ```
//!
//! # Resuming an inbound trace
//!
//! ```
//! use tracescope::{ContextSeed, Trace, Tracer};
//!
//! let inbound: Trace = "0-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-1"
//!     .parse()
//!     .unwrap();
//!
//! let tracer = Tracer::new();
//! tracer.in_span_with_seed("continue", ContextSeed::from(inbound), || {
//!     assert_eq!(tracer.trace().unwrap().trace_id, inbound.trace_id);
//! });
//! ```
//!
//! # Async
//!
//! The binding is per logical execution branch, not per OS thread alone:
//! wrap a future with [`Tracer::span_future`] (or [`FutureExt`]) and its
//! context follows it across `await` points and worker threads, invisible
//! to sibling tasks.
//!
//! ```
//! use tracescope::Tracer;
//!
//! # async fn example() {
//! let tracer = Tracer::new();
//! let span_id = tracer
//!     .span_future("background", async {
//!         Tracer::new().span_id().unwrap()
//!     })
//!     .await;
//! # }
//! ```

#![warn(missing_docs)]

mod context;
pub mod trace;
mod trace_context;

pub use context::{FutureExt, WithContext};
pub use trace::{
    ContextData, ContextSeed, NotInSpanError, ParseHeaderError, Trace, TraceContext, TraceResult,
    TraceState, Tracer,
};
pub use trace_context::{ParentId, SpanId, TraceFlags, TraceId};
