//! Implicit propagation of a trace identity through a call tree.
//!
//! A caller opens a named span around a unit of work with
//! [`Tracer::in_span`]; any code reachable from that unit of work, however
//! deep, can read the active trace identity, mutate its trace state and
//! payload data, and derive the record to hand to a downstream callee —
//! without a context value being threaded through every signature.
//!
//! ```
//! use tracescope::Tracer;
//!
//! fn deep_inside_the_call_tree(tracer: &Tracer) -> String {
//!     // header for an outgoing request, naming the current span as parent
//!     tracer.child_trace_header().unwrap()
//! }
//!
//! let tracer = Tracer::new();
//! let header = tracer.in_span("handle-request", || {
//!     deep_inside_the_call_tree(&tracer)
//! });
//! assert!(header.contains('-'));
//! assert!(!tracer.is_in_span());
//! ```
//!
//! Accessing trace data with no span on the call stack is a programming
//! error and every accessor reports it as [`NotInSpanError`].

mod span_context;
mod tracer;

pub use self::{
    span_context::{ContextData, ContextSeed, Trace, TraceContext, TraceState},
    tracer::Tracer,
};

use thiserror::Error;

/// Result type for operations that require an active span.
pub type TraceResult<T> = Result<T, NotInSpanError>;

/// Error returned when trace data is accessed with no span bound on the
/// current execution branch.
///
/// Carries no further diagnostics: guard call sites with
/// [`Tracer::is_in_span`] or make sure they run inside
/// [`Tracer::in_span`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no trace span is active on this execution branch")]
pub struct NotInSpanError;

/// Error returned when a trace or trace-state header fails to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseHeaderError {
    /// The header did not have the four dash-joined fields.
    #[error("expected `version-traceid-parentid-flags`, got {0} fields")]
    FieldCount(usize),

    /// The version field was not a hex byte.
    #[error("invalid version field")]
    Version,

    /// The trace id field was not 32 lowercase hex characters.
    #[error("invalid trace id field")]
    TraceId,

    /// The parent id field was not 16 or 32 lowercase hex characters.
    #[error("invalid parent id field")]
    ParentId,

    /// The flags field was not a hex byte.
    #[error("invalid trace flags field")]
    TraceFlags,

    /// A trace state list member was not a `key=value` pair.
    #[error("`{0}` is not a `key=value` trace state entry")]
    TraceStateEntry(String),
}
