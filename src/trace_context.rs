use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::num::ParseIntError;
use std::ops::BitAnd;

thread_local! {
    /// Per-thread CSPRNG used for id generation.
    static CURRENT_RNG: RefCell<rngs::StdRng> = RefCell::new(rngs::StdRng::from_entropy());
}

/// Flags carried alongside a trace, rendered as the final field of a trace
/// header.
///
/// The engine treats the flags as opaque; the only bit with a defined
/// meaning is [`TraceFlags::SAMPLED`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Copy, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// Flags with the `sampled` bit cleared.
    pub const NOT_SAMPLED: TraceFlags = TraceFlags(0x00);

    /// Flags with the `sampled` bit set.
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    /// Construct flags from a raw byte.
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Returns `true` if the `sampled` bit is set.
    pub fn is_sampled(&self) -> bool {
        (*self & TraceFlags::SAMPLED) == TraceFlags::SAMPLED
    }

    /// Returns the flags as a `u8`.
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl BitAnd for TraceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 16-byte identifier shared by every span of one trace.
///
/// Renders as exactly 32 lowercase hex characters. The all-zero value is
/// reserved as [`TraceId::INVALID`].
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The reserved all-zero trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Generate a fresh trace id from 16 cryptographically random bytes.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| TraceId(rng.borrow_mut().gen::<u128>()))
    }

    /// Create a trace id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return this trace id as a big-endian byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Parse a base-16 string into a trace id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte identifier for a single span.
///
/// Renders as exactly 16 lowercase hex characters. The all-zero value is
/// reserved as [`SpanId::INVALID`], the "no parent span" sentinel.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The reserved all-zero span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Generate a fresh span id from 8 cryptographically random bytes.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| SpanId(rng.borrow_mut().gen::<u64>()))
    }

    /// Create a span id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Return this span id as a big-endian byte array.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse a base-16 string into a span id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// The parent linkage recorded in a trace context.
///
/// Root spans carry the invalid sentinel. Spans seeded from an inbound
/// header carry the caller's span id. Spans nested inside another span keep
/// their parent linkage through the enclosing *trace* id; span-id linkage
/// for downstream callees is produced separately by
/// [`child_trace`](crate::Tracer::child_trace).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentId {
    /// No parent; renders as the all-zero span id sentinel.
    Invalid,
    /// A genuine parent span id.
    Span(SpanId),
    /// Linkage through a trace id, as recorded for nested spans.
    Trace(TraceId),
}

impl ParentId {
    /// Returns `true` unless this is the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        !matches!(self, ParentId::Invalid)
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentId::Invalid => SpanId::INVALID.fmt(f),
            ParentId::Span(id) => id.fmt(f),
            ParentId::Trace(id) => id.fmt(f),
        }
    }
}

impl fmt::Debug for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<SpanId> for ParentId {
    fn from(id: SpanId) -> Self {
        if id == SpanId::INVALID {
            ParentId::Invalid
        } else {
            ParentId::Span(id)
        }
    }
}
