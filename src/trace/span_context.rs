use crate::trace::ParseHeaderError;
use crate::{ParentId, SpanId, TraceFlags, TraceId};
use std::any::Any;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Arbitrary host payload attached to a trace context.
///
/// Opaque to the engine; callers downcast it back to their own type.
pub type ContextData = Arc<dyn Any + Send + Sync>;

/// Auxiliary key-value pairs carried alongside a trace.
///
/// Keys are unique; entries keep their insertion order. This is a
/// simplified, flat mapping: keys and values are not validated against the
/// W3C list-member grammar, and no escaping is applied to `=` or `,` when
/// serializing.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TraceState(Option<VecDeque<(String, String)>>);

impl TraceState {
    /// The empty `TraceState`, as a constant.
    pub const NONE: TraceState = TraceState(None);

    /// Build a `TraceState` from a key-value collection.
    ///
    /// Later duplicates overwrite earlier ones.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracescope::TraceState;
    ///
    /// let state = TraceState::from_key_value([("foo", "bar"), ("apple", "banana")]);
    /// assert_eq!(state.header(), "foo=bar,apple=banana");
    /// ```
    pub fn from_key_value<T, K, V>(pairs: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut state = TraceState::NONE;
        for (key, value) in pairs {
            state.set(key, value);
        }
        state
    }

    /// Retrieve the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.as_ref().and_then(|kvs| {
            kvs.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        })
    }

    /// Set `key` to `value`, creating the entry if absent.
    ///
    /// An overwritten key keeps its position in the serialization order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        let kvs = self.0.get_or_insert_with(|| VecDeque::with_capacity(1));
        match kvs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => kvs.push_back((key, value)),
        }
    }

    /// Remove `key` if present; absent keys are ignored.
    pub fn delete(&mut self, key: &str) {
        if let Some(kvs) = self.0.as_mut() {
            if let Some(index) = kvs.iter().position(|(k, _)| k == key) {
                kvs.remove(index);
            }
        }
    }

    /// Returns `true` if the state carries no entries.
    pub fn is_empty(&self) -> bool {
        self.0.as_ref().map_or(true, VecDeque::is_empty)
    }

    /// Iterate over the entries in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize as comma-joined `key=value` pairs in iteration order.
    ///
    /// Empty state serializes to the empty string.
    pub fn header(&self) -> String {
        self.iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<String>>()
            .join(",")
    }
}

impl FromStr for TraceState {
    type Err = ParseHeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = TraceState::NONE;
        for member in s.split_terminator(',') {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            match member.split_once('=') {
                Some((key, value)) => state.set(key, value),
                None => return Err(ParseHeaderError::TraceStateEntry(member.to_string())),
            }
        }
        Ok(state)
    }
}

/// The externally visible identity of a trace: what propagation and logging
/// call sites are allowed to see.
///
/// Renders to and parses from the four-field dash-joined header layout,
/// `version-traceid-parentid-flags`, with version and flags in natural
/// (unpadded) hexadecimal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Trace {
    /// Identifier shared by all spans of this trace.
    pub trace_id: TraceId,
    /// Header format version.
    pub version: u8,
    /// Linkage to the span that caused this one to exist.
    pub parent_id: ParentId,
    /// Flags rendered as the final header field.
    pub trace_flags: TraceFlags,
}

impl Trace {
    /// Render this trace as a `version-traceid-parentid-flags` header.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracescope::{ParentId, Trace, TraceFlags, TraceId};
    ///
    /// let trace = Trace {
    ///     trace_id: TraceId::from(0x42),
    ///     version: 0,
    ///     parent_id: ParentId::Invalid,
    ///     trace_flags: TraceFlags::SAMPLED,
    /// };
    /// assert_eq!(
    ///     trace.header(),
    ///     "0-00000000000000000000000000000042-0000000000000000-1",
    /// );
    /// ```
    pub fn header(&self) -> String {
        format!(
            "{:x}-{}-{}-{:x}",
            self.version, self.trace_id, self.parent_id, self.trace_flags
        )
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{}-{}-{:x}",
            self.version, self.trace_id, self.parent_id, self.trace_flags
        )
    }
}

fn is_lower_hex(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl FromStr for Trace {
    type Err = ParseHeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split_terminator('-').collect();
        if parts.len() != 4 {
            return Err(ParseHeaderError::FieldCount(parts.len()));
        }

        let version =
            u8::from_str_radix(parts[0], 16).map_err(|_| ParseHeaderError::Version)?;

        if parts[1].len() != 32 || !is_lower_hex(parts[1]) {
            return Err(ParseHeaderError::TraceId);
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| ParseHeaderError::TraceId)?;

        // The parent field is disambiguated by width: a 16-char field is a
        // span id (all zeros being the sentinel), a 32-char field is the
        // trace-id linkage produced for nested spans.
        if !is_lower_hex(parts[2]) {
            return Err(ParseHeaderError::ParentId);
        }
        let parent_id = match parts[2].len() {
            16 => SpanId::from_hex(parts[2])
                .map_err(|_| ParseHeaderError::ParentId)?
                .into(),
            32 => ParentId::Trace(
                TraceId::from_hex(parts[2]).map_err(|_| ParseHeaderError::ParentId)?,
            ),
            _ => return Err(ParseHeaderError::ParentId),
        };

        let trace_flags = TraceFlags::new(
            u8::from_str_radix(parts[3], 16).map_err(|_| ParseHeaderError::TraceFlags)?,
        );

        Ok(Trace {
            trace_id,
            version,
            parent_id,
            trace_flags,
        })
    }
}

/// The fields a caller may supply when building a trace context explicitly,
/// e.g. to resume a trace received from an inbound request header.
///
/// Every field passes through to the built context unchanged; a missing
/// `parent_id` becomes the invalid sentinel.
#[derive(Clone)]
pub struct ContextSeed {
    /// Parent linkage; defaults to the invalid sentinel.
    pub parent_id: Option<ParentId>,
    /// Trace identifier to continue under.
    pub trace_id: TraceId,
    /// Header format version.
    pub version: u8,
    /// Trace flags.
    pub trace_flags: TraceFlags,
    /// Trace state to carry.
    pub trace_state: TraceState,
    /// Host payload to attach.
    pub data: Option<ContextData>,
}

impl Default for ContextSeed {
    fn default() -> Self {
        ContextSeed {
            parent_id: None,
            trace_id: TraceId::INVALID,
            version: 0,
            trace_flags: TraceFlags::NOT_SAMPLED,
            trace_state: TraceState::NONE,
            data: None,
        }
    }
}

impl From<Trace> for ContextSeed {
    fn from(trace: Trace) -> Self {
        ContextSeed {
            parent_id: Some(trace.parent_id),
            trace_id: trace.trace_id,
            version: trace.version,
            trace_flags: trace.trace_flags,
            trace_state: TraceState::NONE,
            data: None,
        }
    }
}

impl fmt::Debug for ContextSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSeed")
            .field("parent_id", &self.parent_id)
            .field("trace_id", &self.trace_id)
            .field("version", &self.version)
            .field("trace_flags", &self.trace_flags)
            .field("trace_state", &self.trace_state)
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// The full record bound for the duration of a span.
///
/// Created at span entry, exclusively owned by one logical execution branch
/// for the dynamic extent of the wrapped work, and discarded at span exit.
/// Nested spans receive a new derived record; the parent's record is never
/// mutated by a child.
#[derive(Clone)]
pub struct TraceContext {
    name: Cow<'static, str>,
    span_id: SpanId,
    parent_id: ParentId,
    trace_id: TraceId,
    version: u8,
    trace_flags: TraceFlags,
    trace_state: TraceState,
    data: Option<ContextData>,
}

impl TraceContext {
    /// Build a context from explicitly supplied fields.
    ///
    /// A fresh span id is always generated; a missing `parent_id` becomes
    /// the invalid sentinel; everything else passes through unchanged.
    pub fn new(name: impl Into<Cow<'static, str>>, seed: ContextSeed) -> Self {
        TraceContext {
            name: name.into(),
            span_id: SpanId::random(),
            parent_id: seed.parent_id.unwrap_or(ParentId::Invalid),
            trace_id: seed.trace_id,
            version: seed.version,
            trace_flags: seed.trace_flags,
            trace_state: seed.trace_state,
            data: seed.data,
        }
    }

    /// Synthesize the context for a span with no seed and no enclosing span.
    pub(crate) fn root(name: Cow<'static, str>) -> Self {
        TraceContext {
            name,
            span_id: SpanId::random(),
            parent_id: ParentId::Invalid,
            trace_id: TraceId::random(),
            version: 0,
            trace_flags: TraceFlags::NOT_SAMPLED,
            trace_state: TraceState::NONE,
            data: None,
        }
    }

    /// Derive the context for a span nested inside this one.
    ///
    /// The child keeps the trace identity of its parent and records its
    /// parent linkage through the enclosing *trace* id. Span-id linkage for
    /// downstream callees is produced by [`TraceContext::child_trace`]
    /// instead. Payload data is not inherited.
    pub(crate) fn child(&self, name: Cow<'static, str>) -> Self {
        TraceContext {
            name,
            span_id: SpanId::random(),
            parent_id: ParentId::Trace(self.trace_id),
            trace_id: self.trace_id,
            version: self.version,
            trace_flags: self.trace_flags,
            trace_state: self.trace_state.clone(),
            data: None,
        }
    }

    /// The diagnostic label this span was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This span's own identifier.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The identifier of the trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// This span's parent linkage.
    pub fn parent_id(&self) -> ParentId {
        self.parent_id
    }

    /// The external-facing subset of this context.
    pub fn trace(&self) -> Trace {
        Trace {
            trace_id: self.trace_id,
            version: self.version,
            parent_id: self.parent_id,
            trace_flags: self.trace_flags,
        }
    }

    /// Like [`TraceContext::trace`], but with this span's own id as the
    /// parent linkage: the record to hand to a downstream callee.
    pub fn child_trace(&self) -> Trace {
        Trace {
            trace_id: self.trace_id,
            version: self.version,
            parent_id: ParentId::Span(self.span_id),
            trace_flags: self.trace_flags,
        }
    }

    /// The trace state carried by this span.
    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    pub(crate) fn trace_state_mut(&mut self) -> &mut TraceState {
        &mut self.trace_state
    }

    /// The host payload attached to this span, if any.
    pub fn data(&self) -> Option<&ContextData> {
        self.data.as_ref()
    }

    pub(crate) fn set_data(&mut self, data: ContextData) {
        self.data = Some(data);
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("name", &self.name)
            .field("span_id", &self.span_id)
            .field("parent_id", &self.parent_id)
            .field("trace_id", &self.trace_id)
            .field("version", &self.version)
            .field("trace_flags", &self.trace_flags)
            .field("trace_state", &self.trace_state)
            .field("data", &self.data.is_some())
            .finish()
    }
}
