//! Message events and their decoded forms.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::time::Time;

/// A topic discovered on a source. Immutable once discovered; the set of
/// known topics may grow while a streaming source is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub schema_name: String,
}

impl Topic {
    pub fn new(name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self { name: name.into(), schema_name: schema_name.into() }
    }
}

/// Schema metadata a source reports for one schema name. The hash changes
/// when the schema text changes, which invalidates cached decoders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub hash: u64,
    pub text: String,
}

/// Identity of one raw message, unique for the lifetime of the process.
///
/// The parsed-message cache keys decoded values by this id instead of by the
/// raw bytes, so re-decoding an equal-but-distinct message is possible and
/// expected. Acts as the arena handle for identity-keyed association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

impl MessageId {
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A decoded message value. Decoders produce this dynamic representation so
/// consumers can inspect messages without knowing the wire schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<ParsedValue>),
    Record(Vec<(String, ParsedValue)>),
}

/// Payload of a message event: raw bytes straight off the source, or the
/// decoded value produced by a decoder.
#[derive(Debug, Clone)]
pub enum MessagePayload {
    Raw(Arc<[u8]>),
    Parsed(Arc<ParsedValue>),
}

/// One record read from a source.
///
/// Within one source, `receive_time` is monotonically non-decreasing.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub topic: String,
    pub receive_time: Time,
    pub publish_time: Time,
    pub payload: MessagePayload,
    pub size_in_bytes: usize,
    pub id: MessageId,
}

impl MessageEvent {
    /// Build a raw message event with a fresh identity.
    pub fn raw(topic: impl Into<String>, receive_time: Time, bytes: Vec<u8>) -> Self {
        let size_in_bytes = bytes.len();
        Self {
            topic: topic.into(),
            receive_time,
            publish_time: receive_time,
            payload: MessagePayload::Raw(Arc::from(bytes)),
            size_in_bytes,
            id: MessageId::next(),
        }
    }

    /// Copy of this event carrying `value` as its payload. Identity and
    /// timestamps are preserved.
    pub fn with_parsed(&self, value: Arc<ParsedValue>) -> Self {
        Self { payload: MessagePayload::Parsed(value), ..self.clone() }
    }

    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            MessagePayload::Raw(bytes) => Some(bytes),
            MessagePayload::Parsed(_) => None,
        }
    }

    pub fn parsed_value(&self) -> Option<&ParsedValue> {
        match &self.payload {
            MessagePayload::Raw(_) => None,
            MessagePayload::Parsed(value) => Some(value),
        }
    }
}
