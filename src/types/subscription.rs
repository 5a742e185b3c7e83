//! Subscription payloads submitted by consumers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Whether a subscription wants the whole recording preloaded for the topic
/// (`Full`) or only data around the playback cursor (`Partial`).
///
/// Ordered so that `Full > Partial`; coalescing is an upgrade-only merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreloadType {
    Partial,
    Full,
}

/// One consumer's request for a topic.
///
/// `fields: None` asks for the whole message. `fields: Some(..)` is a sliced
/// read and only ever an optimization: whole-message is a strict superset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
    pub preload_type: PreloadType,
    pub fields: Option<BTreeSet<String>>,
}

impl SubscribePayload {
    pub fn partial(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), preload_type: PreloadType::Partial, fields: None }
    }

    pub fn full(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), preload_type: PreloadType::Full, fields: None }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_sliced(&self) -> bool {
        self.fields.is_some()
    }
}

/// A per-topic selection handed to sources and the block loader: at most one
/// payload per topic name.
pub type TopicSelection = BTreeMap<String, SubscribePayload>;
