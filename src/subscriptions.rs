//! Consumer subscription tracking and coalescing.
//!
//! Many consumers (panels, plots, computed-topic pipelines) each submit
//! their own subscription list; sources and the block loader want one
//! deduplicated per-topic selection. This module owns that reduction,
//! including the rewrite of virtual topics to the real input topics their
//! pipelines read.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{PreloadType, SubscribePayload, TopicSelection};

#[derive(Default)]
struct Inner {
    by_consumer: BTreeMap<String, Vec<SubscribePayload>>,
    /// Virtual topic name to the real input topics its pipeline reads.
    virtual_topics: BTreeMap<String, Vec<String>>,
    coalesced: Arc<Vec<SubscribePayload>>,
}

/// Tracks per-consumer subscriptions and maintains the coalesced view.
#[derive(Default)]
pub struct SubscriptionManager {
    inner: RwLock<Inner>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `consumer_id`'s subscription list wholesale.
    ///
    /// Returns true when the coalesced view changed.
    pub fn set_subscriptions(
        &self,
        consumer_id: impl Into<String>,
        payloads: Vec<SubscribePayload>,
    ) -> bool {
        let consumer_id = consumer_id.into();
        let mut inner = self.inner.write();
        debug!(consumer = %consumer_id, count = payloads.len(), "subscriptions replaced");
        inner.by_consumer.insert(consumer_id, payloads);
        Self::recompute(&mut inner)
    }

    /// Drop a consumer and everything it subscribed to.
    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.by_consumer.remove(consumer_id).is_none() {
            return false;
        }
        Self::recompute(&mut inner)
    }

    /// Declare `name` as a virtual topic computed from `inputs`.
    ///
    /// Subscriptions naming it are rewritten to whole-message subscriptions
    /// on the inputs, at the same preload level. Re-registering replaces the
    /// input list.
    pub fn register_virtual_topic(
        &self,
        name: impl Into<String>,
        inputs: Vec<String>,
    ) -> bool {
        let mut inner = self.inner.write();
        inner.virtual_topics.insert(name.into(), inputs);
        Self::recompute(&mut inner)
    }

    pub fn unregister_virtual_topic(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.virtual_topics.remove(name).is_none() {
            return false;
        }
        Self::recompute(&mut inner)
    }

    /// The coalesced subscription list, sorted by topic then preload type.
    pub fn coalesced(&self) -> Arc<Vec<SubscribePayload>> {
        self.inner.read().coalesced.clone()
    }

    /// Selection for the playback iterator and backfills: every subscribed
    /// topic at its strongest form.
    pub fn playback_selection(&self) -> TopicSelection {
        let inner = self.inner.read();
        let mut selection = TopicSelection::new();
        for payload in inner.coalesced.iter() {
            selection
                .entry(payload.topic.clone())
                .and_modify(|existing| {
                    existing.preload_type = existing.preload_type.max(payload.preload_type);
                    existing.fields = merge_fields(existing.fields.take(), payload.fields.clone());
                })
                .or_insert_with(|| payload.clone());
        }
        selection
    }

    /// Selection for the block preloader: full-preload entries only.
    pub fn preload_selection(&self) -> TopicSelection {
        let inner = self.inner.read();
        inner
            .coalesced
            .iter()
            .filter(|payload| payload.preload_type == PreloadType::Full)
            .map(|payload| (payload.topic.clone(), payload.clone()))
            .collect()
    }

    fn recompute(inner: &mut Inner) -> bool {
        // Expand virtual topics first. A pipeline reads whole input messages
        // regardless of which output fields its subscriber sliced.
        let mut expanded: Vec<SubscribePayload> = Vec::new();
        for payload in inner.by_consumer.values().flatten() {
            match inner.virtual_topics.get(&payload.topic) {
                Some(inputs) => {
                    for input in inputs {
                        expanded.push(SubscribePayload {
                            topic: input.clone(),
                            preload_type: payload.preload_type,
                            fields: None,
                        });
                    }
                }
                None => expanded.push(payload.clone()),
            }
        }

        // Group by (topic, preload): a sliced request only merges with
        // another sliced one at the same level.
        let mut groups: BTreeMap<(String, PreloadType), SubscribePayload> = BTreeMap::new();
        for payload in expanded {
            groups
                .entry((payload.topic.clone(), payload.preload_type))
                .and_modify(|existing| {
                    existing.fields = merge_fields(existing.fields.take(), payload.fields.clone());
                })
                .or_insert(payload);
        }

        // Cross-level pass: when the partial and full entries of a topic are
        // shaped alike (both whole, or both sliced), the full one subsumes
        // the partial. A whole-message partial next to a sliced full stays
        // split, because collapsing would widen the preload read.
        let mut coalesced: Vec<SubscribePayload> = Vec::new();
        let mut by_topic: BTreeMap<String, Vec<SubscribePayload>> = BTreeMap::new();
        for (_, payload) in groups {
            by_topic.entry(payload.topic.clone()).or_default().push(payload);
        }
        for (_, mut payloads) in by_topic {
            if payloads.len() == 2 && payloads[0].is_sliced() == payloads[1].is_sliced() {
                let partial = payloads.remove(0);
                let mut full = payloads.remove(0);
                full.fields = merge_fields(full.fields, partial.fields);
                coalesced.push(full);
            } else {
                coalesced.append(&mut payloads);
            }
        }

        let coalesced = Arc::new(coalesced);
        let changed = *coalesced != *inner.coalesced;
        inner.coalesced = coalesced;
        changed
    }
}

/// Merge field slices: any whole-message request wins, otherwise union.
fn merge_fields(
    a: Option<BTreeSet<String>>,
    b: Option<BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(&b).cloned().collect()),
        _ => None,
    }
}
