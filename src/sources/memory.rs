//! In-memory source over a pre-built recording.
//!
//! Useful as a sample data source and as the workhorse of the test suite.
//! Messages are held sorted by receive time; iteration and backfill are
//! simple scans. An optional artificial latency simulates a slow medium so
//! buffering behavior can be exercised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::debug;

use crate::Result;
use crate::source::{
    BackfillArgs, Initialization, IterableSource, MessageIteratorArgs, SourceItem, SourceIterator,
};
use crate::types::{MessageEvent, SchemaInfo, Time, Topic, TopicStats};

/// Builder for [`MemorySource`].
#[derive(Debug, Default)]
pub struct MemorySourceBuilder {
    topics: Vec<Topic>,
    schemas: HashMap<String, SchemaInfo>,
    messages: Vec<Arc<MessageEvent>>,
    range: Option<(Time, Time)>,
    latency: Duration,
}

impl MemorySourceBuilder {
    pub fn topic(mut self, name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        self.topics.push(Topic::new(name, schema_name));
        self
    }

    pub fn schema(
        mut self,
        name: impl Into<String>,
        hash: u64,
        text: impl Into<String>,
    ) -> Self {
        self.schemas.insert(name.into(), SchemaInfo { hash, text: text.into() });
        self
    }

    pub fn message(mut self, message: MessageEvent) -> Self {
        self.messages.push(Arc::new(message));
        self
    }

    pub fn raw_message(self, topic: impl Into<String>, at: Time, bytes: Vec<u8>) -> Self {
        self.message(MessageEvent::raw(topic, at, bytes))
    }

    /// Override the recording bounds instead of deriving them from messages.
    pub fn range(mut self, start: Time, end: Time) -> Self {
        self.range = Some((start, end));
        self
    }

    /// Artificial delay before initialize, iterator, and backfill responses.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(mut self) -> MemorySource {
        self.messages.sort_by_key(|m| m.receive_time);

        let (start, end) = self.range.unwrap_or_else(|| {
            let start = self.messages.first().map(|m| m.receive_time).unwrap_or_default();
            let end = self.messages.last().map(|m| m.receive_time).unwrap_or_default();
            (start, end)
        });

        MemorySource {
            topics: self.topics,
            schemas: self.schemas,
            messages: Arc::new(self.messages),
            start,
            end,
            latency: self.latency,
        }
    }
}

/// An [`IterableSource`] serving a recording held entirely in memory.
pub struct MemorySource {
    topics: Vec<Topic>,
    schemas: HashMap<String, SchemaInfo>,
    messages: Arc<Vec<Arc<MessageEvent>>>,
    start: Time,
    end: Time,
    latency: Duration,
}

impl MemorySource {
    pub fn builder() -> MemorySourceBuilder {
        MemorySourceBuilder::default()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait::async_trait]
impl IterableSource for MemorySource {
    async fn initialize(&self) -> Result<Initialization> {
        self.simulate_latency().await;

        let mut topic_stats: HashMap<String, TopicStats> = HashMap::new();
        for msg in self.messages.iter() {
            let stats = topic_stats.entry(msg.topic.clone()).or_default();
            stats.num_messages += 1;
            if stats.first_message_time.is_none() {
                stats.first_message_time = Some(msg.receive_time);
            }
            stats.last_message_time = Some(msg.receive_time);
        }

        debug!(
            topics = self.topics.len(),
            messages = self.messages.len(),
            "memory source initialized"
        );

        Ok(Initialization {
            start: self.start,
            end: self.end,
            topics: self.topics.clone(),
            schemas: self.schemas.clone(),
            topic_stats,
            problems: Vec::new(),
        })
    }

    fn message_iterator(&self, args: MessageIteratorArgs) -> SourceIterator {
        let start = args.start.unwrap_or(self.start).clamp_to(self.start, self.end);
        let end = args.end.unwrap_or(self.end).clamp_to(self.start, self.end);
        let latency = self.latency;

        let mut items: Vec<Result<SourceItem>> = self
            .messages
            .iter()
            .filter(|m| {
                args.topics.contains_key(&m.topic)
                    && m.receive_time >= start
                    && m.receive_time <= end
            })
            .map(|m| Ok(SourceItem::Message(m.clone())))
            .collect();

        // Trailing stamp lets playback advance to the range end even when no
        // message lands there.
        items.push(Ok(SourceItem::Stamp(end)));

        futures::stream::once(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            futures::stream::iter(items)
        })
        .flatten()
        .boxed()
    }

    async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<Arc<MessageEvent>>> {
        self.simulate_latency().await;

        let mut out: Vec<Arc<MessageEvent>> = args
            .topics
            .keys()
            .filter_map(|topic| {
                self.messages
                    .iter()
                    .rev()
                    .find(|m| &m.topic == topic && m.receive_time <= args.time)
                    .cloned()
            })
            .collect();
        out.sort_by_key(|m| m.receive_time);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscribePayload;
    use std::collections::BTreeMap;

    fn selection(topics: &[&str]) -> BTreeMap<String, SubscribePayload> {
        topics.iter().map(|t| (t.to_string(), SubscribePayload::partial(*t))).collect()
    }

    fn source() -> MemorySource {
        MemorySource::builder()
            .topic("/a", "test.A")
            .topic("/b", "test.B")
            .raw_message("/a", Time::from_secs(1), vec![1])
            .raw_message("/b", Time::from_secs(2), vec![2])
            .raw_message("/a", Time::from_secs(3), vec![3])
            .raw_message("/a", Time::from_secs(8), vec![4])
            .range(Time::ZERO, Time::from_secs(10))
            .build()
    }

    #[tokio::test]
    async fn initialize_reports_bounds_and_stats() {
        let init = source().initialize().await.unwrap();
        assert_eq!(init.start, Time::ZERO);
        assert_eq!(init.end, Time::from_secs(10));
        assert_eq!(init.topic_stats["/a"].num_messages, 3);
        assert_eq!(init.topic_stats["/b"].num_messages, 1);
        assert_eq!(init.topic_stats["/a"].first_message_time, Some(Time::from_secs(1)));
    }

    #[tokio::test]
    async fn iterator_filters_topics_and_range() {
        let src = source();
        let args = MessageIteratorArgs {
            topics: selection(&["/a"]),
            start: Some(Time::from_secs(2)),
            end: None,
        };
        let items: Vec<_> = src.message_iterator(args).collect().await;

        let times: Vec<i64> = items
            .iter()
            .filter_map(|r| match r.as_ref().unwrap() {
                SourceItem::Message(m) => Some(m.receive_time.sec),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![3, 8]);

        // Last item is the trailing stamp at the range end.
        assert!(matches!(
            items.last().unwrap().as_ref().unwrap(),
            SourceItem::Stamp(t) if *t == Time::from_secs(10)
        ));
    }

    #[tokio::test]
    async fn backfill_returns_latest_at_or_before_time() {
        let src = source();
        let msgs = src
            .get_backfill_messages(BackfillArgs {
                topics: selection(&["/a", "/b"]),
                time: Time::from_secs(5),
            })
            .await
            .unwrap();

        assert_eq!(msgs.len(), 2);
        let by_topic: BTreeMap<&str, i64> =
            msgs.iter().map(|m| (m.topic.as_str(), m.receive_time.sec)).collect();
        assert_eq!(by_topic["/a"], 3);
        assert_eq!(by_topic["/b"], 2);
    }

    #[tokio::test]
    async fn backfill_skips_topics_with_no_earlier_message() {
        let src = source();
        let msgs = src
            .get_backfill_messages(BackfillArgs {
                topics: selection(&["/b"]),
                time: Time::from_secs(1),
            })
            .await
            .unwrap();
        assert!(msgs.is_empty());
    }
}
