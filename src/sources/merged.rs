//! Composite source presenting several recordings as one timeline.
//!
//! Initialization is the union of the children's metadata; iteration runs
//! one child iterator per source and feeds them through the k-way merge so
//! the combined stream stays ordered by receive time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::future;
use tracing::warn;

use crate::Result;
use crate::merge::MergedIterator;
use crate::source::{
    BackfillArgs, Initialization, IterableSource, MessageIteratorArgs, SourceItem, SourceIterator,
};
use crate::types::{MessageEvent, Problem, Severity, Time, Topic};

/// An [`IterableSource`] over the union of several child sources.
pub struct MergedSource {
    sources: Vec<Arc<dyn IterableSource>>,
}

impl MergedSource {
    pub fn new(sources: Vec<Arc<dyn IterableSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait::async_trait]
impl IterableSource for MergedSource {
    async fn initialize(&self) -> Result<Initialization> {
        let inits =
            future::join_all(self.sources.iter().map(|source| source.initialize())).await;

        let mut merged = Initialization {
            start: Time::MAX,
            end: Time::ZERO,
            ..Default::default()
        };
        let mut topics_by_name: HashMap<String, Topic> = HashMap::new();

        for init in inits {
            let init = init?;

            merged.start = merged.start.min(init.start);
            merged.end = merged.end.max(init.end);
            merged.problems.extend(init.problems);

            for topic in init.topics {
                match topics_by_name.get(&topic.name) {
                    None => {
                        topics_by_name.insert(topic.name.clone(), topic);
                    }
                    Some(existing) if existing.schema_name != topic.schema_name => {
                        warn!(
                            topic = %topic.name,
                            first = %existing.schema_name,
                            second = %topic.schema_name,
                            "same topic with conflicting schemas across sources"
                        );
                        merged.problems.push(Problem::warn(
                            format!("duplicate-topic:{}", topic.name),
                            format!(
                                "topic {} appears with schemas {} and {}; using {}",
                                topic.name, existing.schema_name, topic.schema_name,
                                existing.schema_name
                            ),
                        ));
                    }
                    Some(_) => {}
                }
            }

            for (name, schema) in init.schemas {
                merged.schemas.entry(name).or_insert(schema);
            }

            for (topic, stats) in init.topic_stats {
                let merged_stats = merged.topic_stats.entry(topic).or_default();
                merged_stats.num_messages += stats.num_messages;
                merged_stats.first_message_time =
                    match (merged_stats.first_message_time, stats.first_message_time) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                merged_stats.last_message_time =
                    match (merged_stats.last_message_time, stats.last_message_time) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
            }
        }

        if merged.start > merged.end {
            // No sources, or all empty.
            merged.start = Time::ZERO;
            merged.end = Time::ZERO;
        }

        merged.topics = topics_by_name.into_values().collect();
        merged.topics.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(merged)
    }

    fn message_iterator(&self, args: MessageIteratorArgs) -> SourceIterator {
        // Child errors are folded into the merged timeline as problem items
        // so one failing source does not tear down the others.
        let iterators: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                source
                    .message_iterator(args.clone())
                    .map(|item| match item {
                        Ok(item) => item,
                        Err(err) => {
                            let severity = if err.is_retryable() {
                                Severity::Warn
                            } else {
                                Severity::Error
                            };
                            SourceItem::Problem(Problem {
                                id: "source-iteration".to_string(),
                                severity,
                                message: err.to_string(),
                                tip: None,
                            })
                        }
                    })
                    .boxed()
            })
            .collect();

        futures::stream::once(async move {
            MergedIterator::new(iterators).await.into_stream()
        })
        .flatten()
        .map(Ok)
        .boxed()
    }

    async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<Arc<MessageEvent>>> {
        let results = future::join_all(
            self.sources.iter().map(|source| source.get_backfill_messages(args.clone())),
        )
        .await;

        // Keep only the latest message per topic across all children.
        let mut latest: HashMap<String, Arc<MessageEvent>> = HashMap::new();
        for result in results {
            for msg in result? {
                match latest.get(&msg.topic) {
                    Some(existing) if existing.receive_time >= msg.receive_time => {}
                    _ => {
                        latest.insert(msg.topic.clone(), msg);
                    }
                }
            }
        }

        let mut out: Vec<Arc<MessageEvent>> = latest.into_values().collect();
        out.sort_by_key(|m| m.receive_time);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemorySource;
    use crate::types::{SubscribePayload, TopicSelection};

    fn selection(topics: &[&str]) -> TopicSelection {
        topics.iter().map(|t| (t.to_string(), SubscribePayload::partial(*t))).collect()
    }

    fn merged() -> MergedSource {
        let first = MemorySource::builder()
            .topic("/a", "test.A")
            .raw_message("/a", Time::from_secs(1), vec![1])
            .raw_message("/a", Time::from_secs(5), vec![2])
            .range(Time::ZERO, Time::from_secs(6))
            .build();
        let second = MemorySource::builder()
            .topic("/b", "test.B")
            .raw_message("/b", Time::from_secs(3), vec![3])
            .raw_message("/b", Time::from_secs(9), vec![4])
            .range(Time::from_secs(2), Time::from_secs(10))
            .build();
        MergedSource::new(vec![Arc::new(first), Arc::new(second)])
    }

    #[tokio::test]
    async fn initialize_unions_bounds_and_topics() {
        let init = merged().initialize().await.unwrap();
        assert_eq!(init.start, Time::ZERO);
        assert_eq!(init.end, Time::from_secs(10));

        let names: Vec<&str> = init.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["/a", "/b"]);
        assert!(init.problems.is_empty());
    }

    #[tokio::test]
    async fn conflicting_schemas_produce_a_problem() {
        let first = MemorySource::builder().topic("/x", "test.A").build();
        let second = MemorySource::builder().topic("/x", "test.B").build();
        let merged = MergedSource::new(vec![Arc::new(first), Arc::new(second)]);

        let init = merged.initialize().await.unwrap();
        assert_eq!(init.topics.len(), 1);
        assert_eq!(init.topics[0].schema_name, "test.A");
        assert_eq!(init.problems.len(), 1);
        assert_eq!(init.problems[0].id, "duplicate-topic:/x");
    }

    #[tokio::test]
    async fn iterator_interleaves_children_in_time_order() {
        let args = MessageIteratorArgs {
            topics: selection(&["/a", "/b"]),
            start: None,
            end: None,
        };
        let items: Vec<_> = merged().message_iterator(args).collect().await;

        let times: Vec<i64> = items
            .iter()
            .filter_map(|r| match r.as_ref().unwrap() {
                SourceItem::Message(m) => Some(m.receive_time.sec),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![1, 3, 5, 9]);
    }

    #[tokio::test]
    async fn backfill_takes_latest_per_topic_across_children() {
        let overlap_a = MemorySource::builder()
            .topic("/a", "test.A")
            .raw_message("/a", Time::from_secs(2), vec![1])
            .build();
        let overlap_b = MemorySource::builder()
            .topic("/a", "test.A")
            .raw_message("/a", Time::from_secs(4), vec![2])
            .build();
        let merged = MergedSource::new(vec![Arc::new(overlap_a), Arc::new(overlap_b)]);

        let msgs = merged
            .get_backfill_messages(BackfillArgs {
                topics: selection(&["/a"]),
                time: Time::from_secs(5),
            })
            .await
            .unwrap();

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].receive_time, Time::from_secs(4));
    }
}
