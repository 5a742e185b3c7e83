//! Cache of decoded message values keyed by message identity.
//!
//! Decoding is the expensive step of playback; scrubbing back and forth over
//! the same region would otherwise decode the same raw bytes repeatedly.
//! Entries are grouped into time buckets so that eviction discards whole
//! regions of the timeline at once, oldest-accessed first, instead of
//! punching random holes in a region the user is actively viewing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::decoders::Decoder;
use crate::problems::ProblemManager;
use crate::types::{MessageEvent, MessageId, ParsedValue, Problem, Time};

/// Default cache budget. Decoded values are typically a small multiple of the
/// raw bytes, so this tracks the raw sizes and accepts the approximation.
pub const DEFAULT_PARSED_CACHE_BYTES: usize = 200 * 1024 * 1024;

const BUCKET_NANOS: i128 = 100_000_000;

#[derive(Default)]
struct Bucket {
    entries: HashMap<MessageId, Arc<ParsedValue>>,
    size_in_bytes: usize,
    last_access: u64,
}

/// Shared cache of decoded values, bucketed by receive time.
pub struct ParsedMessageCache {
    budget_bytes: usize,
    buckets: RwLock<HashMap<i64, Arc<Mutex<Bucket>>>>,
    total_bytes: AtomicUsize,
    access_counter: AtomicU64,
}

impl Default for ParsedMessageCache {
    fn default() -> Self {
        Self::with_budget(DEFAULT_PARSED_CACHE_BYTES)
    }
}

impl ParsedMessageCache {
    pub fn with_budget(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            buckets: RwLock::new(HashMap::new()),
            total_bytes: AtomicUsize::new(0),
            access_counter: AtomicU64::new(0),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    fn bucket_key(time: Time) -> i64 {
        (time.as_nanos() / BUCKET_NANOS) as i64
    }

    fn bucket_for(&self, key: i64) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(&key) {
            return bucket.clone();
        }
        self.buckets.write().entry(key).or_default().clone()
    }

    /// Decode `messages` into parsed events, serving repeats from the cache.
    ///
    /// Already-parsed events pass through untouched. A message whose topic
    /// has no decoder, or whose decode fails, is dropped from the output and
    /// reported through `problems`; the rest of the batch still goes through.
    pub fn parse_messages(
        &self,
        messages: &[Arc<MessageEvent>],
        mut decoder_for: impl FnMut(&str) -> Option<Arc<dyn Decoder>>,
        problems: &ProblemManager,
    ) -> Vec<Arc<MessageEvent>> {
        let mut out = Vec::with_capacity(messages.len());

        for msg in messages {
            let Some(bytes) = msg.raw_bytes() else {
                out.push(msg.clone());
                continue;
            };

            let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
            let bucket = self.bucket_for(Self::bucket_key(msg.receive_time));
            let mut inserted = false;

            let value = {
                let mut bucket = bucket.lock();
                bucket.last_access = access;

                if let Some(value) = bucket.entries.get(&msg.id) {
                    trace!(topic = %msg.topic, "parsed cache hit");
                    Some(value.clone())
                } else {
                    let Some(decoder) = decoder_for(&msg.topic) else {
                        problems.add(
                            Problem::warn(
                                format!("decoder-missing:{}", msg.topic),
                                format!("no decoder available for topic {}", msg.topic),
                            )
                            .with_tip("the schema for this topic may be unsupported"),
                        );
                        continue;
                    };

                    match decoder.decode(bytes) {
                        Ok(value) => {
                            let value = Arc::new(value);
                            bucket.entries.insert(msg.id, value.clone());
                            bucket.size_in_bytes += msg.size_in_bytes;
                            self.total_bytes.fetch_add(msg.size_in_bytes, Ordering::Relaxed);
                            inserted = true;
                            Some(value)
                        }
                        Err(err) => {
                            problems.add(Problem::warn(
                                format!("decode-failed:{}", msg.topic),
                                err.to_string(),
                            ));
                            None
                        }
                    }
                }
            };

            if inserted {
                self.evict_if_needed();
            }

            if let Some(value) = value {
                out.push(Arc::new(msg.with_parsed(value)));
            }
        }

        out
    }

    /// Drop least-recently-accessed buckets until the total is back under
    /// budget. A single oversized bucket is allowed to stand; evicting it
    /// would just force an immediate re-decode of the active region.
    fn evict_if_needed(&self) {
        while self.total_bytes.load(Ordering::Relaxed) > self.budget_bytes {
            let mut buckets = self.buckets.write();
            if buckets.len() <= 1 {
                return;
            }

            let oldest = buckets
                .iter()
                .map(|(key, bucket)| (*key, bucket.lock().last_access))
                .min_by_key(|(_, access)| *access)
                .map(|(key, _)| key);

            let Some(key) = oldest else { return };
            if let Some(bucket) = buckets.remove(&key) {
                let freed = bucket.lock().size_in_bytes;
                self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
                debug!(bucket = key, freed, "evicted parsed cache bucket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    struct LenDecoder;

    impl Decoder for LenDecoder {
        fn decode(&self, data: &[u8]) -> Result<ParsedValue> {
            Ok(ParsedValue::Int(data.len() as i64))
        }
    }

    struct CountingDecoder {
        decodes: AtomicUsize,
    }

    impl Decoder for CountingDecoder {
        fn decode(&self, data: &[u8]) -> Result<ParsedValue> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            Ok(ParsedValue::Int(data.len() as i64))
        }
    }

    fn msg(topic: &str, secs: i64, size: usize) -> Arc<MessageEvent> {
        Arc::new(MessageEvent::raw(topic, Time::from_secs(secs), vec![0; size]))
    }

    #[test]
    fn repeat_parse_hits_the_cache() {
        let cache = ParsedMessageCache::default();
        let problems = ProblemManager::new();
        let decoder = Arc::new(CountingDecoder { decodes: AtomicUsize::new(0) });
        let batch = vec![msg("/a", 1, 8), msg("/a", 2, 8)];

        let first = cache.parse_messages(&batch, |_| Some(decoder.clone()), &problems);
        let second = cache.parse_messages(&batch, |_| Some(decoder.clone()), &problems);

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(decoder.decodes.load(Ordering::SeqCst), 2);
        assert_eq!(second[0].parsed_value(), Some(&ParsedValue::Int(8)));
    }

    #[test]
    fn already_parsed_messages_pass_through() {
        let cache = ParsedMessageCache::default();
        let problems = ProblemManager::new();
        let parsed =
            Arc::new(msg("/a", 1, 4).with_parsed(Arc::new(ParsedValue::Bool(true))));

        let out = cache.parse_messages(&[parsed.clone()], |_| None, &problems);
        assert_eq!(out.len(), 1);
        assert!(Arc::ptr_eq(&out[0], &parsed));
        assert!(problems.problems().is_empty());
    }

    #[test]
    fn missing_decoder_drops_and_reports() {
        let cache = ParsedMessageCache::default();
        let problems = ProblemManager::new();
        let decoder: Arc<dyn Decoder> = Arc::new(LenDecoder);

        let batch = vec![msg("/known", 1, 4), msg("/unknown", 1, 4)];
        let out = cache.parse_messages(
            &batch,
            |topic| (topic == "/known").then(|| decoder.clone()),
            &problems,
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "/known");
        assert!(problems.has("decoder-missing:/unknown"));
    }

    #[test]
    fn decode_failure_drops_only_the_failing_message() {
        struct Picky;
        impl Decoder for Picky {
            fn decode(&self, data: &[u8]) -> Result<ParsedValue> {
                if data.len() == 3 {
                    Err(crate::PlaybackError::decode("/a", "truncated"))
                } else {
                    Ok(ParsedValue::Int(data.len() as i64))
                }
            }
        }

        let cache = ParsedMessageCache::default();
        let problems = ProblemManager::new();
        let decoder: Arc<dyn Decoder> = Arc::new(Picky);

        let batch: Vec<_> = (0..10).map(|i| msg("/a", i, if i == 4 { 3 } else { 8 })).collect();
        let out = cache.parse_messages(&batch, |_| Some(decoder.clone()), &problems);

        assert_eq!(out.len(), 9);
        assert!(problems.has("decode-failed:/a"));
    }

    #[test]
    fn eviction_discards_oldest_accessed_bucket_first() {
        // Three messages in distinct buckets, ~40 bytes each, 100 byte budget.
        let cache = ParsedMessageCache::with_budget(100);
        let problems = ProblemManager::new();
        let decoder: Arc<dyn Decoder> = Arc::new(LenDecoder);

        let early = vec![msg("/a", 1, 40)];
        let middle = vec![msg("/a", 10, 40)];
        let late = vec![msg("/a", 20, 40)];

        cache.parse_messages(&early, |_| Some(decoder.clone()), &problems);
        cache.parse_messages(&middle, |_| Some(decoder.clone()), &problems);
        // Touch the early bucket so the middle one is now the oldest.
        cache.parse_messages(&early, |_| Some(decoder.clone()), &problems);
        cache.parse_messages(&late, |_| Some(decoder.clone()), &problems);

        assert!(cache.size_in_bytes() <= 100);

        // Early and late survive as cache hits; middle was evicted.
        let counting = Arc::new(CountingDecoder { decodes: AtomicUsize::new(0) });
        cache.parse_messages(&early, |_| Some(counting.clone()), &problems);
        cache.parse_messages(&late, |_| Some(counting.clone()), &problems);
        assert_eq!(counting.decodes.load(Ordering::SeqCst), 0);
        cache.parse_messages(&middle, |_| Some(counting.clone()), &problems);
        assert_eq!(counting.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_oversized_bucket_is_tolerated() {
        let cache = ParsedMessageCache::with_budget(10);
        let problems = ProblemManager::new();
        let decoder: Arc<dyn Decoder> = Arc::new(LenDecoder);

        let batch = vec![msg("/a", 1, 1000)];
        let out = cache.parse_messages(&batch, |_| Some(decoder.clone()), &problems);
        assert_eq!(out.len(), 1);
        assert_eq!(cache.size_in_bytes(), 1000);
    }
}
