//! Whole-recording preloading into fixed-duration blocks.
//!
//! Full-preload subscriptions (plots, anything that charts the entire
//! timeline) need every message of a topic resident in memory. The loader
//! partitions the recording into equal-duration blocks and fills them in the
//! background, reading only the topics each block is still missing. Topic
//! changes interrupt the current pass instead of waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::error::PlaybackError;
use crate::problems::ProblemManager;
use crate::ranges::{Range, simplify};
use crate::source::{IterableSource, MessageIteratorArgs, SourceItem};
use crate::types::{
    FractionRange, MessageEvent, Problem, Progress, SubscribePayload, Time, TopicSelection,
};

use futures::StreamExt;

/// Upper bound on block count; keeps per-block bookkeeping cheap even for
/// very long recordings.
pub const DEFAULT_MAX_BLOCKS: u64 = 400;

/// Floor on block duration so short recordings do not shatter into
/// sub-100ms blocks.
pub const MIN_BLOCK_DURATION_NANOS: u64 = 100_000_000;

/// Default budget for all resident blocks together.
pub const DEFAULT_BLOCK_CACHE_BYTES: usize = 1024 * 1024 * 1024;

/// One fixed-duration slice of the recording.
///
/// A block may be partially loaded: only the topics present as keys have
/// been read. Messages within each topic list are ordered by receive time.
#[derive(Debug, Clone, Default)]
pub struct MessageBlock {
    pub messages_by_topic: HashMap<String, Vec<Arc<MessageEvent>>>,
    /// Payload each topic was loaded under. A topic counts as loaded only
    /// for an identical payload; a widened or re-sliced subscription makes
    /// it needed again.
    loaded_under: HashMap<String, SubscribePayload>,
    pub size_in_bytes: usize,
}

impl MessageBlock {
    fn insert_topic(
        &mut self,
        topic: String,
        payload: SubscribePayload,
        messages: Vec<Arc<MessageEvent>>,
    ) {
        self.remove_topic(&topic);
        self.size_in_bytes += messages.iter().map(|m| m.size_in_bytes).sum::<usize>();
        self.messages_by_topic.insert(topic.clone(), messages);
        self.loaded_under.insert(topic, payload);
    }

    fn remove_topic(&mut self, topic: &str) {
        if let Some(messages) = self.messages_by_topic.remove(topic) {
            let freed: usize = messages.iter().map(|m| m.size_in_bytes).sum();
            self.size_in_bytes -= freed;
        }
        self.loaded_under.remove(topic);
    }
}

struct LoaderState {
    blocks: Vec<Option<Arc<MessageBlock>>>,
    topics: TopicSelection,
    generation: u64,
}

/// Background preloader filling blocks for the active full-preload topics.
pub struct BlockLoader {
    source: Arc<dyn IterableSource>,
    start: Time,
    end: Time,
    block_duration_nanos: u64,
    block_count: u64,
    max_cache_bytes: usize,
    problems: Arc<ProblemManager>,
    state: Mutex<LoaderState>,
    topics_changed: Notify,
    stopped: AtomicBool,
    abort: Mutex<CancellationToken>,
}

impl BlockLoader {
    pub fn new(
        source: Arc<dyn IterableSource>,
        start: Time,
        end: Time,
        max_cache_bytes: usize,
        problems: Arc<ProblemManager>,
    ) -> Result<Self> {
        let total_nanos = end.nanos_since(start).max(1);

        let block_duration_nanos =
            MIN_BLOCK_DURATION_NANOS.max(total_nanos.div_ceil(DEFAULT_MAX_BLOCKS));
        let block_count = total_nanos.div_ceil(block_duration_nanos);
        if block_count > DEFAULT_MAX_BLOCKS {
            return Err(PlaybackError::RangeTooLong);
        }

        info!(
            blocks = block_count,
            block_duration_ms = block_duration_nanos / 1_000_000,
            "block loader created"
        );

        Ok(Self {
            source,
            start,
            end,
            block_duration_nanos,
            block_count,
            max_cache_bytes,
            problems,
            state: Mutex::new(LoaderState {
                blocks: vec![None; block_count as usize],
                topics: TopicSelection::new(),
                generation: 0,
            }),
            topics_changed: Notify::new(),
            stopped: AtomicBool::new(false),
            abort: Mutex::new(CancellationToken::new()),
        })
    }

    /// Replace the set of topics to preload. Interrupts any loading pass in
    /// flight; already-loaded topics are kept and reused.
    pub fn set_topics(&self, topics: TopicSelection) {
        {
            let mut state = self.state.lock();
            if state.topics == topics {
                return;
            }
            debug!(topics = topics.len(), "preload topics changed");
            state.topics = topics;
            state.generation += 1;
        }
        self.abort.lock().cancel();
        self.topics_changed.notify_one();
    }

    /// Permanently stop the loading loop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.abort.lock().cancel();
        self.topics_changed.notify_one();
    }

    /// Snapshot of the block array for playback reads.
    pub fn blocks(&self) -> Vec<Option<Arc<MessageBlock>>> {
        self.state.lock().blocks.clone()
    }

    /// Loading loop; runs until [`stop`](Self::stop). One pass per topic
    /// generation, then parks until the topics change again.
    pub async fn start_loading(&self, progress_tx: watch::Sender<Progress>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let generation = {
                let state = self.state.lock();
                let token = CancellationToken::new();
                *self.abort.lock() = token;
                state.generation
            };

            self.load_pass(generation, &progress_tx).await;

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.state.lock().generation == generation {
                self.topics_changed.notified().await;
            }
        }
        debug!("block loader stopped");
    }

    fn block_start_time(&self, index: u64) -> Time {
        self.start.add_nanos(index * self.block_duration_nanos)
    }

    fn block_end_time(&self, index: u64) -> Time {
        if index + 1 >= self.block_count {
            self.end
        } else {
            // One nanosecond short of the next block, ranges are inclusive.
            self.start.add_nanos((index + 1) * self.block_duration_nanos - 1)
        }
    }

    fn block_index(&self, time: Time) -> u64 {
        (time.nanos_since(self.start) / self.block_duration_nanos).min(self.block_count - 1)
    }

    /// Topics `topics` requests that block `index` has not loaded yet.
    fn block_need(state: &LoaderState, index: usize) -> TopicSelection {
        let topics = &state.topics;
        match &state.blocks[index] {
            None => topics.clone(),
            Some(block) => topics
                .iter()
                .filter(|(name, payload)| block.loaded_under.get(*name) != Some(*payload))
                .map(|(name, payload)| (name.clone(), payload.clone()))
                .collect(),
        }
    }

    async fn load_pass(&self, generation: u64, progress_tx: &watch::Sender<Progress>) {
        self.publish_progress(progress_tx);

        loop {
            // Next run of contiguous blocks sharing the same missing-topic
            // set, scanning forward from the first unsatisfied block.
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            let run = {
                let state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                let mut run: Option<(u64, u64, TopicSelection)> = None;
                for index in 0..state.blocks.len() {
                    let need = Self::block_need(&state, index);
                    match &mut run {
                        None => {
                            if !need.is_empty() {
                                run = Some((index as u64, index as u64, need));
                            }
                        }
                        Some((_, end, run_need)) => {
                            if *run_need == need {
                                *end = index as u64;
                            } else {
                                break;
                            }
                        }
                    }
                }
                run
            };

            let Some((first, last, need)) = run else {
                self.publish_progress(progress_tx);
                return;
            };

            if self.fill_run(generation, first, last, need, progress_tx).await.is_err() {
                return;
            }

            if self.state.lock().generation != generation {
                return;
            }
        }
    }

    /// Read blocks `first..=last` for `need` topics from one iterator.
    ///
    /// Err return means this pass should end (fatal problem or cache full);
    /// interruptions by generation change return Ok and are detected by the
    /// caller.
    async fn fill_run(
        &self,
        generation: u64,
        first: u64,
        last: u64,
        need: TopicSelection,
        progress_tx: &watch::Sender<Progress>,
    ) -> Result<(), ()> {
        let token = self.abort.lock().clone();
        let args = MessageIteratorArgs {
            topics: need.clone(),
            start: Some(self.block_start_time(first)),
            end: Some(self.block_end_time(last)),
        };
        let mut iterator = self.source.message_iterator(args);

        let mut cursor = first;
        let mut accumulating: HashMap<String, Vec<Arc<MessageEvent>>> =
            need.keys().map(|name| (name.clone(), Vec::new())).collect();

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                item = iterator.next() => item,
            };

            match item {
                Some(Ok(SourceItem::Message(msg))) => {
                    let index = self.block_index(msg.receive_time).clamp(first, last);

                    // Seal every block the timeline has moved past.
                    while cursor < index {
                        if !self.seal_block(generation, cursor, &need, &mut accumulating) {
                            return Ok(());
                        }
                        self.enforce_budget(progress_tx)?;
                        self.publish_progress(progress_tx);
                        cursor += 1;
                    }

                    if let Some(list) = accumulating.get_mut(&msg.topic) {
                        list.push(msg);
                    }
                }
                Some(Ok(SourceItem::Stamp(_))) => {}
                Some(Ok(SourceItem::Problem(problem))) => {
                    self.problems.add(problem);
                }
                Some(Err(err)) if err.is_retryable() => {
                    warn!(error = %err, "preload read failed, leaving blocks unloaded");
                    self.problems.add(Problem::warn("block-load", err.to_string()));
                    return Ok(());
                }
                Some(Err(err)) => {
                    self.problems.add(Problem::error("block-load", err.to_string()));
                    return Err(());
                }
                None => break,
            }
        }

        // End of data: remaining blocks of the run are loaded, possibly
        // empty for these topics.
        while cursor <= last {
            if !self.seal_block(generation, cursor, &need, &mut accumulating) {
                return Ok(());
            }
            self.enforce_budget(progress_tx)?;
            cursor += 1;
        }
        self.publish_progress(progress_tx);
        Ok(())
    }

    /// Move accumulated messages into block `index` and mark its `need`
    /// topics loaded. Returns false when the generation moved on.
    fn seal_block(
        &self,
        generation: u64,
        index: u64,
        need: &TopicSelection,
        accumulating: &mut HashMap<String, Vec<Arc<MessageEvent>>>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }

        let slot = &mut state.blocks[index as usize];
        let block = Arc::make_mut(slot.get_or_insert_with(Default::default));
        for (topic, payload) in need {
            let messages = accumulating.insert(topic.clone(), Vec::new());
            block.insert_topic(topic.clone(), payload.clone(), messages.unwrap_or_default());
        }
        true
    }

    /// Evict topics no longer subscribed when over budget; report a problem
    /// and abort the pass when that is not enough.
    fn enforce_budget(&self, progress_tx: &watch::Sender<Progress>) -> Result<(), ()> {
        let mut state = self.state.lock();
        let total: usize =
            state.blocks.iter().flatten().map(|block| block.size_in_bytes).sum();
        if total <= self.max_cache_bytes {
            self.problems.remove("block-cache-full");
            return Ok(());
        }

        let topics = state.topics.clone();
        for slot in state.blocks.iter_mut().flatten() {
            let unused: Vec<String> = slot
                .messages_by_topic
                .keys()
                .filter(|name| !topics.contains_key(*name))
                .cloned()
                .collect();
            if !unused.is_empty() {
                let block = Arc::make_mut(slot);
                for topic in &unused {
                    block.remove_topic(topic);
                }
            }
        }

        let total: usize =
            state.blocks.iter().flatten().map(|block| block.size_in_bytes).sum();
        if total <= self.max_cache_bytes {
            return Ok(());
        }

        drop(state);
        warn!(total, budget = self.max_cache_bytes, "block cache over budget");
        self.problems.add(
            Problem::warn(
                "block-cache-full",
                "the preload cache is full; some topics will not be fully loaded",
            )
            .with_tip("subscribe to fewer full-preload topics"),
        );
        self.publish_progress(progress_tx);
        Err(())
    }

    fn publish_progress(&self, progress_tx: &watch::Sender<Progress>) {
        let state = self.state.lock();

        let loaded: Vec<Range> = (0..state.blocks.len())
            .filter(|&index| Self::block_need(&state, index).is_empty())
            .map(|index| Range::new(index as u64, index as u64 + 1))
            .collect();
        let cache_bytes =
            state.blocks.iter().flatten().map(|block| block.size_in_bytes).sum();

        let count = state.blocks.len() as f64;
        let progress = Progress {
            fully_loaded_fraction_ranges: simplify(&loaded)
                .into_iter()
                .map(|range| FractionRange {
                    start: range.start as f64 / count,
                    end: range.end as f64 / count,
                })
                .collect(),
            cache_bytes,
        };
        let _ = progress_tx.send(progress);
    }
}
