//! The source boundary: where raw recorded data enters the engine.
//!
//! The engine never parses log bytes itself. An [`IterableSource`] wraps one
//! recording (a local file, a remote stream) behind a pull-based async
//! iterator protocol; the player only sequences calls against this trait.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::Result;
use crate::types::{
    MessageEvent, Problem, SchemaInfo, Time, Topic, TopicSelection, TopicStats,
};

/// Metadata produced by [`IterableSource::initialize`].
#[derive(Debug, Clone, Default)]
pub struct Initialization {
    pub start: Time,
    pub end: Time,
    pub topics: Vec<Topic>,
    /// Schema text and hash keyed by schema name, for decoder construction.
    pub schemas: HashMap<String, SchemaInfo>,
    pub topic_stats: HashMap<String, TopicStats>,
    /// Non-fatal problems encountered while opening the source.
    pub problems: Vec<Problem>,
}

/// Arguments for [`IterableSource::message_iterator`].
#[derive(Debug, Clone, Default)]
pub struct MessageIteratorArgs {
    /// Topics to read; sources must not emit messages outside this set.
    pub topics: TopicSelection,
    /// First timestamp to emit, inclusive. Defaults to the source start.
    pub start: Option<Time>,
    /// Last timestamp to emit, inclusive. Defaults to the source end.
    pub end: Option<Time>,
}

/// Arguments for [`IterableSource::get_backfill_messages`].
#[derive(Debug, Clone)]
pub struct BackfillArgs {
    pub topics: TopicSelection,
    /// Seek target: the last message at or before this time is returned per
    /// topic.
    pub time: Time,
}

/// One item pulled from a source iterator.
///
/// The variants are heterogeneous stream item kinds merged into a single
/// timeline; `sort_key` gives each kind its position in the merge order.
#[derive(Debug, Clone)]
pub enum SourceItem {
    Message(Arc<MessageEvent>),
    /// Progress marker: the source has read up to this time even if no
    /// message was produced. Lets playback advance through sparse data.
    Stamp(Time),
    /// Recoverable per-connection problem surfaced as an item so the rest of
    /// the stream keeps flowing.
    Problem(Problem),
}

impl SourceItem {
    /// Timestamp-equivalent used by the k-way merge. Items without a real
    /// timestamp sort last.
    pub fn sort_key(&self) -> Time {
        match self {
            SourceItem::Message(msg) => msg.receive_time,
            SourceItem::Stamp(stamp) => *stamp,
            SourceItem::Problem(_) => Time::MAX,
        }
    }
}

/// Pull-based async iterator over a source's items.
///
/// `Err` items signal iteration failures: retryable ones let the player
/// reconnect, fatal ones end the player. The stream itself ends when the
/// requested range is exhausted.
pub type SourceIterator = BoxStream<'static, Result<SourceItem>>;

/// A recording the engine can play back.
///
/// Implementations run their I/O and decoding wherever they like (typically
/// a spawned task); only the item stream crosses back to the player.
#[async_trait::async_trait]
pub trait IterableSource: Send + Sync + 'static {
    /// Open the source and report its bounds, topics, and schemas.
    async fn initialize(&self) -> Result<Initialization>;

    /// Stream items for the requested topics over the requested time range,
    /// in non-decreasing `receive_time` order.
    fn message_iterator(&self, args: MessageIteratorArgs) -> SourceIterator;

    /// "Jump to time": the latest message at or before `args.time` for each
    /// requested topic, so a seek can show last-known values immediately.
    async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<Arc<MessageEvent>>>;
}
