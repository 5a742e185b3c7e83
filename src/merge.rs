//! K-way time merge of independently ordered item streams.
//!
//! Given N pull-sources that are each ordered by timestamp, produce one
//! globally ordered pull-source over their union. A min-heap keyed by
//! `(sort_key, source index)` keeps the cost at O(log N) per item rather
//! than the O(N) of racing every source on every pull, which matters when a
//! recording is opened as dozens of per-connection streams.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use futures::StreamExt;
use futures::future;
use futures::stream::BoxStream;

use crate::types::Time;

/// A stream of items that can be merged by timestamp.
pub type MergeStream<T> = BoxStream<'static, T>;

/// Items that expose a timestamp-equivalent for ordering.
pub trait SortKey {
    fn sort_key(&self) -> Time;
}

impl SortKey for crate::source::SourceItem {
    fn sort_key(&self) -> Time {
        crate::source::SourceItem::sort_key(self)
    }
}

struct HeapEntry<T> {
    key: Time,
    source: usize,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties break by source index so the interleaving is deterministic.
        self.key.cmp(&other.key).then_with(|| self.source.cmp(&other.source))
    }
}

/// Merges N individually ordered pull-sources into one ordered pull-source.
pub struct MergedIterator<T> {
    sources: Vec<MergeStream<T>>,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
}

impl<T: SortKey + Send + 'static> MergedIterator<T> {
    /// Pulls the head of every source concurrently, so initialization does
    /// not cost N sequential round-trips.
    pub async fn new(mut sources: Vec<MergeStream<T>>) -> Self {
        let heads = future::join_all(sources.iter_mut().map(StreamExt::next)).await;

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, head) in heads.into_iter().enumerate() {
            if let Some(item) = head {
                heap.push(Reverse(HeapEntry { key: item.sort_key(), source, item }));
            }
        }

        Self { sources, heap }
    }

    /// Next item in global timestamp order, or `None` once every source is
    /// exhausted. The popped source is eagerly refilled; exhausted sources
    /// leave the heap permanently.
    pub async fn next(&mut self) -> Option<T> {
        let Reverse(entry) = self.heap.pop()?;

        if let Some(next) = self.sources[entry.source].next().await {
            self.heap.push(Reverse(HeapEntry {
                key: next.sort_key(),
                source: entry.source,
                item: next,
            }));
        }

        Some(entry.item)
    }

    /// Adapt into a `Stream` for composition with stream combinators.
    pub fn into_stream(self) -> MergeStream<T> {
        futures::stream::unfold(self, |mut merged| async move {
            merged.next().await.map(|item| (item, merged))
        })
        .boxed()
    }
}
