//! Rate limiting for state snapshot streams.

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, interval};

/// Extension trait adding snapshot pacing to any Stream
pub trait PaceExt: Stream {
    /// Emit at most one item per interval, keeping only the latest
    ///
    /// Snapshots are self-contained, so intermediate ones can be skipped
    /// without losing information. The final item before the inner stream
    /// ends is always delivered.
    fn paced(self, duration: Duration) -> Paced<Self>
    where
        Self: Sized,
    {
        Paced::new(self, duration)
    }
}

impl<T: Stream> PaceExt for T {}

pin_project! {
    /// A stream combinator that limits emission rate with latest-wins
    /// semantics
    pub struct Paced<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        latest: Option<S::Item>,
        done: bool,
    }
}

impl<S: Stream> Paced<S> {
    pub fn new(stream: S, duration: Duration) -> Self {
        let mut interval = interval(duration);
        // Delay after a missed tick instead of bursting
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Self { stream, interval, latest: None, done: false }
    }
}

impl<S: Stream> Stream for Paced<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain whatever the inner stream has ready, keeping the latest.
        while !*this.done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.latest = Some(item),
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => break,
            }
        }

        if *this.done {
            // No pacing on shutdown; flush the held item and finish.
            return Poll::Ready(this.latest.take());
        }

        if this.latest.is_some() {
            ready!(this.interval.poll_tick(cx));
            return Poll::Ready(this.latest.take());
        }

        // Inner stream registered the waker above.
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_the_latest_item() {
        let paced = futures::stream::iter(0..5).paced(Duration::from_millis(10));
        let out: Vec<i32> = paced.collect().await;
        assert_eq!(out, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_spaced_by_the_interval() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut paced = UnboundedReceiverStream::new(rx).paced(Duration::from_millis(100));

        tx.send(1).unwrap();
        assert_eq!(paced.next().await, Some(1));

        tx.send(2).unwrap();
        tx.send(3).unwrap();
        // Both arrived inside one interval; only the later survives.
        assert_eq!(paced.next().await, Some(3));

        drop(tx);
        assert_eq!(paced.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn final_item_is_flushed_on_stream_end() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut paced = UnboundedReceiverStream::new(rx).paced(Duration::from_secs(60));

        tx.send(1).unwrap();
        assert_eq!(paced.next().await, Some(1));

        tx.send(2).unwrap();
        drop(tx);
        // The held item comes out without waiting a full minute.
        let out = tokio::time::timeout(Duration::from_secs(1), paced.next())
            .await
            .expect("flushed promptly");
        assert_eq!(out, Some(2));
        assert_eq!(paced.next().await, None);
    }
}
