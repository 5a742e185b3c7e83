//! Playback and caching engine for recorded time-series logs.
//!
//! Tapedeck sits between raw per-topic byte streams and per-topic parsed
//! consumers in a data-visualization application. It streams time-ordered,
//! topic-addressed records from a recording, exposes seek/speed/pause
//! controls, and serves two access patterns at once: sequential playback
//! for live-style panels and whole-recording block access for plotting.
//!
//! # Features
//!
//! - **Playback control**: seek, speed, play/pause, play-until, with full
//!   state snapshots streamed to the UI
//! - **K-way merge**: several recordings open as one ordered timeline
//! - **Preloading**: full-recording block cache with progress reporting
//! - **Decode caching**: byte-budgeted LRU cache of parsed messages
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapedeck::{Tapedeck, SubscribePayload, Time};
//! use tapedeck::sources::MemorySource;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = MemorySource::builder()
//!         .topic("/imu", "sensors.Imu")
//!         .raw_message("/imu", Time::from_secs(1), vec![0; 16])
//!         .build();
//!
//!     let player = Tapedeck::open(Arc::new(source));
//!     player.set_subscriptions("panel", vec![SubscribePayload::partial("/imu")]);
//!     player.start();
//!
//!     let mut states = player.state_watch();
//!     let state = states.changed().await;
//!     // Render snapshots as they arrive...
//!     # let _ = state;
//! }
//! ```

// Core types and error handling
mod error;
pub mod problems;
pub mod types;

// Caches and bookkeeping
pub mod decoders;
pub mod parsed_cache;
pub mod ranges;
pub mod subscriptions;

// Source boundary and composition
pub mod merge;
pub mod source;
pub mod sources;

// Playback
pub mod blocks;
mod player;
pub mod stream;

// Core exports
pub use error::*;
pub use types::*;

pub use blocks::{BlockLoader, MessageBlock};
pub use decoders::{Decoder, DecoderFactory, DecoderStore};
pub use merge::MergedIterator;
pub use parsed_cache::ParsedMessageCache;
pub use player::{Player, PlayerOptions, StateListener};
pub use problems::ProblemManager;
pub use source::{Initialization, IterableSource, SourceItem};
pub use subscriptions::SubscriptionManager;

use std::sync::Arc;

use sources::MergedSource;

/// Unified entry point for opening recordings.
///
/// Wraps [`Player`] construction for the common cases: one source, one
/// source with options, or several sources presented as one timeline.
pub struct Tapedeck;

impl Tapedeck {
    /// Open one recording with default options.
    pub fn open(source: Arc<dyn IterableSource>) -> Player {
        Player::open(source)
    }

    /// Open one recording with explicit options.
    pub fn open_with(source: Arc<dyn IterableSource>, options: PlayerOptions) -> Player {
        Player::open_with(source, options)
    }

    /// Open several recordings as a single merged timeline.
    pub fn open_all(sources: Vec<Arc<dyn IterableSource>>) -> Player {
        Player::open(Arc::new(MergedSource::new(sources)))
    }

    /// Open several recordings as a single merged timeline, with options.
    pub fn open_all_with(
        sources: Vec<Arc<dyn IterableSource>>,
        options: PlayerOptions,
    ) -> Player {
        Player::open_with(Arc::new(MergedSource::new(sources)), options)
    }
}
