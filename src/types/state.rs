//! Player state snapshots emitted to the UI listener.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::message::{MessageEvent, Topic};
use super::time::Time;

/// Coarse lifecycle state of a player instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerPresence {
    #[default]
    NotPresent,
    Initializing,
    Buffering,
    Present,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warn,
    Error,
}

/// A user-facing warning or error with a stable identity.
///
/// Re-reporting the same id replaces the previous entry, so a flapping
/// condition shows up once instead of flooding the problem list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub tip: Option<String>,
}

impl Problem {
    pub fn warn(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), severity: Severity::Warn, message: message.into(), tip: None }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), severity: Severity::Error, message: message.into(), tip: None }
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// A loaded sub-range of the recording expressed as fractions of the whole
/// duration, for progress bars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionRange {
    pub start: f64,
    pub end: f64,
}

/// Preload progress reported by the block loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Vec<FractionRange>,
    /// Bytes currently held by the preload block cache.
    pub cache_bytes: usize,
}

/// Per-topic message statistics reported by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub num_messages: u64,
    pub first_message_time: Option<Time>,
    pub last_message_time: Option<Time>,
}

/// Playback data available once a source is initialized.
#[derive(Debug, Clone, Default)]
pub struct ActiveData {
    /// Messages that became current since the previous snapshot.
    pub messages: Vec<Arc<MessageEvent>>,
    pub start_time: Time,
    pub end_time: Time,
    pub current_time: Time,
    pub is_playing: bool,
    pub speed: f64,
    pub topics: Vec<Topic>,
    pub topic_stats: BTreeMap<String, TopicStats>,
}

/// Full snapshot of a player, emitted to the listener on every change.
/// Always a complete snapshot, never a diff.
#[derive(Debug, Clone, Default)]
pub struct PlayerState {
    pub presence: PlayerPresence,
    pub active_data: Option<ActiveData>,
    pub progress: Progress,
    pub problems: Vec<Problem>,
}
