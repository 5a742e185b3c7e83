//! Core types for the playback engine.
//!
//! Everything a consumer of the engine touches lives here:
//! - [`Time`] is the recording timeline position with nanosecond resolution
//! - [`MessageEvent`] is one record read from a source, raw or decoded
//! - [`SubscribePayload`] is one consumer's request for a topic
//! - [`PlayerState`] is the full snapshot emitted to the UI listener
//! - [`Problem`] is a deduplicated, id-keyed warning or error

mod message;
mod state;
mod subscription;
mod time;

pub use message::{MessageEvent, MessageId, MessagePayload, ParsedValue, SchemaInfo, Topic};
pub use state::{
    ActiveData, FractionRange, PlayerPresence, PlayerState, Problem, Progress, Severity,
    TopicStats,
};
pub use subscription::{PreloadType, SubscribePayload, TopicSelection};
pub use time::{NSEC_PER_SEC, Time};
