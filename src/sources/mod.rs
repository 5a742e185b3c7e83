//! Bundled [`IterableSource`](crate::source::IterableSource) implementations.

pub mod memory;
pub mod merged;

pub use memory::{MemorySource, MemorySourceBuilder};
pub use merged::MergedSource;
