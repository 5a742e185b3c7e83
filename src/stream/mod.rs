//! Stream combinators used on the state emission path.

pub mod pace;

pub use pace::{PaceExt, Paced};
