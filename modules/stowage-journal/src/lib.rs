//! Journal: an append-only entry log partitioned into named streams, with
//! per-stream snapshots and at-least-once dispatch of every append.

mod actor;
pub mod journal;
pub mod stream;

pub use journal::{Journal, JournalReader};
pub use stream::{EntityStream, StreamReader};
