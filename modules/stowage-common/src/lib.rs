//! Shared building blocks for stowage stores.
//!
//! Holds the immutable entry/state data model, the outcome taxonomy every
//! store reports through, the storage delegate contracts a backend
//! implements, sequential entry readers with gap healing, and configuration.
//!
//! Stores (journal, state store) and the dispatch subsystem live in their
//! own crates and build on these types.

pub mod config;
pub mod error;
pub mod gap;
pub mod memory;
pub mod reader;
pub mod storage;
pub mod types;

pub use config::{DispatchConfig, GapRetryConfig, StoreConfig};
pub use error::{Outcome, StorageError, StorageResult};
pub use gap::{detect_gaps, Completion, GapRetryReader, GappedEntries};
pub use memory::InMemoryStorage;
pub use reader::{DelegateEntryReader, EntryLogReader, EntryReader, Seek};
pub use storage::{DispatchableStore, EntryLog, StorageDelegate};
pub use types::{Dispatchable, Entry, EntryDraft, EntryId, Metadata, Payload, State};
