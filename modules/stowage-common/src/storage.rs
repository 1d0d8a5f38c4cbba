//! Storage delegate contracts.
//!
//! Stores never talk to a backend directly; every read and write goes through
//! these traits. A backend implements all three (`StorageDelegate` requires the
//! other two) and is shared by a journal, a state store and their dispatcher
//! control.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{Dispatchable, Entry, EntryDraft, EntryId, State};

/// The shared, ordered entry log.
#[async_trait]
pub trait EntryLog: Send + Sync {
    /// Append drafts in order, assigning each the next id. Returns the
    /// sealed entries.
    async fn append_entries(&self, drafts: Vec<EntryDraft>) -> StorageResult<Vec<Entry>>;

    /// Up to `max` visible entries with `id >= from`, ascending.
    ///
    /// Backends that hand out ids before the row is visible may skip ids
    /// here; readers detect and heal those gaps.
    async fn read_from(&self, from: EntryId, max: usize) -> StorageResult<Vec<Entry>>;

    /// The visible entries among `ids`, ascending. Missing ids are omitted.
    async fn read_ids(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>>;

    /// Highest id handed out so far, if any.
    async fn last_entry_id(&self) -> StorageResult<Option<EntryId>>;

    /// Number of stored entries, when the backend can report it.
    async fn entry_count(&self) -> StorageResult<Option<u64>> {
        Ok(None)
    }
}

/// The dispatchables (outbox) table.
#[async_trait]
pub trait DispatchableStore: Send + Sync {
    /// Insert, replacing any pending dispatchable with the same id.
    async fn append_dispatchable(&self, dispatchable: &Dispatchable) -> StorageResult<()>;

    /// Delete by id. Deleting an absent id succeeds.
    async fn delete_dispatchable(&self, dispatch_id: &str) -> StorageResult<()>;

    /// Every dispatchable not yet confirmed, oldest first.
    async fn all_dispatchables(&self) -> StorageResult<Vec<Dispatchable>>;

    /// Release backend resources. Later calls may fail.
    async fn close(&self) {}
}

/// Full backend contract used by the stores.
#[async_trait]
pub trait StorageDelegate: EntryLog + DispatchableStore {
    async fn create_schema_if_needed(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn begin_read(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn begin_write(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Commit the current write unit.
    async fn complete(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Abandon the current write unit.
    async fn fail(&self) {}

    async fn read_state(&self, store_name: &str, id: &str) -> StorageResult<Option<State>>;

    async fn write_state(&self, store_name: &str, state: &State) -> StorageResult<()>;
}
