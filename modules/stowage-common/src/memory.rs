//! In-memory storage delegate. Reference backend and test double.
//!
//! Ids are handed out and made visible in the same step, so this backend
//! never produces gaps.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::{DispatchableStore, EntryLog, StorageDelegate};
use crate::types::{Dispatchable, Entry, EntryDraft, EntryId, State};

#[derive(Default)]
struct Tables {
    /// Entry with id `n` lives at index `n - 1`.
    entries: Vec<Entry>,
    /// store name -> id -> state
    states: HashMap<String, HashMap<String, State>>,
    /// Insertion ordered; ids are unique.
    dispatchables: Vec<Dispatchable>,
    closed: bool,
}

impl Tables {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::failure("in-memory storage is closed"));
        }
        Ok(())
    }

    fn entry(&self, id: EntryId) -> Option<&Entry> {
        let index = usize::try_from(id.value()).ok()?.checked_sub(1)?;
        self.entries.get(index)
    }
}

/// Thread-safe in-memory backend for entries, states and dispatchables.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dispatchables still waiting for confirmation.
    pub async fn pending_dispatchables(&self) -> usize {
        self.tables.read().await.dispatchables.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.tables.read().await.closed
    }
}

#[async_trait]
impl EntryLog for InMemoryStorage {
    async fn append_entries(&self, drafts: Vec<EntryDraft>) -> StorageResult<Vec<Entry>> {
        let mut tables = self.tables.write().await;
        tables.ensure_open()?;

        let mut appended = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = EntryId::new(tables.entries.len() as u64 + 1);
            let entry = draft.into_entry(id);
            tables.entries.push(entry.clone());
            appended.push(entry);
        }
        Ok(appended)
    }

    async fn read_from(&self, from: EntryId, max: usize) -> StorageResult<Vec<Entry>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;

        let skip = usize::try_from(from.value().saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(tables.entries.iter().skip(skip).take(max).cloned().collect())
    }

    async fn read_ids(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;

        let mut found: Vec<Entry> = ids.iter().filter_map(|id| tables.entry(*id)).cloned().collect();
        found.sort_by_key(|e| e.id);
        found.dedup_by_key(|e| e.id);
        Ok(found)
    }

    async fn last_entry_id(&self) -> StorageResult<Option<EntryId>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;
        Ok(tables.entries.last().map(|e| e.id))
    }

    async fn entry_count(&self) -> StorageResult<Option<u64>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;
        Ok(Some(tables.entries.len() as u64))
    }
}

#[async_trait]
impl DispatchableStore for InMemoryStorage {
    async fn append_dispatchable(&self, dispatchable: &Dispatchable) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.ensure_open()?;

        let position = tables
            .dispatchables
            .iter()
            .position(|d| d.id == dispatchable.id);
        match position {
            Some(index) => {
                debug!(dispatch_id = %dispatchable.id, "superseding pending dispatchable");
                tables.dispatchables[index] = dispatchable.clone();
            }
            None => tables.dispatchables.push(dispatchable.clone()),
        }
        Ok(())
    }

    async fn delete_dispatchable(&self, dispatch_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.ensure_open()?;
        tables.dispatchables.retain(|d| d.id != dispatch_id);
        Ok(())
    }

    async fn all_dispatchables(&self) -> StorageResult<Vec<Dispatchable>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;
        Ok(tables.dispatchables.clone())
    }

    async fn close(&self) {
        self.tables.write().await.closed = true;
    }
}

#[async_trait]
impl StorageDelegate for InMemoryStorage {
    async fn read_state(&self, store_name: &str, id: &str) -> StorageResult<Option<State>> {
        let tables = self.tables.read().await;
        tables.ensure_open()?;
        Ok(tables
            .states
            .get(store_name)
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn write_state(&self, store_name: &str, state: &State) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.ensure_open()?;
        tables
            .states
            .entry(store_name.to_string())
            .or_default()
            .insert(state.id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;

    fn drafts(n: usize) -> Vec<EntryDraft> {
        (0..n)
            .map(|i| EntryDraft::new("counted", format!("n={i}")))
            .collect()
    }

    #[tokio::test]
    async fn entries_get_consecutive_ids_from_one() {
        let storage = InMemoryStorage::new();
        let first = storage.append_entries(drafts(2)).await.unwrap();
        let second = storage.append_entries(drafts(1)).await.unwrap();

        let ids: Vec<u64> = first.iter().chain(&second).map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(storage.last_entry_id().await.unwrap(), Some(EntryId::new(3)));
        assert_eq!(storage.entry_count().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn read_from_is_bounded_and_ordered() {
        let storage = InMemoryStorage::new();
        storage.append_entries(drafts(5)).await.unwrap();

        let page = storage.read_from(EntryId::new(2), 2).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![2, 3]);

        let past_end = storage.read_from(EntryId::new(9), 10).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn read_ids_skips_unknown() {
        let storage = InMemoryStorage::new();
        storage.append_entries(drafts(3)).await.unwrap();

        let found = storage
            .read_ids(&[EntryId::new(3), EntryId::new(0), EntryId::new(1), EntryId::new(8)])
            .await
            .unwrap();
        let ids: Vec<u64> = found.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn dispatchable_with_same_id_supersedes() {
        let storage = InMemoryStorage::new();
        let older = Dispatchable::new("people:p-1", Some(State::new("p-1", "person", 1, "a")), vec![]);
        let newer = Dispatchable::new("people:p-1", Some(State::new("p-1", "person", 2, "b")), vec![]);

        storage.append_dispatchable(&older).await.unwrap();
        storage.append_dispatchable(&newer).await.unwrap();

        let all = storage.all_dispatchables().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state.as_ref().unwrap().data_version, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_targeted() {
        let storage = InMemoryStorage::new();
        storage
            .append_dispatchable(&Dispatchable::new("a", None, vec![]))
            .await
            .unwrap();
        storage
            .append_dispatchable(&Dispatchable::new("b", None, vec![]))
            .await
            .unwrap();

        storage.delete_dispatchable("a").await.unwrap();
        storage.delete_dispatchable("a").await.unwrap();

        let remaining = storage.all_dispatchables().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");
    }

    #[tokio::test]
    async fn closed_storage_rejects_operations() {
        let storage = InMemoryStorage::new();
        storage.close().await;

        let err = storage.append_entries(drafts(1)).await.unwrap_err();
        assert_eq!(err.outcome(), Outcome::Failure);
        assert!(storage.is_closed().await);
    }
}
