//! Gap detection and healing for sequence-ordered entry logs.
//!
//! Backends that order entries with an auto-incrementing sequence can make
//! entry N+2 visible to a range scan before entry N+1 commits, or lose a
//! sequence value entirely to a rolled-back transaction. Readers detect the
//! missing ids in the window they read and retry them on a fixed schedule.
//! Ids still missing when the retry budget runs out are treated as
//! permanently absent; the caller gets the best-effort ascending result.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GapRetryConfig;
use crate::error::StorageResult;
use crate::types::{Entry, EntryId};

/// Ids in `[start, start + count)` that are absent from `entries`, ascending.
pub fn detect_gaps(entries: &[Entry], start: EntryId, count: u64) -> Vec<EntryId> {
    let present: HashSet<EntryId> = entries.iter().map(|e| e.id).collect();
    let end = start.value().saturating_add(count);
    (start.value()..end)
        .map(EntryId::new)
        .filter(|id| !present.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// GappedEntries
// ---------------------------------------------------------------------------

/// The caller waiting on a gapped read. Resolved exactly once.
#[derive(Debug)]
pub enum Completion {
    /// One entry was requested: resolves with the lowest loaded entry.
    Single(oneshot::Sender<Option<Entry>>),
    /// A batch was requested: resolves with every loaded entry, ascending.
    Batch(oneshot::Sender<Vec<Entry>>),
}

/// Working set of a read with gaps: what was loaded, which ids are still
/// missing, and who is waiting.
///
/// Filling consumes the value and yields a new one, so a retry never sees a
/// half-updated set from an earlier attempt.
#[derive(Debug)]
pub struct GappedEntries {
    loaded: Vec<Entry>,
    gap_ids: Vec<EntryId>,
    completion: Completion,
}

impl GappedEntries {
    pub fn new(loaded: Vec<Entry>, gap_ids: Vec<EntryId>, completion: Completion) -> Self {
        Self {
            loaded,
            gap_ids,
            completion,
        }
    }

    /// Gapped read for a single requested entry, plus the receiver the
    /// caller waits on.
    pub fn single(
        loaded: Vec<Entry>,
        gap_ids: Vec<EntryId>,
    ) -> (Self, oneshot::Receiver<Option<Entry>>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(loaded, gap_ids, Completion::Single(tx)), rx)
    }

    /// Gapped read for a batch, plus the receiver the caller waits on.
    pub fn batch(loaded: Vec<Entry>, gap_ids: Vec<EntryId>) -> (Self, oneshot::Receiver<Vec<Entry>>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(loaded, gap_ids, Completion::Batch(tx)), rx)
    }

    pub fn contains_gaps(&self) -> bool {
        !self.gap_ids.is_empty()
    }

    pub fn gap_ids(&self) -> &[EntryId] {
        &self.gap_ids
    }

    pub fn loaded_entries(&self) -> &[Entry] {
        &self.loaded
    }

    /// Merge newly found entries. Only entries whose id is a current gap are
    /// taken; anything else is ignored.
    pub fn fill_up_with(self, found: Vec<Entry>) -> Self {
        let Self {
            loaded,
            gap_ids,
            completion,
        } = self;

        let mut found: HashMap<EntryId, Entry> = found.into_iter().map(|e| (e.id, e)).collect();
        let mut filled = loaded;
        let mut remaining = Vec::with_capacity(gap_ids.len());
        for id in gap_ids {
            match found.remove(&id) {
                Some(entry) => filled.push(entry),
                None => remaining.push(id),
            }
        }

        Self {
            loaded: filled,
            gap_ids: remaining,
            completion,
        }
    }

    /// Loaded entries in ascending id order.
    pub fn sorted_loaded_entries(&self) -> Vec<Entry> {
        let mut sorted = self.loaded.clone();
        sorted.sort_by_key(|e| e.id);
        sorted.dedup_by_key(|e| e.id);
        sorted
    }

    /// Resolve the waiting caller. A caller that stopped waiting is ignored.
    pub fn complete(self) {
        let sorted = self.sorted_loaded_entries();
        match self.completion {
            Completion::Single(tx) => {
                let _ = tx.send(sorted.into_iter().next());
            }
            Completion::Batch(tx) => {
                let _ = tx.send(sorted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GapRetryReader
// ---------------------------------------------------------------------------

/// Schedules bounded, fixed-interval retries that try to fill gaps.
#[derive(Debug, Clone)]
pub struct GapRetryReader {
    retries: u32,
    retry_interval: Duration,
}

impl Default for GapRetryReader {
    fn default() -> Self {
        Self::from_config(&GapRetryConfig::default())
    }
}

impl GapRetryReader {
    pub fn new(retries: u32, retry_interval: Duration) -> Self {
        Self {
            retries,
            retry_interval,
        }
    }

    pub fn from_config(config: &GapRetryConfig) -> Self {
        Self::new(config.retries, config.retry_interval())
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Retry `gapped` with this reader's budget. See [`GapRetryReader::read_gaps_with`].
    pub fn read_gaps<F, Fut>(&self, gapped: GappedEntries, fill: F) -> JoinHandle<()>
    where
        F: Fn(Vec<EntryId>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<Vec<Entry>>> + Send + 'static,
    {
        Self::read_gaps_with(gapped, self.retries, self.retry_interval, fill)
    }

    /// Spawn the retry loop for `gapped`.
    ///
    /// Each attempt waits `retry_interval`, asks `fill` for the ids that are
    /// still missing and merges what it returns. The loop ends when no gaps
    /// remain or after `max_retries` attempts, then resolves the waiting
    /// caller. A failed fill counts as an attempt that found nothing.
    pub fn read_gaps_with<F, Fut>(
        gapped: GappedEntries,
        max_retries: u32,
        retry_interval: Duration,
        fill: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Vec<EntryId>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<Vec<Entry>>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut gapped = gapped;
            let mut attempt = 0;

            while gapped.contains_gaps() && attempt < max_retries {
                tokio::time::sleep(retry_interval).await;
                attempt += 1;

                let found = match fill(gapped.gap_ids().to_vec()).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(error = %e, attempt, "gap fill read failed");
                        Vec::new()
                    }
                };
                gapped = gapped.fill_up_with(found);
                debug!(attempt, gaps = gapped.gap_ids().len(), "gap fill attempt");
            }

            if gapped.contains_gaps() {
                warn!(
                    gaps = ?gapped.gap_ids(),
                    retries = max_retries,
                    "gaps remain after retries, treating them as permanently absent"
                );
            }
            gapped.complete();
        })
    }
}
