//! Sequential, seekable readers over an entry log.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::gap::{detect_gaps, GapRetryReader, GappedEntries};
use crate::storage::{EntryLog, StorageDelegate};
use crate::types::{Entry, EntryId};

// ---------------------------------------------------------------------------
// Seek
// ---------------------------------------------------------------------------

/// Where to move a reader's cursor.
///
/// Parses from the reserved tokens `"<"` (beginning), `">"` (end) and `"="`
/// (query, do not move); any other token is an entry id. A token that is not
/// a valid id seeks to the end, the same as an id that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Beginning,
    End,
    Query,
    Id(EntryId),
}

impl Seek {
    pub const BEGINNING: &'static str = "<";
    pub const END: &'static str = ">";
    pub const QUERY: &'static str = "=";

    pub fn token(&self) -> String {
        match self {
            Seek::Beginning => Self::BEGINNING.to_string(),
            Seek::End => Self::END.to_string(),
            Seek::Query => Self::QUERY.to_string(),
            Seek::Id(id) => id.to_string(),
        }
    }
}

impl From<&str> for Seek {
    fn from(token: &str) -> Self {
        match token {
            Self::BEGINNING => Seek::Beginning,
            Self::END => Seek::End,
            Self::QUERY => Seek::Query,
            other => other.parse().map(Seek::Id).unwrap_or(Seek::End),
        }
    }
}

impl From<EntryId> for Seek {
    fn from(id: EntryId) -> Self {
        Seek::Id(id)
    }
}

impl fmt::Display for Seek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

// ---------------------------------------------------------------------------
// EntryReader
// ---------------------------------------------------------------------------

/// A named cursor over an ordered entry log.
#[async_trait]
pub trait EntryReader: Send + Sync {
    fn name(&self) -> &str;

    /// The entry at the cursor, advancing past it. `None` at the end.
    async fn read_next(&self) -> StorageResult<Option<Entry>>;

    /// Up to `max` entries from the cursor, ascending, advancing past them.
    async fn read_next_batch(&self, max: usize) -> StorageResult<Vec<Entry>>;

    /// Move the cursor and report the id it now rests on, `None` past the end.
    async fn seek_to(&self, seek: Seek) -> StorageResult<Option<EntryId>>;

    async fn rewind(&self);

    /// Number of entries in the log, `None` when the backend cannot tell.
    async fn size(&self) -> Option<u64>;
}

// ---------------------------------------------------------------------------
// EntryLogReader
// ---------------------------------------------------------------------------

/// Reader over an [`EntryLog`] that heals gaps before handing entries out.
///
/// Cloning shares the cursor. Reads of one reader are serialized; separate
/// readers move independently.
pub struct EntryLogReader<L: ?Sized> {
    inner: Arc<Inner<L>>,
}

struct Inner<L: ?Sized> {
    name: String,
    gaps: GapRetryReader,
    /// Next id to read.
    cursor: Mutex<EntryId>,
    log: Arc<L>,
}

/// Reader over a full storage delegate, as handed out by the stores.
pub type DelegateEntryReader = EntryLogReader<dyn StorageDelegate>;

impl<L: ?Sized> Clone for EntryLogReader<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ?Sized> fmt::Debug for EntryLogReader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryLogReader")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<L> EntryLogReader<L>
where
    L: EntryLog + ?Sized + 'static,
{
    pub fn new(name: impl Into<String>, log: Arc<L>, gaps: GapRetryReader) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                gaps,
                cursor: Mutex::new(EntryId::FIRST),
                log,
            }),
        }
    }

    /// Read up to `max` entries starting at `from`, healing gaps below the
    /// highest id returned.
    async fn read_window(&self, from: EntryId, max: usize) -> StorageResult<Vec<Entry>> {
        let entries = self.inner.log.read_from(from, max).await?;
        let Some(last) = entries.last().map(|e| e.id) else {
            return Ok(entries);
        };

        let count = last.value().saturating_sub(from.value()) + 1;
        let gap_ids = detect_gaps(&entries, from, count);
        if gap_ids.is_empty() {
            return Ok(entries);
        }

        debug!(reader = %self.inner.name, gaps = gap_ids.len(), %from, "gaps detected, retrying");
        let log = Arc::clone(&self.inner.log);
        let fill = move |ids: Vec<EntryId>| {
            let log = Arc::clone(&log);
            async move { log.read_ids(&ids).await }
        };

        let abandoned = || StorageError::failure("gap retry ended without completing the read");
        if max == 1 {
            let (gapped, rx) = GappedEntries::single(entries, gap_ids);
            self.inner.gaps.read_gaps(gapped, fill);
            Ok(rx.await.map_err(|_| abandoned())?.into_iter().collect())
        } else {
            let (gapped, rx) = GappedEntries::batch(entries, gap_ids);
            self.inner.gaps.read_gaps(gapped, fill);
            rx.await.map_err(|_| abandoned())
        }
    }

    async fn end_position(&self) -> StorageResult<EntryId> {
        let last = self.inner.log.last_entry_id().await?;
        Ok(last.map(EntryId::next).unwrap_or(EntryId::FIRST))
    }

    async fn position_token(&self, cursor: EntryId) -> StorageResult<Option<EntryId>> {
        let last = self.inner.log.last_entry_id().await?;
        Ok(last.filter(|last| cursor <= *last).map(|_| cursor))
    }
}

#[async_trait]
impl<L> EntryReader for EntryLogReader<L>
where
    L: EntryLog + ?Sized + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn read_next(&self) -> StorageResult<Option<Entry>> {
        Ok(self.read_next_batch(1).await?.into_iter().next())
    }

    async fn read_next_batch(&self, max: usize) -> StorageResult<Vec<Entry>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut cursor = self.inner.cursor.lock().await;
        let mut entries = self.read_window(*cursor, max).await?;
        entries.truncate(max);

        if let Some(last) = entries.last() {
            *cursor = last.id.next();
        }
        Ok(entries)
    }

    async fn seek_to(&self, seek: Seek) -> StorageResult<Option<EntryId>> {
        let mut cursor = self.inner.cursor.lock().await;
        match seek {
            Seek::Beginning => *cursor = EntryId::FIRST,
            Seek::End => *cursor = self.end_position().await?,
            Seek::Query => {}
            Seek::Id(id) => {
                let found = self.inner.log.read_ids(&[id]).await?;
                *cursor = if found.is_empty() {
                    self.end_position().await?
                } else {
                    id
                };
            }
        }
        self.position_token(*cursor).await
    }

    async fn rewind(&self) {
        *self.inner.cursor.lock().await = EntryId::FIRST;
    }

    async fn size(&self) -> Option<u64> {
        match self.inner.log.entry_count().await {
            Ok(size) => size,
            Err(e) => {
                warn!(reader = %self.inner.name, error = %e, "entry count unavailable");
                None
            }
        }
    }
}
