use serde::{Deserialize, Serialize};
use stowage_common::{Entry, State, StorageResult};

use crate::journal::Journal;

/// One reconstructed stream.
///
/// When `snapshot` is present, `entries` holds only the versions after the
/// snapshot's `data_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStream {
    pub stream_name: String,
    /// Highest version recorded for the stream, 0 for an unknown stream.
    pub stream_version: u32,
    pub entries: Vec<Entry>,
    pub snapshot: Option<State>,
}

impl EntityStream {
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.snapshot.is_none()
    }
}

/// Named reader that rebuilds single streams from a journal.
#[derive(Debug, Clone)]
pub struct StreamReader {
    name: String,
    journal: Journal,
}

impl StreamReader {
    pub(crate) fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole stream: the latest snapshot plus what came after it.
    pub async fn stream_for(&self, stream_name: &str) -> StorageResult<EntityStream> {
        self.stream_from(stream_name, 1).await
    }

    /// The stream from `from_version` on.
    ///
    /// A snapshot is used only when it covers `from_version`; otherwise
    /// every entry with a version `>= from_version` is returned and
    /// `snapshot` is `None`.
    pub async fn stream_from(&self, stream_name: &str, from_version: u32) -> StorageResult<EntityStream> {
        let plan = self.journal.stream_plan(stream_name, from_version).await?;
        let entries = self.journal.load_entries(&plan.entry_ids).await?;

        Ok(EntityStream {
            stream_name: stream_name.to_string(),
            stream_version: plan.stream_version,
            entries,
            snapshot: plan.snapshot,
        })
    }
}
