//! Journal actor. Owns the stream index, the snapshot cache and the named
//! reader cache, and serializes every append.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use stowage_common::{
    Dispatchable, Entry, EntryDraft, EntryId, GapRetryReader, State, StorageDelegate, StorageError,
    StorageResult,
};
use stowage_dispatch::{dispatch_all, Dispatcher, DispatcherControl};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use crate::journal::JournalReader;

pub(crate) struct AppendRequest {
    pub stream_name: String,
    pub from_version: u32,
    pub drafts: Vec<EntryDraft>,
    pub snapshot: Option<State>,
}

/// What to load for a stream read. Resolved by the actor, loaded by the caller.
#[derive(Debug)]
pub(crate) struct StreamPlan {
    pub stream_version: u32,
    pub snapshot: Option<State>,
    pub entry_ids: Vec<EntryId>,
}

pub(crate) enum JournalMessage {
    Append {
        request: AppendRequest,
        reply: oneshot::Sender<StorageResult<Vec<Entry>>>,
    },
    JournalReader {
        name: String,
        reply: oneshot::Sender<JournalReader>,
    },
    StreamPlan {
        stream_name: String,
        from_version: u32,
        reply: oneshot::Sender<StreamPlan>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct JournalActor {
    pub name: String,
    pub storage: Arc<dyn StorageDelegate>,
    pub dispatchers: Vec<Arc<dyn Dispatcher>>,
    pub control: DispatcherControl,
    pub gaps: GapRetryReader,
    /// stream name -> stream version -> entry id
    pub streams: HashMap<String, BTreeMap<u32, EntryId>>,
    /// Latest snapshot per stream.
    pub snapshots: HashMap<String, State>,
    pub readers: HashMap<String, JournalReader>,
}

impl JournalActor {
    pub fn new(
        name: String,
        storage: Arc<dyn StorageDelegate>,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        control: DispatcherControl,
        gaps: GapRetryReader,
    ) -> Self {
        Self {
            name,
            storage,
            dispatchers,
            control,
            gaps,
            streams: HashMap::new(),
            snapshots: HashMap::new(),
            readers: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut receiver: mpsc::Receiver<JournalMessage>) {
        info!(journal = %self.name, "journal started");

        while let Some(message) = receiver.recv().await {
            match message {
                JournalMessage::Append { request, reply } => {
                    let span = tracing::debug_span!(
                        "append",
                        journal = %self.name,
                        stream = %request.stream_name,
                        from_version = request.from_version,
                    );
                    let result = self.append(request).instrument(span).await;
                    let _ = reply.send(result);
                }
                JournalMessage::JournalReader { name, reply } => {
                    let _ = reply.send(self.journal_reader(name));
                }
                JournalMessage::StreamPlan {
                    stream_name,
                    from_version,
                    reply,
                } => {
                    let _ = reply.send(self.stream_plan(&stream_name, from_version));
                }
                JournalMessage::Stop { reply } => {
                    receiver.close();
                    self.control.stop().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        // Dropping every handle also ends the loop; the control must not outlive it.
        self.control.stop().await;
        info!(journal = %self.name, "journal stopped");
    }

    async fn append(&mut self, request: AppendRequest) -> StorageResult<Vec<Entry>> {
        let AppendRequest {
            stream_name,
            from_version,
            drafts,
            snapshot,
        } = request;

        let versions = self.check_versions(&stream_name, from_version, drafts.len())?;
        let last_version = from_version + (versions - 1);

        let (entries, dispatchable) = match self
            .write_unit(&stream_name, last_version, drafts, snapshot.clone())
            .await
        {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "append failed, nothing dispatched");
                self.storage.fail().await;
                return Err(e);
            }
        };

        let index = self.streams.entry(stream_name.clone()).or_default();
        for (version, entry) in (from_version..).zip(&entries) {
            index.insert(version, entry.id);
        }
        if let Some(snapshot) = snapshot {
            self.snapshots.insert(stream_name, snapshot);
        }

        debug!(
            count = entries.len(),
            dispatch_id = %dispatchable.id,
            "entries appended"
        );
        dispatch_all(&self.dispatchers, &dispatchable);
        Ok(entries)
    }

    /// Validate an append of `count` entries starting at `from_version`.
    /// Returns `count` as a `u32`.
    fn check_versions(&self, stream_name: &str, from_version: u32, count: usize) -> StorageResult<u32> {
        if stream_name.is_empty() {
            return Err(StorageError::invalid("stream name must not be empty"));
        }
        if count == 0 {
            return Err(StorageError::invalid("nothing to append"));
        }
        if from_version == 0 {
            return Err(StorageError::invalid("stream versions start at 1"));
        }
        let count = u32::try_from(count)
            .ok()
            .filter(|n| from_version.checked_add(n - 1).is_some())
            .ok_or_else(|| StorageError::invalid("stream version overflow"))?;

        if let Some(index) = self.streams.get(stream_name) {
            let last = from_version + (count - 1);
            if let Some((version, _)) = index.range(from_version..=last).next() {
                return Err(StorageError::concurrency_violation(format!(
                    "stream {stream_name} already has version {version}"
                )));
            }
        }
        Ok(count)
    }

    /// Entries and their dispatchable as one write unit.
    async fn write_unit(
        &self,
        stream_name: &str,
        last_version: u32,
        drafts: Vec<EntryDraft>,
        snapshot: Option<State>,
    ) -> StorageResult<(Vec<Entry>, Dispatchable)> {
        self.storage.begin_write().await?;
        let entries = self.storage.append_entries(drafts).await?;
        let dispatchable = Dispatchable::new(
            Dispatchable::journal_id(&self.name, stream_name, last_version, &entries),
            snapshot,
            entries.clone(),
        );
        self.storage.append_dispatchable(&dispatchable).await?;
        self.storage.complete().await?;
        Ok((entries, dispatchable))
    }

    fn journal_reader(&mut self, name: String) -> JournalReader {
        if let Some(reader) = self.readers.get(&name) {
            return reader.clone();
        }
        debug!(journal = %self.name, reader = %name, "journal reader created");
        let reader = JournalReader::new(name.clone(), Arc::clone(&self.storage), self.gaps.clone());
        self.readers.insert(name, reader.clone());
        reader
    }

    fn stream_plan(&self, stream_name: &str, from_version: u32) -> StreamPlan {
        let from_version = from_version.max(1);
        let index = self.streams.get(stream_name);
        let stream_version = index
            .and_then(|index| index.keys().next_back().copied())
            .unwrap_or(0);

        let snapshot = self
            .snapshots
            .get(stream_name)
            .filter(|snapshot| snapshot.data_version >= from_version)
            .cloned();

        let after = match &snapshot {
            Some(snapshot) => snapshot.data_version.checked_add(1),
            None => Some(from_version),
        };

        let entry_ids = match (index, after) {
            (Some(index), Some(after)) => index.range(after..).map(|(_, id)| *id).collect(),
            _ => Vec::new(),
        };

        StreamPlan {
            stream_version,
            snapshot,
            entry_ids,
        }
    }
}
