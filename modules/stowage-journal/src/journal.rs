use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use stowage_common::{
    DelegateEntryReader, Entry, EntryDraft, EntryId, GapRetryReader, GappedEntries, State,
    StorageDelegate, StorageError, StorageResult,
};
use stowage_dispatch::{DispatcherControl, StoreDeps};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, Instrument};

use crate::actor::{AppendRequest, JournalActor, JournalMessage, StreamPlan};
use crate::stream::StreamReader;

/// Cursor over a journal's whole entry log.
pub type JournalReader = DelegateEntryReader;

const MAILBOX_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only entry log partitioned into named streams.
///
/// Cloneable handle to a journal actor. Appends are applied one at a time in
/// the order the actor receives them; reads load entries outside the actor.
#[derive(Clone)]
pub struct Journal {
    name: Arc<str>,
    sender: mpsc::Sender<JournalMessage>,
    storage: Arc<dyn StorageDelegate>,
    control: DispatcherControl,
    gaps: GapRetryReader,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("name", &self.name)
            .field("stopped", &self.sender.is_closed())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Prepare the schema, start the dispatcher control and the actor.
    ///
    /// `name` prefixes every dispatch id this journal writes, so it must be
    /// non-empty, free of `:` and unique among the stores sharing a delegate.
    pub async fn start(name: impl Into<String>, deps: StoreDeps) -> StorageResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(StorageError::invalid(format!("invalid journal name {name:?}")));
        }
        let StoreDeps {
            storage,
            dispatchers,
            config,
        } = deps;

        storage.create_schema_if_needed().await?;

        let control = DispatcherControl::spawn_owned(
            name.clone(),
            Arc::clone(&storage),
            dispatchers.clone(),
            config.dispatch,
        );
        let gaps = GapRetryReader::from_config(&config.gap_retry);

        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = JournalActor::new(
            name.clone(),
            Arc::clone(&storage),
            dispatchers,
            control.clone(),
            gaps.clone(),
        );
        let span = info_span!("journal", journal = %name);
        tokio::spawn(actor.run(receiver).instrument(span));

        Ok(Self {
            name: name.into(),
            sender,
            storage,
            control,
            gaps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one entry as `stream_version` of `stream_name`.
    ///
    /// # Errors
    ///
    /// [`Outcome::ConcurrencyViolation`](stowage_common::Outcome) if the
    /// stream already has that version, `Error` for an empty stream name or
    /// version 0, `Failure` if the delegate fails. Nothing is dispatched on
    /// error.
    pub async fn append(&self, stream_name: &str, stream_version: u32, draft: EntryDraft) -> StorageResult<Entry> {
        let entries = self.append_request(stream_name, stream_version, vec![draft], None).await?;
        single(entries)
    }

    /// Like [`Journal::append`], also recording `snapshot` as the stream's
    /// latest and carrying it in the dispatchable.
    pub async fn append_with(
        &self,
        stream_name: &str,
        stream_version: u32,
        draft: EntryDraft,
        snapshot: State,
    ) -> StorageResult<Entry> {
        let entries = self
            .append_request(stream_name, stream_version, vec![draft], Some(snapshot))
            .await?;
        single(entries)
    }

    /// Append `drafts` as consecutive versions starting at `from_stream_version`.
    /// One dispatchable carries the whole batch.
    pub async fn append_all(
        &self,
        stream_name: &str,
        from_stream_version: u32,
        drafts: Vec<EntryDraft>,
    ) -> StorageResult<Vec<Entry>> {
        self.append_request(stream_name, from_stream_version, drafts, None).await
    }

    pub async fn append_all_with(
        &self,
        stream_name: &str,
        from_stream_version: u32,
        drafts: Vec<EntryDraft>,
        snapshot: State,
    ) -> StorageResult<Vec<Entry>> {
        self.append_request(stream_name, from_stream_version, drafts, Some(snapshot))
            .await
    }

    /// The named reader over the whole log, created on first use. Readers
    /// with different names move independently.
    pub async fn journal_reader(&self, name: &str) -> StorageResult<JournalReader> {
        let (reply, rx) = oneshot::channel();
        self.request(
            JournalMessage::JournalReader {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub fn stream_reader(&self, name: &str) -> StreamReader {
        StreamReader::new(name, self.clone())
    }

    /// The control confirming this journal's dispatchables.
    pub fn dispatcher_control(&self) -> &DispatcherControl {
        &self.control
    }

    /// Stop the dispatcher control, close the delegate and end the actor.
    /// Later requests fail with `Failure`.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(JournalMessage::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) async fn stream_plan(&self, stream_name: &str, from_version: u32) -> StorageResult<StreamPlan> {
        if stream_name.is_empty() {
            return Err(StorageError::invalid("stream name must not be empty"));
        }
        let (reply, rx) = oneshot::channel();
        self.request(
            JournalMessage::StreamPlan {
                stream_name: stream_name.to_string(),
                from_version,
                reply,
            },
            rx,
        )
        .await
    }

    /// Read `ids` from the log, ascending. Ids the log does not show yet are
    /// retried; any still missing after the retry budget are left out.
    pub(crate) async fn load_entries(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.storage.begin_read().await?;
        let mut found = match self.storage.read_ids(ids).await {
            Ok(found) => {
                self.storage.complete().await?;
                found
            }
            Err(e) => {
                self.storage.fail().await;
                return Err(e);
            }
        };

        let present: HashSet<EntryId> = found.iter().map(|e| e.id).collect();
        let missing: Vec<EntryId> = ids.iter().copied().filter(|id| !present.contains(id)).collect();
        if missing.is_empty() {
            found.sort_by_key(|e| e.id);
            return Ok(found);
        }

        debug!(journal = %self.name, missing = missing.len(), "stream entries not yet visible");
        let storage = Arc::clone(&self.storage);
        let (gapped, rx) = GappedEntries::batch(found, missing);
        self.gaps.read_gaps(gapped, move |ids| {
            let storage = Arc::clone(&storage);
            async move { storage.read_ids(&ids).await }
        });
        rx.await
            .map_err(|_| StorageError::failure("gap retry ended without completing the read"))
    }

    async fn append_request(
        &self,
        stream_name: &str,
        from_version: u32,
        drafts: Vec<EntryDraft>,
        snapshot: Option<State>,
    ) -> StorageResult<Vec<Entry>> {
        let (reply, rx) = oneshot::channel();
        let request = AppendRequest {
            stream_name: stream_name.to_string(),
            from_version,
            drafts,
            snapshot,
        };
        self.request(JournalMessage::Append { request, reply }, rx).await?
    }

    async fn request<T>(&self, message: JournalMessage, rx: oneshot::Receiver<T>) -> StorageResult<T> {
        let stopped = || StorageError::failure(format!("journal {} is stopped", self.name));
        self.sender.send(message).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn single(entries: Vec<Entry>) -> StorageResult<Entry> {
    entries
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::failure("append returned no entry"))
}
