//! State store actor. Serializes writes so the version check and the write
//! that follows it cannot interleave with another write.

use std::collections::HashMap;
use std::sync::Arc;

use stowage_common::{
    DelegateEntryReader, Dispatchable, Entry, EntryDraft, GapRetryReader, State, StorageDelegate,
    StorageError, StorageResult,
};
use stowage_dispatch::{dispatch_all, Dispatcher, DispatcherControl};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use crate::bundle::Written;
use crate::registry::StateTypeRegistry;

pub(crate) enum StateMessage {
    Write {
        state: State,
        sources: Vec<EntryDraft>,
        reply: oneshot::Sender<StorageResult<Written>>,
    },
    EntryReader {
        name: String,
        reply: oneshot::Sender<DelegateEntryReader>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct StateActor {
    pub name: String,
    pub registry: Arc<StateTypeRegistry>,
    pub storage: Arc<dyn StorageDelegate>,
    pub dispatchers: Vec<Arc<dyn Dispatcher>>,
    pub control: DispatcherControl,
    pub gaps: GapRetryReader,
    pub readers: HashMap<String, DelegateEntryReader>,
}

impl StateActor {
    pub async fn run(mut self, mut receiver: mpsc::Receiver<StateMessage>) {
        info!(store = %self.name, types = self.registry.len(), "state store started");

        while let Some(message) = receiver.recv().await {
            match message {
                StateMessage::Write {
                    state,
                    sources,
                    reply,
                } => {
                    let span = tracing::debug_span!(
                        "write",
                        store = %self.name,
                        id = %state.id,
                        data_version = state.data_version,
                    );
                    let result = self.write(state, sources).instrument(span).await;
                    let _ = reply.send(result);
                }
                StateMessage::EntryReader { name, reply } => {
                    let _ = reply.send(self.entry_reader(name));
                }
                StateMessage::Stop { reply } => {
                    receiver.close();
                    self.control.stop().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.control.stop().await;
        info!(store = %self.name, "state store stopped");
    }

    async fn write(&mut self, state: State, sources: Vec<EntryDraft>) -> StorageResult<Written> {
        if state.id.is_empty() {
            return Err(StorageError::invalid("state id must not be empty"));
        }
        if state.type_name.is_empty() {
            return Err(StorageError::invalid("state type must not be empty"));
        }
        let store_name = self
            .registry
            .store_for(&state.type_name)
            .ok_or_else(|| StorageError::no_type_store(format!("no store for type {}", state.type_name)))?
            .to_string();

        let (entries, dispatchable) = match self.write_unit(&store_name, &state, sources).await {
            Ok(written) => written,
            Err(e) => {
                debug!(outcome = %e.outcome(), error = %e, "write rejected");
                self.storage.fail().await;
                return Err(e);
            }
        };

        debug!(dispatch_id = %dispatchable.id, sources = entries.len(), "state written");
        dispatch_all(&self.dispatchers, &dispatchable);
        Ok(Written { state, entries })
    }

    /// Version check, state, source entries and dispatchable as one write unit.
    async fn write_unit(
        &self,
        store_name: &str,
        state: &State,
        sources: Vec<EntryDraft>,
    ) -> StorageResult<(Vec<Entry>, Dispatchable)> {
        self.storage.begin_write().await?;

        if let Some(prior) = self.storage.read_state(store_name, &state.id).await? {
            if prior.data_version >= state.data_version {
                return Err(StorageError::concurrency_violation(format!(
                    "{store_name}:{} is at version {}, write carries {}",
                    state.id, prior.data_version, state.data_version
                )));
            }
        }

        self.storage.write_state(store_name, state).await?;

        let entries = if sources.is_empty() {
            Vec::new()
        } else {
            self.storage.append_entries(sources).await?
        };

        let dispatchable = Dispatchable::new(
            Dispatchable::state_store_id(&self.name, store_name, &state.id, state.data_version),
            Some(state.clone()),
            entries.clone(),
        );
        self.storage.append_dispatchable(&dispatchable).await?;
        self.storage.complete().await.map_err(|e| {
            warn!(error = %e, "write unit did not complete");
            e
        })?;
        Ok((entries, dispatchable))
    }

    fn entry_reader(&mut self, name: String) -> DelegateEntryReader {
        if let Some(reader) = self.readers.get(&name) {
            return reader.clone();
        }
        debug!(store = %self.name, reader = %name, "entry reader created");
        let reader = DelegateEntryReader::new(name.clone(), Arc::clone(&self.storage), self.gaps.clone());
        self.readers.insert(name, reader.clone());
        reader
    }
}
