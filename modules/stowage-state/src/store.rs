use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use stowage_common::{
    DelegateEntryReader, EntryDraft, GapRetryReader, Outcome, State, StorageDelegate, StorageError,
    StorageResult,
};
use stowage_dispatch::{DispatcherControl, StoreDeps};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, Instrument};

use crate::actor::{StateActor, StateMessage};
use crate::bundle::{ReadAllResult, StateBundle, TypedStateBundle, Written};
use crate::registry::StateTypeRegistry;

const MAILBOX_CAPACITY: usize = 256;

/// Key-value store of versioned states with optimistic concurrency.
///
/// Writes go through the store's actor one at a time; reads go straight to
/// the delegate and may run concurrently.
#[derive(Clone)]
pub struct StateStore {
    name: Arc<str>,
    sender: mpsc::Sender<StateMessage>,
    registry: Arc<StateTypeRegistry>,
    storage: Arc<dyn StorageDelegate>,
    control: DispatcherControl,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("stopped", &self.sender.is_closed())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Prepare the schema, start the dispatcher control and the actor.
    ///
    /// `name` prefixes every dispatch id this store writes, so it must be
    /// non-empty, free of `:` and unique among the stores sharing a delegate.
    pub async fn start(
        name: impl Into<String>,
        registry: StateTypeRegistry,
        deps: StoreDeps,
    ) -> StorageResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(StorageError::invalid(format!("invalid state store name {name:?}")));
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
        let registry = Arc::new(registry);

        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = StateActor {
            name: name.clone(),
            registry: Arc::clone(&registry),
            storage: Arc::clone(&storage),
            dispatchers,
            control: control.clone(),
            gaps: GapRetryReader::from_config(&config.gap_retry),
            readers: HashMap::new(),
        };
        let span = info_span!("state_store", store = %name);
        tokio::spawn(actor.run(receiver).instrument(span));

        Ok(Self {
            name: name.into(),
            sender,
            registry,
            storage,
            control,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `state` if its `data_version` is newer than the stored one,
    /// append `sources` to the shared entry log and dispatch both.
    ///
    /// # Errors
    ///
    /// - `NoTypeStore` if the state's type is not registered.
    /// - `ConcurrencyViolation` if the stored version is the same or newer;
    ///   the stored state is left as it was.
    /// - `Error` for an empty id or type, `Failure` for a delegate failure.
    pub async fn write(&self, state: State, sources: Vec<EntryDraft>) -> StorageResult<Written> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StateMessage::Write {
                state,
                sources,
                reply,
            },
            rx,
        )
        .await?
    }

    /// The stored state for `id` of type `type_name`.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `NoTypeStore` if the type is not registered,
    /// `Error` for an empty id or type.
    pub async fn read(&self, id: &str, type_name: &str) -> StorageResult<State> {
        if id.is_empty() {
            return Err(StorageError::invalid("state id must not be empty"));
        }
        if type_name.is_empty() {
            return Err(StorageError::invalid("state type must not be empty"));
        }
        let store_name = self
            .registry
            .store_for(type_name)
            .ok_or_else(|| StorageError::no_type_store(format!("no store for type {type_name}")))?;
        if self.is_stopped() {
            return Err(self.stopped());
        }

        self.storage.begin_read().await?;
        let stored = match self.storage.read_state(store_name, id).await {
            Ok(stored) => {
                self.storage.complete().await?;
                stored
            }
            Err(e) => {
                self.storage.fail().await;
                return Err(e);
            }
        };
        let state = stored
            .filter(|state| state.type_name == type_name)
            .ok_or_else(|| StorageError::not_found(format!("{store_name}:{id} not found")))?;

        debug!(store = %self.name, id, data_version = state.data_version, "state read");
        Ok(state)
    }

    /// Read every bundle concurrently. Per-bundle results are returned
    /// alongside the combined outcome, so misses do not hide the hits.
    pub async fn read_all(&self, bundles: Vec<TypedStateBundle>) -> ReadAllResult {
        let reads = bundles.iter().map(|bundle| self.read(&bundle.id, &bundle.type_name));
        let results = join_all(reads).await;

        let bundles = bundles
            .into_iter()
            .zip(results)
            .map(|(bundle, result)| {
                let (state, outcome) = match result {
                    Ok(state) => (Some(state), Outcome::Success),
                    Err(e) => (None, e.outcome()),
                };
                StateBundle {
                    id: bundle.id,
                    type_name: bundle.type_name,
                    state,
                    outcome,
                }
            })
            .collect();

        ReadAllResult::from_bundles(bundles)
    }

    /// Named reader over the shared entry log, created on first use.
    pub async fn entry_reader(&self, name: &str) -> StorageResult<DelegateEntryReader> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StateMessage::EntryReader {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub fn dispatcher_control(&self) -> &DispatcherControl {
        &self.control
    }

    /// Stop the dispatcher control, close the delegate and end the actor.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(StateMessage::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    fn stopped(&self) -> StorageError {
        StorageError::failure(format!("state store {} is stopped", self.name))
    }

    async fn request<T>(&self, message: StateMessage, rx: oneshot::Receiver<T>) -> StorageResult<T> {
        self.sender.send(message).await.map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }
}
