//! StateStore behavior: optimistic concurrency, round-trips, batch reads and
//! dispatch of writes, against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use stowage_common::{
    DispatchConfig, Dispatchable, DispatchableStore, Entry, EntryDraft, EntryId, EntryLog, EntryReader,
    InMemoryStorage, Metadata, Outcome, Payload, State, StorageDelegate, StorageResult, StoreConfig,
};
use stowage_dispatch::{Dispatcher, DispatcherControl, StoreDeps};
use stowage_journal::Journal;
use stowage_state::{StateStore, StateTypeRegistry, TypedStateBundle};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn registry() -> StateTypeRegistry {
    StateTypeRegistry::new()
        .register("account", "accounts")
        .register("customer", "customers")
}

fn quiet() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.dispatch = DispatchConfig {
        check_interval_ms: 60_000,
        confirmation_expiration_ms: 60_000,
        redispatch_delay_ms: 60_000,
    };
    config
}

async fn start_with(
    storage: Arc<InMemoryStorage>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    config: StoreConfig,
) -> StateStore {
    let deps = StoreDeps::builder()
        .storage(storage as Arc<dyn StorageDelegate>)
        .dispatchers(dispatchers)
        .config(config)
        .build();
    StateStore::start("bank", registry(), deps).await.unwrap()
}

async fn start(storage: Arc<InMemoryStorage>) -> StateStore {
    start_with(storage, Vec::new(), quiet()).await
}

fn account(id: &str, version: u32, balance: i64) -> State {
    State::new(id, "account", version, format!("{{\"balance\":{balance}}}"))
}

/// Confirms after dropping the first `drop_first` deliveries.
#[derive(Default)]
struct CountingDispatcher {
    control: OnceLock<DispatcherControl>,
    drop_first: usize,
    attempts: AtomicUsize,
    confirmed: Mutex<Vec<Dispatchable>>,
}

#[async_trait]
impl Dispatcher for CountingDispatcher {
    fn control_with(&self, control: DispatcherControl) {
        let _ = self.control.set(control);
    }

    async fn dispatch(&self, dispatchable: Dispatchable) -> anyhow::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.drop_first {
            anyhow::bail!("dropped");
        }
        self.control
            .get()
            .expect("control")
            .confirm_dispatched(&dispatchable.id)
            .await?;
        self.confirmed.lock().unwrap().push(dispatchable);
        Ok(())
    }
}

/// In-memory backend counting how read units are opened and closed.
#[derive(Default)]
struct UnitCountingStorage {
    inner: InMemoryStorage,
    begun_reads: AtomicUsize,
    completed_units: AtomicUsize,
    failed_units: AtomicUsize,
}

#[async_trait]
impl EntryLog for UnitCountingStorage {
    async fn append_entries(&self, drafts: Vec<EntryDraft>) -> StorageResult<Vec<Entry>> {
        self.inner.append_entries(drafts).await
    }

    async fn read_from(&self, from: EntryId, max: usize) -> StorageResult<Vec<Entry>> {
        self.inner.read_from(from, max).await
    }

    async fn read_ids(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>> {
        self.inner.read_ids(ids).await
    }

    async fn last_entry_id(&self) -> StorageResult<Option<EntryId>> {
        self.inner.last_entry_id().await
    }
}

#[async_trait]
impl DispatchableStore for UnitCountingStorage {
    async fn append_dispatchable(&self, dispatchable: &Dispatchable) -> StorageResult<()> {
        self.inner.append_dispatchable(dispatchable).await
    }

    async fn delete_dispatchable(&self, dispatch_id: &str) -> StorageResult<()> {
        self.inner.delete_dispatchable(dispatch_id).await
    }

    async fn all_dispatchables(&self) -> StorageResult<Vec<Dispatchable>> {
        self.inner.all_dispatchables().await
    }
}

#[async_trait]
impl StorageDelegate for UnitCountingStorage {
    async fn begin_read(&self) -> StorageResult<()> {
        self.begun_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete(&self) -> StorageResult<()> {
        self.completed_units.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fail(&self) {
        self.failed_units.fetch_add(1, Ordering::SeqCst);
    }

    async fn read_state(&self, store_name: &str, id: &str) -> StorageResult<Option<State>> {
        self.inner.read_state(store_name, id).await
    }

    async fn write_state(&self, store_name: &str, state: &State) -> StorageResult<()> {
        self.inner.write_state(store_name, state).await
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Optimistic concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_or_equal_version_is_rejected_and_leaves_state_alone() {
    init_tracing();
    let store = start(Arc::new(InMemoryStorage::new())).await;

    store.write(account("acct-1", 1, 100), Vec::new()).await.unwrap();

    for stale in [1, 0] {
        let err = store
            .write(account("acct-1", stale, 999), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), Outcome::ConcurrencyViolation);
    }
    let stored = store.read("acct-1", "account").await.unwrap();
    assert_eq!(stored, account("acct-1", 1, 100));

    store.write(account("acct-1", 2, 150), Vec::new()).await.unwrap();
    let stored = store.read("acct-1", "account").await.unwrap();
    assert_eq!(stored.data_version, 2);
    assert_eq!(stored.data, Payload::from("{\"balance\":150}"));
}

#[tokio::test]
async fn concurrent_writers_of_one_version_have_exactly_one_winner() {
    let store = start(Arc::new(InMemoryStorage::new())).await;

    let writes = (0..8).map(|n| {
        let store = store.clone();
        tokio::spawn(async move { store.write(account("acct-9", 1, n), Vec::new()).await })
    });
    let results: Vec<_> = futures::future::join_all(writes).await;

    let winners = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(winners, 1);
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payloads_and_metadata_round_trip() {
    let store = start(Arc::new(InMemoryStorage::new())).await;
    let metadata = Metadata::new("opened by teller 12", "open");

    let binary = State::new("acct-bin", "account", 1, vec![0u8, 159, 146, 150, 255]).with_metadata(metadata.clone());
    let text = State::new("acct-text", "account", 1, "plain text").with_metadata(metadata.clone());
    let object = State::new(
        "cust-1",
        "customer",
        1,
        serde_json::json!({"name": "Ada", "tags": ["vip"], "limit": 2500}),
    )
    .with_type_version(3)
    .with_metadata(metadata.clone());

    for state in [binary.clone(), text.clone(), object.clone()] {
        store.write(state, Vec::new()).await.unwrap();
    }

    assert_eq!(store.read("acct-bin", "account").await.unwrap(), binary);
    assert_eq!(store.read("acct-text", "account").await.unwrap(), text);

    let read = store.read("cust-1", "customer").await.unwrap();
    assert_eq!(read, object);
    assert_eq!(read.metadata, metadata);
    assert_eq!(read.type_version, 3);
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reads_report_not_found_no_type_store_and_error() {
    let store = start(Arc::new(InMemoryStorage::new())).await;

    assert_eq!(
        store.read("acct-404", "account").await.unwrap_err().outcome(),
        Outcome::NotFound
    );
    assert_eq!(
        store.read("x", "loan").await.unwrap_err().outcome(),
        Outcome::NoTypeStore
    );
    assert_eq!(store.read("", "account").await.unwrap_err().outcome(), Outcome::Error);
    assert_eq!(store.read("x", "").await.unwrap_err().outcome(), Outcome::Error);
}

#[tokio::test]
async fn writes_report_no_type_store_and_error() {
    let storage = Arc::new(InMemoryStorage::new());
    let store = start(storage.clone()).await;

    let loan = State::new("loan-1", "loan", 1, "{}");
    assert_eq!(
        store.write(loan, Vec::new()).await.unwrap_err().outcome(),
        Outcome::NoTypeStore
    );
    assert_eq!(
        store.write(account("", 1, 0), Vec::new()).await.unwrap_err().outcome(),
        Outcome::Error
    );
    assert_eq!(storage.pending_dispatchables().await, 0);
}

#[tokio::test]
async fn read_all_returns_partial_results_with_combined_outcome() {
    let store = start(Arc::new(InMemoryStorage::new())).await;
    store.write(account("acct-1", 1, 10), Vec::new()).await.unwrap();
    store.write(account("acct-2", 1, 20), Vec::new()).await.unwrap();

    let all = store
        .read_all(vec![
            TypedStateBundle::new("acct-1", "account"),
            TypedStateBundle::new("acct-2", "account"),
        ])
        .await;
    assert!(all.is_success());
    assert_eq!(all.found().count(), 2);

    let partial = store
        .read_all(vec![
            TypedStateBundle::new("acct-1", "account"),
            TypedStateBundle::new("acct-3", "account"),
            TypedStateBundle::new("acct-2", "account"),
        ])
        .await;
    assert_eq!(partial.outcome, Outcome::NotAllFound);
    assert_eq!(
        partial.found().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        vec!["acct-1", "acct-2"]
    );
    assert_eq!(partial.bundles[1].outcome, Outcome::NotFound);

    let unmapped = store
        .read_all(vec![
            TypedStateBundle::new("acct-3", "account"),
            TypedStateBundle::new("loan-1", "loan"),
        ])
        .await;
    assert_eq!(unmapped.outcome, Outcome::NoTypeStore);
}

// ---------------------------------------------------------------------------
// Dispatch and the shared log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_appends_sources_and_dispatches_state() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(CountingDispatcher::default());
    let store = start_with(storage.clone(), vec![dispatcher.clone() as Arc<dyn Dispatcher>], quiet()).await;

    let written = store
        .write(
            account("acct-1", 1, 100),
            vec![EntryDraft::new("account_opened", "{}"), EntryDraft::new("deposited", "{\"amount\":100}")],
        )
        .await
        .unwrap();
    assert_eq!(written.entries.len(), 2);

    tokio::time::timeout(Duration::from_secs(2), async {
        while dispatcher.confirmed.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let confirmed = dispatcher.confirmed.lock().unwrap().clone();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id, "bank:accounts:acct-1:1");
    assert_eq!(confirmed[0].state.as_ref().map(|s| s.data_version), Some(1));
    assert_eq!(confirmed[0].entries, written.entries);

    let reader = store.entry_reader("audit").await.unwrap();
    let logged = reader.read_next_batch(10).await.unwrap();
    assert_eq!(
        logged.iter().map(|e| e.type_name.as_str()).collect::<Vec<_>>(),
        vec!["account_opened", "deposited"]
    );
}

#[tokio::test]
async fn each_version_keeps_its_own_pending_dispatchable() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let never = Arc::new(CountingDispatcher {
        drop_first: usize::MAX,
        ..CountingDispatcher::default()
    });
    let mut config = quiet();
    config.dispatch.confirmation_expiration_ms = 0;
    let store = start_with(storage.clone(), vec![never.clone() as Arc<dyn Dispatcher>], config).await;

    let v1 = store
        .write(account("acct-1", 1, 100), vec![EntryDraft::new("account_opened", "{}")])
        .await
        .unwrap();
    let v2 = store
        .write(account("acct-1", 2, 200), vec![EntryDraft::new("deposited", "{\"amount\":100}")])
        .await
        .unwrap();

    let mut pending = storage.all_dispatchables().await.unwrap();
    pending.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(
        pending.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["bank:accounts:acct-1:1", "bank:accounts:acct-1:2"]
    );
    assert_eq!(pending[0].entries, v1.entries);
    assert_eq!(pending[1].entries, v2.entries);

    // A late confirm of the first version leaves the second one pending.
    store
        .dispatcher_control()
        .confirm_dispatched("bank:accounts:acct-1:1")
        .await
        .unwrap();
    let pending = storage.all_dispatchables().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "bank:accounts:acct-1:2");
    assert_eq!(pending[0].state.as_ref().map(|s| s.data_version), Some(2));

    let seen = never.clone();
    wait_for(move || seen.attempts.load(Ordering::SeqCst) >= 2).await;
    let before = never.attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.dispatcher_control().dispatch_unconfirmed().await.unwrap(), 1);
    let seen = never.clone();
    wait_for(move || seen.attempts.load(Ordering::SeqCst) > before).await;
}

#[tokio::test]
async fn reads_close_their_read_unit() {
    let storage = Arc::new(UnitCountingStorage::default());
    let deps = StoreDeps::builder()
        .storage(storage.clone() as Arc<dyn StorageDelegate>)
        .dispatchers(Vec::new())
        .config(quiet())
        .build();
    let store = StateStore::start("bank", registry(), deps).await.unwrap();
    store.write(account("acct-1", 1, 100), Vec::new()).await.unwrap();
    let completed_after_write = storage.completed_units.load(Ordering::SeqCst);

    store.read("acct-1", "account").await.unwrap();
    assert_eq!(
        store.read("acct-2", "account").await.unwrap_err().outcome(),
        Outcome::NotFound
    );

    assert_eq!(storage.begun_reads.load(Ordering::SeqCst), 2);
    assert_eq!(
        storage.completed_units.load(Ordering::SeqCst) - completed_after_write,
        2
    );
    assert_eq!(storage.failed_units.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn journal_and_state_store_on_one_delegate_dispatch_only_their_own_writes() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = quiet();
    config.dispatch = DispatchConfig {
        check_interval_ms: 10,
        confirmation_expiration_ms: 5,
        redispatch_delay_ms: 10,
    };

    let journal_dispatcher = Arc::new(CountingDispatcher {
        drop_first: 2,
        ..CountingDispatcher::default()
    });
    let journal_deps = StoreDeps::builder()
        .storage(storage.clone() as Arc<dyn StorageDelegate>)
        .dispatchers(vec![journal_dispatcher.clone() as Arc<dyn Dispatcher>])
        .config(config.clone())
        .build();
    let journal = Journal::start("ledger", journal_deps).await.unwrap();

    let store_dispatcher = Arc::new(CountingDispatcher {
        drop_first: 2,
        ..CountingDispatcher::default()
    });
    let store = start_with(
        storage.clone(),
        vec![store_dispatcher.clone() as Arc<dyn Dispatcher>],
        config,
    )
    .await;

    journal
        .append("acct-1", 1, EntryDraft::new("account_opened", "{}"))
        .await
        .unwrap();
    store.write(account("acct-1", 1, 100), Vec::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while storage.pending_dispatchables().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both writes should be confirmed");

    let journal_seen = journal_dispatcher.confirmed.lock().unwrap().clone();
    let store_seen = store_dispatcher.confirmed.lock().unwrap().clone();
    assert!(!journal_seen.is_empty());
    assert!(!store_seen.is_empty());
    assert!(journal_seen.iter().all(|d| d.is_owned_by("ledger")), "{journal_seen:?}");
    assert!(store_seen.iter().all(|d| d.is_owned_by("bank")), "{store_seen:?}");

    journal.stop().await;
    store.stop().await;
}

#[tokio::test]
async fn store_names_must_prefix_dispatch_ids_cleanly() {
    for name in ["", "bank:eu"] {
        let deps = StoreDeps::builder()
            .storage(Arc::new(InMemoryStorage::new()) as Arc<dyn StorageDelegate>)
            .dispatchers(Vec::new())
            .config(quiet())
            .build();
        let err = StateStore::start(name, registry(), deps).await.unwrap_err();
        assert_eq!(err.outcome(), Outcome::Error, "{name:?} accepted");
    }
}

#[tokio::test]
async fn dropped_deliveries_are_redispatched() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(CountingDispatcher {
        drop_first: 3,
        ..CountingDispatcher::default()
    });
    let mut config = quiet();
    config.dispatch = DispatchConfig {
        check_interval_ms: 10,
        confirmation_expiration_ms: 5,
        redispatch_delay_ms: 10,
    };
    let store = start_with(storage.clone(), vec![dispatcher.clone() as Arc<dyn Dispatcher>], config).await;

    store.write(account("acct-1", 1, 100), Vec::new()).await.unwrap();
    store.write(account("acct-2", 1, 50), Vec::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while storage.pending_dispatchables().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every write should be confirmed");

    let confirmed = dispatcher.confirmed.lock().unwrap().clone();
    for id in ["bank:accounts:acct-1:1", "bank:accounts:acct-2:1"] {
        assert!(confirmed.iter().any(|d| d.id == id), "{id} never confirmed");
    }

    store.stop().await;
}

#[tokio::test]
async fn stopped_store_rejects_requests() {
    let storage = Arc::new(InMemoryStorage::new());
    let store = start(storage.clone()).await;
    store.write(account("acct-1", 1, 100), Vec::new()).await.unwrap();

    store.stop().await;
    assert!(store.is_stopped());
    assert!(storage.is_closed().await);

    assert_eq!(
        store.write(account("acct-1", 2, 1), Vec::new()).await.unwrap_err().outcome(),
        Outcome::Failure
    );
    assert_eq!(
        store.read("acct-1", "account").await.unwrap_err().outcome(),
        Outcome::Failure
    );
    assert_eq!(
        store.entry_reader("late").await.unwrap_err().outcome(),
        Outcome::Failure
    );
}

#[test]
fn registry_loads_from_toml() {
    let registry: StateTypeRegistry = toml::from_str(
        r#"
        account = "accounts"
        customer = "customers"
        "#,
    )
    .unwrap();
    assert_eq!(registry.store_for("customer"), Some("customers"));
}
