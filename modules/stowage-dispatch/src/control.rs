//! DispatcherControl: confirms delivered dispatchables and redelivers the
//! ones left unconfirmed.
//!
//! The control is an actor: one task owns the delegate and the dispatcher
//! list and handles confirmations and reconciliation ticks one at a time.
//! Redeliveries are spawned, never awaited, so a slow dispatcher or one that
//! confirms from inside `dispatch` cannot stall the loop. A tick may
//! redeliver something an earlier attempt is still delivering; dispatchers
//! absorb the duplicate.
//!
//! Several stores may share one delegate and so one dispatchables table. A
//! control started with [`DispatcherControl::spawn_owned`] only confirms and
//! redelivers the records whose id starts with its owner's name, so each
//! store's dispatchers see only that store's writes.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use stowage_common::{
    DispatchConfig, Dispatchable, DispatchableStore, Outcome, StorageError, StorageResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dispatcher::{dispatch_all, Dispatcher};

const MAILBOX_CAPACITY: usize = 256;

enum ControlMessage {
    Confirm {
        dispatch_id: String,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    DispatchUnconfirmed {
        reply: oneshot::Sender<StorageResult<usize>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running dispatcher control.
#[derive(Clone)]
pub struct DispatcherControl {
    sender: mpsc::Sender<ControlMessage>,
}

impl fmt::Debug for DispatcherControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherControl")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl DispatcherControl {
    /// Start a control over every record in `delegate` and hand it to every
    /// dispatcher.
    ///
    /// The first reconciliation runs after `redispatch_delay`, then every
    /// `check_interval`. Must be called from within a tokio runtime.
    pub fn spawn<D>(
        delegate: Arc<D>,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        config: DispatchConfig,
    ) -> Self
    where
        D: DispatchableStore + ?Sized + 'static,
    {
        Self::start(delegate, dispatchers, config, None)
    }

    /// Like [`DispatcherControl::spawn`], limited to the records written by
    /// the store named `owner`.
    pub fn spawn_owned<D>(
        owner: impl Into<String>,
        delegate: Arc<D>,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        config: DispatchConfig,
    ) -> Self
    where
        D: DispatchableStore + ?Sized + 'static,
    {
        Self::start(delegate, dispatchers, config, Some(owner.into()))
    }

    fn start<D>(
        delegate: Arc<D>,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        config: DispatchConfig,
        owner: Option<String>,
    ) -> Self
    where
        D: DispatchableStore + ?Sized + 'static,
    {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let control = Self { sender };
        for dispatcher in &dispatchers {
            dispatcher.control_with(control.clone());
        }

        let span = info_span!("dispatcher_control", owner = owner.as_deref().unwrap_or("*"));
        let actor = ControlActor {
            delegate,
            dispatchers,
            config,
            owner,
        };
        tokio::spawn(actor.run(receiver).instrument(span));
        control
    }

    /// Delete the dispatchable with `dispatch_id`. Confirming an id that is
    /// already gone succeeds.
    ///
    /// # Errors
    ///
    /// [`Outcome::Error`] if the id belongs to another owner's records,
    /// [`Outcome::Failure`] if the delegate fails or the control is stopped.
    pub async fn confirm_dispatched(&self, dispatch_id: &str) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            ControlMessage::Confirm {
                dispatch_id: dispatch_id.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Redeliver every dispatchable older than the confirmation expiration.
    /// Returns how many were redelivered.
    pub async fn dispatch_unconfirmed(&self) -> StorageResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlMessage::DispatchUnconfirmed { reply }, rx)
            .await?
    }

    /// Cancel the timer and close the delegate. Later calls do nothing.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(ControlMessage::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(&self, message: ControlMessage, rx: oneshot::Receiver<T>) -> StorageResult<T> {
        let stopped = || StorageError::new(Outcome::Failure, "dispatcher control is stopped");
        self.sender.send(message).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

struct ControlActor<D: ?Sized> {
    delegate: Arc<D>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    config: DispatchConfig,
    /// Only records of this store are confirmed and redelivered.
    owner: Option<String>,
}

impl<D> ControlActor<D>
where
    D: DispatchableStore + ?Sized + 'static,
{
    async fn run(self, mut receiver: mpsc::Receiver<ControlMessage>) {
        let period = self.config.check_interval().max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.redispatch_delay(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            dispatchers = self.dispatchers.len(),
            check_interval_ms = self.config.check_interval_ms,
            confirmation_expiration_ms = self.config.confirmation_expiration_ms,
            "dispatcher control started"
        );

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(ControlMessage::Confirm { dispatch_id, reply }) => {
                        let result = self.confirm(&dispatch_id).await;
                        let _ = reply.send(result);
                    }
                    Some(ControlMessage::DispatchUnconfirmed { reply }) => {
                        let result = self.dispatch_unconfirmed().await;
                        let _ = reply.send(result);
                    }
                    Some(ControlMessage::Stop { reply }) => {
                        receiver.close();
                        self.delegate.close().await;
                        let _ = reply.send(());
                        break;
                    }
                    // Every handle dropped.
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_unconfirmed().await {
                        warn!(error = %e, "redispatch scan failed");
                    }
                }
            }
        }

        info!("dispatcher control stopped");
    }

    fn owns(&self, dispatch_id: &str) -> bool {
        self.owner
            .as_deref()
            .map_or(true, |owner| Dispatchable::id_owned_by(dispatch_id, owner))
    }

    async fn confirm(&self, dispatch_id: &str) -> StorageResult<()> {
        if !self.owns(dispatch_id) {
            warn!(dispatch_id, owner = ?self.owner, "confirm for a record this control does not own");
            return Err(StorageError::invalid(format!(
                "dispatch {dispatch_id} does not belong to {}",
                self.owner.as_deref().unwrap_or_default()
            )));
        }
        self.delegate
            .delete_dispatchable(dispatch_id)
            .await
            .map_err(|e| {
                warn!(dispatch_id, error = %e, "confirm failed");
                StorageError::with_source(
                    Outcome::Failure,
                    format!("failed to confirm dispatch {dispatch_id}"),
                    e,
                )
            })?;
        debug!(dispatch_id, "dispatch confirmed");
        Ok(())
    }

    async fn dispatch_unconfirmed(&self) -> StorageResult<usize> {
        let expiration = self.config.confirmation_expiration();
        let now = Utc::now();

        let expired: Vec<_> = self
            .delegate
            .all_dispatchables()
            .await?
            .into_iter()
            .filter(|d| self.owns(&d.id) && d.age(now) > expiration)
            .collect();

        for dispatchable in &expired {
            debug!(dispatch_id = %dispatchable.id, "redispatching");
            dispatch_all(&self.dispatchers, dispatchable);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "redispatched unconfirmed dispatchables");
        }
        Ok(expired.len())
    }
}
