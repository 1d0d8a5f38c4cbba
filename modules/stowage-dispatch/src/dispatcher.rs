use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use stowage_common::Dispatchable;
use tracing::warn;

use crate::control::DispatcherControl;

/// Push target for dispatchables.
///
/// Delivery may be synchronous or asynchronous, but a successful delivery
/// must eventually call [`DispatcherControl::confirm_dispatched`]. The same
/// dispatchable can arrive more than once; implementations must tolerate it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Receives the control once at startup so deliveries can be confirmed.
    ///
    /// Each store starts its own control, and a control only confirms its
    /// own store's records. A dispatcher instance therefore belongs to one
    /// store: give every store its own instance rather than sharing one.
    fn control_with(&self, control: DispatcherControl);

    /// Attempt delivery. An error is logged and the dispatchable stays
    /// pending until the next redispatch.
    async fn dispatch(&self, dispatchable: Dispatchable) -> anyhow::Result<()>;
}

/// Hand `dispatchable` to every dispatcher without waiting for delivery.
///
/// Each attempt runs as its own task so a dispatcher that confirms through
/// the control can never block the caller.
pub fn dispatch_all(dispatchers: &[Arc<dyn Dispatcher>], dispatchable: &Dispatchable) {
    for dispatcher in dispatchers {
        let dispatcher = Arc::clone(dispatcher);
        let dispatchable = dispatchable.clone();
        tokio::spawn(async move {
            let dispatch_id = dispatchable.id.clone();
            if let Err(e) = dispatcher.dispatch(dispatchable).await {
                warn!(dispatch_id = %dispatch_id, error = %e, "dispatch attempt failed");
            }
        });
    }
}

/// Dispatcher for stores without a downstream consumer. Confirms every
/// dispatchable immediately.
#[derive(Debug, Default)]
pub struct NoopDispatcher {
    control: OnceLock<DispatcherControl>,
}

impl NoopDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dispatcher for NoopDispatcher {
    fn control_with(&self, control: DispatcherControl) {
        if self.control.set(control).is_err() {
            warn!("noop dispatcher is already bound to another store's control, ignoring the new one");
        }
    }

    async fn dispatch(&self, dispatchable: Dispatchable) -> anyhow::Result<()> {
        let Some(control) = self.control.get() else {
            anyhow::bail!("no dispatcher control to confirm {}", dispatchable.id);
        };
        control.confirm_dispatched(&dispatchable.id).await?;
        Ok(())
    }
}
