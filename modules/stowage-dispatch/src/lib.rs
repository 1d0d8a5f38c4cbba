//! Reliable dispatch: outbox records, push dispatchers and the
//! confirm/redispatch control loop.
//!
//! A store writes its data and a [`Dispatchable`](stowage_common::Dispatchable)
//! in one unit, then hands the dispatchable to every [`Dispatcher`]. A
//! dispatcher confirms delivery through [`DispatcherControl`], which deletes
//! the record. Records left unconfirmed past the expiration window are
//! delivered again on the control's timer, giving at-least-once delivery.

pub mod control;
pub mod deps;
pub mod dispatcher;

pub use control::DispatcherControl;
pub use deps::StoreDeps;
pub use dispatcher::{dispatch_all, Dispatcher, NoopDispatcher};
