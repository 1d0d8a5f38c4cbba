//! State store: versioned key-value states with optimistic concurrency,
//! source entries on the shared log and at-least-once dispatch of writes.

mod actor;
pub mod bundle;
pub mod registry;
pub mod store;

pub use bundle::{ReadAllResult, StateBundle, TypedStateBundle, Written};
pub use registry::StateTypeRegistry;
pub use store::StateStore;
