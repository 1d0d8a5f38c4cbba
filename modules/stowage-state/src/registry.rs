use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maps state type names to the store (table) that holds them.
///
/// Built once at startup. Several types may share one store.
///
/// ```toml
/// account = "accounts"
/// customer = "customers"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTypeRegistry {
    stores: HashMap<String, String>,
}

impl StateTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, type_name: impl Into<String>, store_name: impl Into<String>) -> Self {
        self.stores.insert(type_name.into(), store_name.into());
        self
    }

    pub fn store_for(&self, type_name: &str) -> Option<&str> {
        self.stores.get(type_name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }
}
