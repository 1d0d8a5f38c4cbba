//! Core data model. Domain-agnostic: payloads are opaque to the stores.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EntryId
// ---------------------------------------------------------------------------

/// Position of an entry in its log. Assigned by the log at append time;
/// unique and totally ordered within one log. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    /// The first id a log hands out.
    pub const FIRST: EntryId = EntryId(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for EntryId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(EntryId)
    }
}

// ---------------------------------------------------------------------------
// Payload / Metadata
// ---------------------------------------------------------------------------

/// Body of an entry or state, tagged with its format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
    Object(serde_json::Value),
    #[default]
    Null,
}

impl Payload {
    /// The format tag stored alongside the payload.
    pub fn format(&self) -> &'static str {
        match self {
            Payload::Binary(_) => "binary",
            Payload::Text(_) => "text",
            Payload::Object(_) => "object",
            Payload::Null => "null",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Object(value)
    }
}

/// Free-form metadata carried with entries and states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub value: String,
    pub operation: String,
}

impl Metadata {
    pub fn new(value: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            operation: operation.into(),
        }
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        Self::new(value, "")
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.operation.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// An entry to be appended. The caller builds this; the log assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub type_name: String,
    pub type_version: u32,
    pub payload: Payload,
    pub metadata: Metadata,
}

impl EntryDraft {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            type_name: type_name.into(),
            type_version: 1,
            payload: payload.into(),
            metadata: Metadata::default(),
        }
    }

    pub fn with_type_version(mut self, type_version: u32) -> Self {
        self.type_version = type_version;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Seal the draft under the id assigned by the log.
    pub fn into_entry(self, id: EntryId) -> Entry {
        Entry {
            id,
            type_name: self.type_name,
            type_version: self.type_version,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// A recorded entry. Never mutated once the log hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub type_name: String,
    pub type_version: u32,
    pub payload: Payload,
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A materialized, versioned value: a state store record or a journal
/// snapshot. For snapshots `data_version` is the last stream version folded
/// into the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub type_name: String,
    pub type_version: u32,
    pub data: Payload,
    pub data_version: u32,
    pub metadata: Metadata,
}

impl State {
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        data_version: u32,
        data: impl Into<Payload>,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            type_version: 1,
            data: data.into(),
            data_version,
            metadata: Metadata::default(),
        }
    }

    pub fn with_type_version(mut self, type_version: u32) -> Self {
        self.type_version = type_version;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatchable
// ---------------------------------------------------------------------------

/// Durable record that consumers must be told about a write.
///
/// The id is derived from what was written, so a redelivered dispatchable is
/// recognizable as the same notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatchable {
    pub id: String,
    pub created_on: DateTime<Utc>,
    pub state: Option<State>,
    pub entries: Vec<Entry>,
}

impl Dispatchable {
    pub fn new(id: impl Into<String>, state: Option<State>, entries: Vec<Entry>) -> Self {
        Self {
            id: id.into(),
            created_on: Utc::now(),
            state,
            entries,
        }
    }

    /// Restore the original creation time, e.g. when loading from a table.
    pub fn with_created_on(mut self, created_on: DateTime<Utc>) -> Self {
        self.created_on = created_on;
        self
    }

    /// `journal:stream:version:id1:id2...` for journal writes.
    pub fn journal_id(journal_name: &str, stream_name: &str, stream_version: u32, entries: &[Entry]) -> String {
        let mut id = format!("{journal_name}:{stream_name}:{stream_version}");
        for entry in entries {
            id.push(':');
            id.push_str(&entry.id.to_string());
        }
        id
    }

    /// `owner:store:id:version` for state store writes. Every version gets
    /// its own record, so a newer write never replaces an undelivered one.
    pub fn state_store_id(owner: &str, store_name: &str, id: &str, data_version: u32) -> String {
        format!("{owner}:{store_name}:{id}:{data_version}")
    }

    /// Whether this record was written by the store named `owner`. Ids start
    /// with the owning store's name followed by `:`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        Self::id_owned_by(&self.id, owner)
    }

    pub fn id_owned_by(dispatch_id: &str, owner: &str) -> bool {
        dispatch_id
            .strip_prefix(owner)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Time elapsed since creation; zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created_on).to_std().unwrap_or_default()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }
}
