//! Outcome taxonomy and the error every store operation reports through.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result code attached to every read, write and confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// Read miss.
    NotFound,
    /// Some reads of a batch missed.
    NotAllFound,
    /// The state type is not registered with any store.
    NoTypeStore,
    /// Optimistic version check lost.
    ConcurrencyViolation,
    /// Caller misuse: empty id, type or batch.
    Error,
    /// Unexpected backend failure.
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    fn severity(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::NotFound => 1,
            Outcome::NotAllFound => 2,
            Outcome::NoTypeStore => 3,
            Outcome::ConcurrencyViolation => 4,
            Outcome::Error => 5,
            Outcome::Failure => 6,
        }
    }

    /// The more severe of two outcomes, for folding batch results.
    pub fn worst(self, other: Outcome) -> Outcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::NotFound => "not found",
            Outcome::NotAllFound => "not all found",
            Outcome::NoTypeStore => "no type store",
            Outcome::ConcurrencyViolation => "concurrency violation",
            Outcome::Error => "error",
            Outcome::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Failure of a store operation, tagged with its [`Outcome`].
///
/// Backend errors are wrapped here at the store boundary and never escape
/// raw.
#[derive(Debug, Error)]
#[error("{outcome}: {message}")]
pub struct StorageError {
    outcome: Outcome,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        outcome: Outcome,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            outcome,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Outcome::NotFound, message)
    }

    pub fn no_type_store(message: impl Into<String>) -> Self {
        Self::new(Outcome::NoTypeStore, message)
    }

    pub fn concurrency_violation(message: impl Into<String>) -> Self {
        Self::new(Outcome::ConcurrencyViolation, message)
    }

    /// Caller misuse, reported as [`Outcome::Error`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Outcome::Error, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(Outcome::Failure, message)
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
