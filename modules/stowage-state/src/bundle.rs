use serde::{Deserialize, Serialize};
use stowage_common::{Entry, Outcome, State};

/// One `(id, type)` pair of a batch read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedStateBundle {
    pub id: String,
    pub type_name: String,
}

impl TypedStateBundle {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
        }
    }
}

/// Result of one read within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBundle {
    pub id: String,
    pub type_name: String,
    pub state: Option<State>,
    pub outcome: Outcome,
}

/// Every read of a batch plus the combined outcome.
///
/// `outcome` is `Success` only when every read succeeded. Misses make it
/// `NotAllFound`; any worse outcome of a single read wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadAllResult {
    pub outcome: Outcome,
    pub bundles: Vec<StateBundle>,
}

impl ReadAllResult {
    pub fn from_bundles(bundles: Vec<StateBundle>) -> Self {
        let outcome = bundles
            .iter()
            .map(|bundle| match bundle.outcome {
                Outcome::NotFound => Outcome::NotAllFound,
                other => other,
            })
            .fold(Outcome::Success, Outcome::worst);
        Self { outcome, bundles }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The states that were found, in request order.
    pub fn found(&self) -> impl Iterator<Item = &State> {
        self.bundles.iter().filter_map(|bundle| bundle.state.as_ref())
    }
}

/// What a successful write stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    pub state: State,
    /// The source entries appended to the shared log with this write.
    pub entries: Vec<Entry>,
}
