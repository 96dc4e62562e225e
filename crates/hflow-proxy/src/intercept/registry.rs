//! Thread-safe store of installed intercepts.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::Intercept;

/// Stable identity of an installed intercept. Ids start at 1 and are never reused.
pub type InterceptId = u64;

/// Independent copy of the registry taken at one point in time.
pub type Snapshot = BTreeMap<InterceptId, Intercept>;

/// Id and label of an installed intercept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterceptSummary {
    /// Registry id.
    pub id: InterceptId,
    /// Intercept label.
    pub label: String,
}

#[derive(Default)]
struct RegistryState {
    last_id: InterceptId,
    intercepts: BTreeMap<InterceptId, Intercept>,
}

/// The set of intercepts applied to live traffic.
///
/// Construct one at startup and share it (`Arc`) between the listeners and
/// whatever installs and removes intercepts.
#[derive(Default)]
pub struct InterceptRegistry {
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for InterceptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRegistry")
            .field("intercepts", &self.list())
            .finish()
    }
}

impl InterceptRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `intercept` and returns its id.
    pub fn add(&self, intercept: Intercept) -> InterceptId {
        let label = intercept.label().to_string();

        let id = {
            let mut state = self.state.write();
            state.last_id += 1;
            let id = state.last_id;
            state.intercepts.insert(id, intercept);
            id
        };

        tracing::debug!("added intercept [{}] labelled [{}]", id, label);
        id
    }

    /// Removes the intercept with `id`. Removing an unknown id is a no-op.
    ///
    /// Returns whether an intercept was removed.
    pub fn remove(&self, id: InterceptId) -> bool {
        let removed = self.state.write().intercepts.remove(&id);

        match &removed {
            Some(intercept) => {
                tracing::debug!("removed intercept [{}] labelled [{}]", id, intercept.label())
            }
            None => tracing::trace!("no intercept [{}] to remove", id),
        }

        removed.is_some()
    }

    /// Returns a copy of the installed intercepts. Later changes to the
    /// registry are not visible through the copy.
    pub fn snapshot(&self) -> Snapshot {
        self.state.read().intercepts.clone()
    }

    /// Lists installed intercepts in id order.
    pub fn list(&self) -> Vec<InterceptSummary> {
        self.state
            .read()
            .intercepts
            .iter()
            .map(|(id, intercept)| InterceptSummary {
                id: *id,
                label: intercept.label().to_string(),
            })
            .collect()
    }

    /// Number of installed intercepts.
    pub fn len(&self) -> usize {
        self.state.read().intercepts.len()
    }

    /// Returns true if no intercepts are installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
