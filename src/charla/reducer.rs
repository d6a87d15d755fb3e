//! State reducer: folds the extraction patch and the tool observations
//! into the [`Patch`] the outer workflow engine applies to its store.
//!
//! Pure function, no I/O. The rules, in order: extraction slots first,
//! then the `produces` fields of successful observations (later wins on
//! collision), never unset anything on failure (stale beats empty), and
//! collect cache invalidation keys from successful writes.

use serde::{Deserialize, Serialize};

use crate::charla::manifest::ToolSpec;
use crate::charla::snapshot::{Observation, ObservationStatus, SlotMap, SlotValue};

/// The set of slot and cache mutations requested from the outer layer.
///
/// `slots_set` and `slots_unset` are disjoint by construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "slots")]
    pub slots_set: SlotMap,
    #[serde(rename = "slots_to_remove")]
    pub slots_unset: Vec<String>,
    pub cache_invalidation_keys: Vec<String>,
}

impl Patch {
    /// A patch that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set a slot, keeping the disjointness invariant: a key that is set
    /// cannot stay in the unset list.
    pub fn set(&mut self, key: impl Into<String>, value: SlotValue) {
        let key = key.into();
        self.slots_unset.retain(|k| k != &key);
        self.slots_set.insert(key, value);
    }
}

/// Compute the patch for one turn.
///
/// `extraction_slots` is what the extractor pulled out of the user's
/// message; `observations` are the broker's results in input order;
/// `tools` is the active vertical's manifest slice.
pub fn reduce(
    extraction_slots: &SlotMap,
    observations: &[Observation],
    tools: &[ToolSpec],
) -> Patch {
    let mut patch = Patch::empty();

    for (key, value) in extraction_slots {
        if key.starts_with('_') {
            continue;
        }
        patch.set(key.clone(), value.clone());
    }

    for observation in observations {
        let spec = match tools.iter().find(|t| t.name == observation.tool) {
            Some(spec) => spec,
            None => continue,
        };

        if observation.status != ObservationStatus::Ok {
            // Failed observations never unset existing values.
            continue;
        }

        if let Some(data) = &observation.data {
            for produced in &spec.produces {
                if produced.starts_with('_') {
                    continue;
                }
                if let Some(raw) = data.get(produced) {
                    if let Some(value) = SlotValue::from_json(raw) {
                        patch.set(produced.clone(), value);
                    }
                }
            }
        }

        if spec.is_write() {
            for key in &spec.invalidates {
                if !patch.cache_invalidation_keys.contains(key) {
                    patch.cache_invalidation_keys.push(key.clone());
                }
            }
        }
    }

    patch
}
