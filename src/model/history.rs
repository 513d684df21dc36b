use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::ParamValue;

/// Executed parameter values of one namespace, keyed by parameter id.
pub type NamespaceValues = BTreeMap<String, ParamValue>;

/// Immutable snapshot of committed state across namespaces. Stored as opaque
/// state in the host navigation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryEntry {
    /// Monotonic sequence number within one history manager.
    pub sequence: u64,
    pub per_namespace: BTreeMap<String, NamespaceValues>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl HistoryEntry {
    pub fn new(sequence: u64, per_namespace: BTreeMap<String, NamespaceValues>) -> Self {
        Self {
            sequence,
            per_namespace,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// True if both entries hold the same values, ignoring sequence and time.
    pub fn same_values(&self, other: &HistoryEntry) -> bool {
        self.per_namespace == other.per_namespace
    }
}

/// Undo/redo state for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UndoState {
    pub can_undo: bool,
    pub can_redo: bool,
    pub entry_count: usize,
    pub current_index: usize,
}
