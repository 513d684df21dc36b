use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One progress report of a process. `percentage` is a fraction in `0..=1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Progress {
    pub percentage: f64,
    pub msg: Option<String>,
}

impl Progress {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 1.0),
            msg: None,
        }
    }

    pub fn with_msg(percentage: f64, msg: &str) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 1.0),
            msg: Some(msg.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ProcessManagerStatus {
    Created,
    Running,
    /// Every process settled, fulfilled or not. Failures are listed in the
    /// manager's error map.
    Finished,
}

impl ProcessManagerStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Last message reported by one process.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ProcessMessage {
    pub process_id: String,
    pub name: Option<String>,
    pub msg: String,
}

/// Aggregated progress of one process manager, as handed to
/// `notify_progress_change` callbacks.
///
/// A process contributes its last reported fraction while running and 1.0
/// once settled, whether it fulfilled or failed. `messages` holds the last
/// non-empty message of each process, even when later reports carried none.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ProgressReport {
    pub process_manager_id: String,
    pub controller_session_id: String,
    /// Mean of the per-process fractions, scaled to `0..=100`.
    pub percentage: f64,
    pub messages: Vec<ProcessMessage>,
    pub status: ProcessManagerStatus,
}

/// Final state of a settled process manager.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ProcessManagerSummary {
    pub id: String,
    pub controller_session_id: String,
    pub status: ProcessManagerStatus,
    pub process_count: usize,
    /// Error message per failed process id.
    pub errors: BTreeMap<String, String>,
}
