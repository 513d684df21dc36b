pub mod history;
pub mod parameter;
pub mod process;

// Re-export commonly used types at the model level.
pub use history::{HistoryEntry, NamespaceValues, UndoState};
pub use parameter::{
    ExportDefinition, OutputDefinition, ParamType, ParamValue, Parameter, ParameterDefinition,
    ParameterKey, ParameterState,
};
pub use process::{
    ProcessManagerStatus, ProcessManagerSummary, ProcessMessage, Progress, ProgressReport,
};
