//! The session collaborator: remote computation for one loaded model.
//!
//! The core never talks to a backend itself. Everything it needs from a
//! session goes through the [`Session`] trait; [`MemorySession`] is a headless
//! implementation used for tests and for driving the core without a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use ts_rs::TS;

use crate::error::SessionError;
use crate::model::{ExportDefinition, NamespaceValues, OutputDefinition, ParameterDefinition};
use crate::process::ProcessDefinition;

/// Commit discipline of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum CommitMode {
    /// Every valid edit is executed right away.
    Immediate,
    /// Edits collect as parameter changes until accepted or rejected.
    AcceptReject,
}

/// What a customization produced besides the new model state.
#[derive(Default)]
pub struct CustomizeResult {
    /// Scene-graph mutations still running in the viewer (instancing and the
    /// like). Each one is tracked by a process manager.
    pub scene_updates: Vec<ProcessDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct ExportResult {
    pub export_id: String,
    pub href: Option<String>,
    pub msg: Option<String>,
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> String;

    /// Session whose viewports display this model. Defaults to the session id.
    fn controller_session_id(&self) -> String {
        self.id()
    }

    fn parameters(&self) -> Vec<ParameterDefinition>;

    fn exports(&self) -> Vec<ExportDefinition> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputDefinition> {
        Vec::new()
    }

    fn commit_mode(&self) -> CommitMode {
        CommitMode::Immediate
    }

    /// Run the model with `values` (parameter id to value). One call carries a
    /// whole batch.
    async fn customize(&self, values: NamespaceValues) -> Result<CustomizeResult, SessionError>;

    async fn request_export(
        &self,
        export_id: &str,
        values: NamespaceValues,
    ) -> Result<ExportResult, SessionError>;

    /// Persist `values` remotely and return the id of the stored model state.
    async fn create_model_state(&self, values: NamespaceValues) -> Result<String, SessionError>;

    /// Fetch the parameter values of a stored model state.
    async fn load_model_state(&self, model_state_id: &str)
        -> Result<NamespaceValues, SessionError>;
}

// ── MemorySession ───────────────────────────────────────────────

#[derive(Default)]
struct MemorySessionState {
    remote_values: NamespaceValues,
    customize_calls: Vec<NamespaceValues>,
    fail_next: Option<String>,
    pending_scene_updates: Vec<ProcessDefinition>,
    model_states: HashMap<String, NamespaceValues>,
}

/// Headless session. Customizations succeed immediately unless paused or
/// told to fail.
pub struct MemorySession {
    id: String,
    controller_session_id: String,
    parameters: Vec<ParameterDefinition>,
    exports: Vec<ExportDefinition>,
    outputs: Vec<OutputDefinition>,
    commit_mode: CommitMode,
    state: Mutex<MemorySessionState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    next_model_state: AtomicU64,
}

impl MemorySession {
    pub fn new(id: &str, parameters: Vec<ParameterDefinition>) -> Self {
        let remote_values = parameters
            .iter()
            .map(|p| (p.id.clone(), p.default.clone()))
            .collect();
        Self {
            id: id.to_string(),
            controller_session_id: id.to_string(),
            parameters,
            exports: Vec::new(),
            outputs: Vec::new(),
            commit_mode: CommitMode::Immediate,
            state: Mutex::new(MemorySessionState {
                remote_values,
                ..MemorySessionState::default()
            }),
            gate: Mutex::new(None),
            next_model_state: AtomicU64::new(1),
        }
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_controller_session(mut self, controller_session_id: &str) -> Self {
        self.controller_session_id = controller_session_id.to_string();
        self
    }

    pub fn with_exports(mut self, exports: Vec<ExportDefinition>) -> Self {
        self.exports = exports;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Hold every following customization until [`MemorySession::release`]
    /// hands out a permit.
    pub fn pause(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held customizations complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Stop holding customizations.
    pub fn resume(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Make the next customization fail with `message`.
    pub fn fail_next(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Return `update` from the next successful customization.
    pub fn queue_scene_update(&self, update: ProcessDefinition) {
        self.state.lock().pending_scene_updates.push(update);
    }

    pub fn customize_calls(&self) -> Vec<NamespaceValues> {
        self.state.lock().customize_calls.clone()
    }

    /// Values the "remote" model currently runs with.
    pub fn remote_values(&self) -> NamespaceValues {
        self.state.lock().remote_values.clone()
    }

    pub fn insert_model_state(&self, id: &str, values: NamespaceValues) {
        self.state.lock().model_states.insert(id.to_string(), values);
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn controller_session_id(&self) -> String {
        self.controller_session_id.clone()
    }

    fn parameters(&self) -> Vec<ParameterDefinition> {
        self.parameters.clone()
    }

    fn exports(&self) -> Vec<ExportDefinition> {
        self.exports.clone()
    }

    fn outputs(&self) -> Vec<OutputDefinition> {
        self.outputs.clone()
    }

    fn commit_mode(&self) -> CommitMode {
        self.commit_mode
    }

    async fn customize(&self, values: NamespaceValues) -> Result<CustomizeResult, SessionError> {
        self.state.lock().customize_calls.push(values.clone());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| SessionError::new(e.to_string()))?;
            permit.forget();
        }

        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(SessionError::new(message));
        }
        state.remote_values.extend(values);
        Ok(CustomizeResult {
            scene_updates: std::mem::take(&mut state.pending_scene_updates),
        })
    }

    async fn request_export(
        &self,
        export_id: &str,
        values: NamespaceValues,
    ) -> Result<ExportResult, SessionError> {
        if !self.exports.iter().any(|e| e.id == export_id) {
            return Err(SessionError::new(format!("Unknown export {export_id}")));
        }
        Ok(ExportResult {
            export_id: export_id.to_string(),
            href: Some(format!("memory://{}/{export_id}?values={}", self.id, values.len())),
            msg: None,
        })
    }

    async fn create_model_state(&self, values: NamespaceValues) -> Result<String, SessionError> {
        let n = self.next_model_state.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-state-{n}", self.id);
        self.state.lock().model_states.insert(id.clone(), values);
        Ok(id)
    }

    async fn load_model_state(
        &self,
        model_state_id: &str,
    ) -> Result<NamespaceValues, SessionError> {
        self.state
            .lock()
            .model_states
            .get(model_state_id)
            .cloned()
            .ok_or_else(|| SessionError::new(format!("Unknown model state {model_state_id}")))
    }
}
