//! Parameter state machine and the namespace registry that owns it.
//!
//! Every loaded session is a namespace. Its parameters move through
//! `clean -> dirty -> executing -> clean`; only a batch execution or a history
//! restore advances the executed value. All mutation goes through
//! [`ParameterHandle`] actions or the batch/restore paths in this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use ts_rs::TS;

use crate::error::StateError;
use crate::model::{
    ExportDefinition, NamespaceValues, OutputDefinition, ParamValue, Parameter,
    ParameterDefinition, ParameterKey, ParameterState,
};
use crate::process::ProcessRegistry;
use crate::session::{CommitMode, ExportResult, Session};
use crate::store::{Store, Subscription};

/// Registration options for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Lower commits first when several namespaces are accepted together.
    pub priority: i32,
    /// Overrides both the configured default and the session's own default.
    pub commit_mode: Option<CommitMode>,
}

#[derive(Clone)]
pub struct NamespaceState {
    pub session: Arc<dyn Session>,
    pub commit_mode: CommitMode,
    pub priority: i32,
    pub parameters: IndexMap<String, Parameter>,
    pub exports: IndexMap<String, ExportDefinition>,
    pub outputs: IndexMap<String, OutputDefinition>,
    /// A batch execution is in flight.
    pub executing: bool,
    /// Number of history restores in flight for this namespace.
    pub restoring: u32,
    /// Bumped by restores and re-registration. Batch results computed
    /// against an older generation are discarded.
    pub generation: u64,
    /// Bumped whenever executed values change.
    pub revision: u64,
}

impl NamespaceState {
    pub fn is_busy(&self) -> bool {
        self.executing || self.restoring > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.parameters.values().any(|p| p.state.dirty)
    }

    pub fn executed_values(&self) -> NamespaceValues {
        self.parameters
            .iter()
            .map(|(id, p)| (id.clone(), p.state.exec_value.clone()))
            .collect()
    }

    pub fn dirty_values(&self) -> NamespaceValues {
        self.parameters
            .iter()
            .filter(|(_, p)| p.state.dirty)
            .map(|(id, p)| (id.clone(), p.state.ui_value.clone()))
            .collect()
    }

    fn find_parameter(&self, key: &ParameterKey) -> Option<&Parameter> {
        key.candidates().iter().find_map(|k| {
            self.parameters.values().find(|p| {
                let d = &p.definition;
                k.matches(&d.id, &d.name, d.display_name.as_deref())
            })
        })
    }
}

#[derive(Clone, Default)]
pub struct ParameterStoreState {
    pub namespaces: IndexMap<String, NamespaceState>,
    /// History restores in flight. Editing is disabled while non-zero.
    pub restoring: u32,
    /// Count of successful batch executions, across namespaces.
    pub committed: u64,
}

impl ParameterStoreState {
    pub fn editing_enabled(&self) -> bool {
        self.restoring == 0
    }
}

/// Application-scoped owner of every namespace's parameters.
#[derive(Clone)]
pub struct ParameterRegistry {
    store: Store<ParameterStoreState>,
    default_commit_mode: Option<CommitMode>,
    processes: Option<ProcessRegistry>,
}

impl ParameterRegistry {
    pub fn new(default_commit_mode: Option<CommitMode>, processes: Option<ProcessRegistry>) -> Self {
        Self {
            store: Store::new(ParameterStoreState::default()),
            default_commit_mode,
            processes,
        }
    }

    pub fn store(&self) -> &Store<ParameterStoreState> {
        &self.store
    }

    pub fn subscribe<T, Sel, Cb>(&self, selector: Sel, callback: Cb) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        Sel: Fn(&ParameterStoreState) -> T + Send + Sync + 'static,
        Cb: Fn(&T) + Send + Sync + 'static,
    {
        self.store.subscribe(selector, callback)
    }

    /// Register a session as a namespace, creating its parameters at their
    /// default values. Re-registering a namespace replaces it.
    pub fn register_session(&self, session: Arc<dyn Session>, options: SessionOptions) -> String {
        let namespace = session.id();
        let commit_mode = options
            .commit_mode
            .or(self.default_commit_mode)
            .unwrap_or_else(|| session.commit_mode());
        let parameters = session
            .parameters()
            .into_iter()
            .map(|d| (d.id.clone(), Parameter::from_definition(d)))
            .collect();
        let exports = session
            .exports()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        let outputs = session
            .outputs()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        self.store.update(|s| {
            let generation = s.namespaces.get(&namespace).map_or(0, |n| n.generation + 1);
            s.namespaces.insert(
                namespace.clone(),
                NamespaceState {
                    session,
                    commit_mode,
                    priority: options.priority,
                    parameters,
                    exports,
                    outputs,
                    executing: false,
                    restoring: 0,
                    generation,
                    revision: 0,
                },
            );
        });
        tracing::info!(namespace = %namespace, mode = ?commit_mode, "Session registered");
        namespace
    }

    pub fn close_session(&self, namespace: &str) -> bool {
        let closed = self
            .store
            .update(|s| s.namespaces.shift_remove(namespace))
            .is_some();
        if closed {
            tracing::info!(namespace = %namespace, "Session closed");
        }
        closed
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.store.read(|s| s.namespaces.keys().cloned().collect())
    }

    pub fn commit_mode(&self, namespace: &str) -> Option<CommitMode> {
        self.store
            .read(|s| s.namespaces.get(namespace).map(|n| n.commit_mode))
    }

    pub fn editing_enabled(&self) -> bool {
        self.store.read(ParameterStoreState::editing_enabled)
    }

    pub fn session(&self, namespace: &str) -> Option<Arc<dyn Session>> {
        self.store
            .read(|s| s.namespaces.get(namespace).map(|n| Arc::clone(&n.session)))
    }

    pub fn executed_values(&self, namespace: &str) -> Option<NamespaceValues> {
        self.store
            .read(|s| s.namespaces.get(namespace).map(NamespaceState::executed_values))
    }

    /// Executed values of every namespace.
    pub fn snapshot(&self) -> BTreeMap<String, NamespaceValues> {
        self.store.read(|s| {
            s.namespaces
                .iter()
                .map(|(ns, n)| (ns.clone(), n.executed_values()))
                .collect()
        })
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn parameter(&self, namespace: &str, key: impl Into<ParameterKey>) -> Option<ParameterHandle> {
        let key = key.into();
        let id = self.store.read(|s| {
            s.namespaces
                .get(namespace)
                .and_then(|n| n.find_parameter(&key))
                .map(|p| p.definition.id.clone())
        })?;
        Some(ParameterHandle {
            registry: self.clone(),
            namespace: namespace.to_string(),
            id,
        })
    }

    /// Handles for every parameter of a namespace, in definition order.
    pub fn parameters(&self, namespace: &str) -> Vec<ParameterHandle> {
        self.store
            .read(|s| {
                s.namespaces
                    .get(namespace)
                    .map(|n| n.parameters.keys().cloned().collect::<Vec<_>>())
            })
            .unwrap_or_default()
            .into_iter()
            .map(|id| ParameterHandle {
                registry: self.clone(),
                namespace: namespace.to_string(),
                id,
            })
            .collect()
    }

    pub fn export(&self, namespace: &str, key: impl Into<ParameterKey>) -> Option<ExportHandle> {
        let key = key.into();
        let id = self.store.read(|s| {
            let n = s.namespaces.get(namespace)?;
            key.candidates().iter().find_map(|k| {
                n.exports
                    .values()
                    .find(|e| k.matches(&e.id, &e.name, e.display_name.as_deref()))
                    .map(|e| e.id.clone())
            })
        })?;
        Some(ExportHandle {
            registry: self.clone(),
            namespace: namespace.to_string(),
            id,
        })
    }

    pub fn output(&self, namespace: &str, key: impl Into<ParameterKey>) -> Option<OutputHandle> {
        let key = key.into();
        let id = self.store.read(|s| {
            let n = s.namespaces.get(namespace)?;
            key.candidates().iter().find_map(|k| {
                n.outputs
                    .values()
                    .find(|o| k.matches(&o.id, &o.name, o.display_name.as_deref()))
                    .map(|o| o.id.clone())
            })
        })?;
        Some(OutputHandle {
            registry: self.clone(),
            namespace: namespace.to_string(),
            id,
        })
    }

    // ── Batch execution ─────────────────────────────────────────

    /// Execute the dirty parameters of a namespace as one batch. With `only`,
    /// restrict the batch to those parameter ids. Resolves once the session
    /// answered; the namespace's `executing` flag is reset on every path.
    pub(crate) async fn execute_batch(
        &self,
        namespace: &str,
        only: Option<&[String]>,
    ) -> Result<(), StateError> {
        let started = self.store.update(|s| {
            if !s.editing_enabled() {
                return Err(StateError::CommitInProgress {
                    namespace: namespace.to_string(),
                });
            }
            let n = s
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| StateError::not_found(format!("Namespace {namespace}")))?;
            if n.is_busy() {
                return Err(StateError::CommitInProgress {
                    namespace: namespace.to_string(),
                });
            }
            let mut values = n.dirty_values();
            if let Some(only) = only {
                values.retain(|id, _| only.contains(id));
            }
            if values.is_empty() {
                return Ok(None);
            }
            n.executing = true;
            for id in values.keys() {
                if let Some(p) = n.parameters.get_mut(id) {
                    p.state.executing = true;
                }
            }
            Ok(Some((Arc::clone(&n.session), values, n.generation)))
        })?;
        let Some((session, values, generation)) = started else {
            return Ok(());
        };

        tracing::debug!(namespace = %namespace, parameters = values.len(), "Executing batch");
        let result = self.customize(namespace, session.as_ref(), values.clone()).await;

        self.store.update(|s| {
            let n = s
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| StateError::not_found(format!("Namespace {namespace}")))?;
            n.executing = false;
            for id in values.keys() {
                if let Some(p) = n.parameters.get_mut(id) {
                    p.state.executing = false;
                }
            }
            result?;
            if n.generation != generation {
                return Err(StateError::Superseded {
                    namespace: namespace.to_string(),
                });
            }
            for (id, value) in values {
                if let Some(p) = n.parameters.get_mut(&id) {
                    p.state.mark_executed(value);
                }
            }
            n.revision += 1;
            s.committed += 1;
            Ok(())
        })
        .inspect(|_| tracing::info!(namespace = %namespace, "Batch executed"))
        .inspect_err(|e| tracing::warn!(namespace = %namespace, error = %e, "Batch execution failed"))
    }

    /// Send values to a session and hand any resulting scene updates to the
    /// process registry.
    pub(crate) async fn customize(
        &self,
        namespace: &str,
        session: &dyn Session,
        values: NamespaceValues,
    ) -> Result<(), StateError> {
        let result = session
            .customize(values)
            .await
            .map_err(|e| StateError::session(namespace, &e))?;
        if let Some(processes) = &self.processes {
            if let Err(e) = processes.track(&session.controller_session_id(), result.scene_updates) {
                tracing::warn!(namespace = %namespace, error = %e, "Could not track scene updates");
            }
        }
        Ok(())
    }

    /// Discard every dirty value of a namespace. Synchronous, no session call.
    pub(crate) fn reset_ui_values(&self, namespace: &str) -> Result<usize, StateError> {
        self.store.update(|s| {
            let n = s
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| StateError::not_found(format!("Namespace {namespace}")))?;
            let mut reset = 0;
            for p in n.parameters.values_mut().filter(|p| p.state.dirty) {
                let exec = p.state.exec_value.clone();
                p.state.set_ui(exec);
                reset += 1;
            }
            Ok(reset)
        })
    }

    // ── Restore ─────────────────────────────────────────────────

    /// Claim the namespaces of a history entry for restoring. Fails without
    /// side effects if any of them is executing a batch. Namespaces that are
    /// no longer registered are left out of the ticket.
    pub(crate) fn begin_restore(
        &self,
        namespaces: &[String],
    ) -> Result<RestoreTicket, StateError> {
        self.store.update(|s| {
            if let Some(busy) = namespaces
                .iter()
                .find(|ns| s.namespaces.get(*ns).is_some_and(|n| n.executing))
            {
                return Err(StateError::CommitInProgress {
                    namespace: busy.clone(),
                });
            }
            let mut ticket = RestoreTicket::default();
            for ns in namespaces {
                if let Some(n) = s.namespaces.get_mut(ns) {
                    n.generation += 1;
                    n.restoring += 1;
                    ticket.generations.insert(ns.clone(), n.generation);
                    ticket.previous.insert(ns.clone(), n.executed_values());
                    ticket.sessions.insert(ns.clone(), Arc::clone(&n.session));
                }
            }
            s.restoring += 1;
            Ok(ticket)
        })
    }

    /// Whether no newer restore claimed a namespace of `ticket`.
    pub(crate) fn ticket_is_current(&self, ticket: &RestoreTicket) -> bool {
        self.store.read(|s| {
            ticket.generations.iter().all(|(ns, generation)| {
                s.namespaces
                    .get(ns)
                    .is_some_and(|n| n.generation == *generation)
            })
        })
    }

    /// Release a restore ticket. With `values`, apply them as both UI and
    /// executed values in one update, provided the ticket is still current.
    pub(crate) fn end_restore(
        &self,
        ticket: &RestoreTicket,
        values: Option<&BTreeMap<String, NamespaceValues>>,
    ) -> Result<(), StateError> {
        self.store.update(|s| {
            s.restoring = s.restoring.saturating_sub(1);
            let mut stale = None;
            for (ns, generation) in &ticket.generations {
                if let Some(n) = s.namespaces.get_mut(ns) {
                    n.restoring = n.restoring.saturating_sub(1);
                    if n.generation != *generation {
                        stale.get_or_insert_with(|| ns.clone());
                    }
                } else {
                    stale.get_or_insert_with(|| ns.clone());
                }
            }
            let Some(values) = values else {
                return Ok(());
            };
            if let Some(namespace) = stale {
                return Err(StateError::Superseded { namespace });
            }
            for (ns, entry_values) in values {
                let Some(n) = s.namespaces.get_mut(ns) else {
                    continue;
                };
                for (id, value) in entry_values {
                    let Some(p) = n.parameters.get_mut(id) else {
                        continue;
                    };
                    match p.definition.param_type.validate(value) {
                        Ok(v) => p.state.set_ui_and_exec(v),
                        Err(e) => {
                            tracing::warn!(namespace = %ns, parameter = %id, error = %e, "Skipping invalid history value");
                        }
                    }
                }
                n.revision += 1;
            }
            Ok(())
        })
    }
}

/// Claim on a set of namespaces held by one history restore.
#[derive(Default)]
pub(crate) struct RestoreTicket {
    pub generations: BTreeMap<String, u64>,
    /// Executed values before the restore, for rolling back the session.
    pub previous: BTreeMap<String, NamespaceValues>,
    pub sessions: BTreeMap<String, Arc<dyn Session>>,
}

// ── Handles ─────────────────────────────────────────────────────

/// `{definition, state, actions}` accessor for one parameter.
#[derive(Clone)]
pub struct ParameterHandle {
    registry: ParameterRegistry,
    namespace: String,
    id: String,
}

impl ParameterHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn with_parameter<R>(&self, f: impl FnOnce(&Parameter) -> R) -> Option<R> {
        self.registry.store.read(|s| {
            s.namespaces
                .get(&self.namespace)
                .and_then(|n| n.parameters.get(&self.id))
                .map(f)
        })
    }

    pub fn definition(&self) -> Option<ParameterDefinition> {
        self.with_parameter(|p| p.definition.clone())
    }

    pub fn state(&self) -> Option<ParameterState> {
        self.with_parameter(|p| p.state.clone())
    }

    pub fn is_valid(&self, value: &ParamValue) -> bool {
        self.with_parameter(|p| p.is_valid(value)).unwrap_or(false)
    }

    pub fn is_ui_value_different(&self, value: &ParamValue) -> bool {
        self.with_parameter(|p| p.is_ui_value_different(value))
            .unwrap_or(true)
    }

    /// Set the UI value. Returns false, leaving the state untouched, if the
    /// value is invalid, the parameter is gone, or editing is disabled by a
    /// history restore.
    pub fn set_ui_value(&self, value: &ParamValue) -> bool {
        self.registry.store.update(|s| {
            if !s.editing_enabled() {
                tracing::warn!(namespace = %self.namespace, parameter = %self.id, "Edit rejected while restoring history");
                return false;
            }
            let Some(p) = s
                .namespaces
                .get_mut(&self.namespace)
                .and_then(|n| n.parameters.get_mut(&self.id))
            else {
                return false;
            };
            match p.definition.param_type.validate(value) {
                Ok(v) => {
                    p.state.set_ui(v);
                    true
                }
                Err(e) => {
                    tracing::warn!(namespace = %self.namespace, parameter = %self.id, error = %e, "Invalid parameter value");
                    false
                }
            }
        })
    }

    /// Set UI and executed value together, without a session call. For
    /// values the session already runs with.
    pub fn set_ui_and_exec_value(&self, value: &ParamValue) -> bool {
        self.registry.store.update(|s| {
            let Some(n) = s.namespaces.get_mut(&self.namespace) else {
                return false;
            };
            let Some(p) = n.parameters.get_mut(&self.id) else {
                return false;
            };
            match p.definition.param_type.validate(value) {
                Ok(v) => {
                    let changed = v != p.state.exec_value;
                    p.state.set_ui_and_exec(v);
                    if changed {
                        n.revision += 1;
                    }
                    true
                }
                Err(_) => false,
            }
        })
    }

    /// With `immediate`, execute this parameter right away. Otherwise leave it
    /// to the commit coordinator: a dirty parameter is part of its
    /// namespace's pending changes until accepted or rejected.
    pub async fn execute(&self, immediate: bool) -> Result<(), StateError> {
        if self.state().is_none() {
            return Err(StateError::not_found(format!(
                "Parameter {} in {}",
                self.id, self.namespace
            )));
        }
        if immediate {
            self.registry
                .execute_batch(&self.namespace, Some(std::slice::from_ref(&self.id)))
                .await
        } else {
            tracing::debug!(namespace = %self.namespace, parameter = %self.id, "Deferred to accept/reject");
            Ok(())
        }
    }

    /// Execute following the namespace's commit mode.
    pub async fn execute_default(&self) -> Result<(), StateError> {
        let immediate = self.registry.commit_mode(&self.namespace) == Some(CommitMode::Immediate);
        self.execute(immediate).await
    }
}

/// `{definition, actions}` accessor for one export.
#[derive(Clone)]
pub struct ExportHandle {
    registry: ParameterRegistry,
    namespace: String,
    id: String,
}

impl ExportHandle {
    pub fn definition(&self) -> Option<ExportDefinition> {
        self.registry.store.read(|s| {
            s.namespaces
                .get(&self.namespace)
                .and_then(|n| n.exports.get(&self.id).cloned())
        })
    }

    /// Request the export with the namespace's current UI values, overridden
    /// by `overrides` (keyed by parameter id).
    pub async fn request(&self, overrides: NamespaceValues) -> Result<ExportResult, StateError> {
        let (session, values) = self.registry.store.read(|s| {
            let n = s
                .namespaces
                .get(&self.namespace)
                .ok_or_else(|| StateError::not_found(format!("Namespace {}", self.namespace)))?;
            let mut values: NamespaceValues = n
                .parameters
                .iter()
                .map(|(id, p)| (id.clone(), p.state.ui_value.clone()))
                .collect();
            for (id, value) in overrides {
                let p = n
                    .parameters
                    .get(&id)
                    .ok_or_else(|| StateError::not_found(format!("Parameter {id}")))?;
                let v = p
                    .definition
                    .param_type
                    .validate(&value)
                    .map_err(|message| StateError::Validation { message })?;
                values.insert(id, v);
            }
            Ok::<_, StateError>((Arc::clone(&n.session), values))
        })?;
        session
            .request_export(&self.id, values)
            .await
            .map_err(|e| StateError::session(&self.namespace, &e))
    }
}

/// Read-only state of an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct OutputState {
    /// Revision of the namespace's executed values the output belongs to.
    pub revision: u64,
}

/// `{definition, state}` accessor for one output.
#[derive(Clone)]
pub struct OutputHandle {
    registry: ParameterRegistry,
    namespace: String,
    id: String,
}

impl OutputHandle {
    pub fn definition(&self) -> Option<OutputDefinition> {
        self.registry.store.read(|s| {
            s.namespaces
                .get(&self.namespace)
                .and_then(|n| n.outputs.get(&self.id).cloned())
        })
    }

    pub fn state(&self) -> Option<OutputState> {
        self.registry.store.read(|s| {
            s.namespaces
                .get(&self.namespace)
                .filter(|n| n.outputs.contains_key(&self.id))
                .map(|n| OutputState {
                    revision: n.revision,
                })
        })
    }
}
