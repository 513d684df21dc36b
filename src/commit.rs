//! Pending changes per namespace, and accept/reject over them.

use serde::Serialize;
use ts_rs::TS;

use crate::error::StateError;
use crate::model::NamespaceValues;
use crate::parameters::{ParameterRegistry, ParameterStoreState};
use crate::store::Subscription;

/// Dirty parameters of one namespace. Exists only while at least one
/// parameter of the namespace is dirty.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ParameterChanges {
    pub namespace: String,
    /// Parameter id to pending UI value.
    #[ts(type = "Record<string, unknown>")]
    pub values: NamespaceValues,
    /// A batch execution or a history restore is in flight.
    pub executing: bool,
    /// Lower accepts first.
    pub priority: i32,
}

/// Derive the pending changes from registry state, lowest priority first.
/// Namespaces of equal priority keep registration order.
pub fn parameter_changes(state: &ParameterStoreState) -> Vec<ParameterChanges> {
    let mut changes: Vec<ParameterChanges> = state
        .namespaces
        .iter()
        .filter(|(_, n)| n.is_dirty())
        .map(|(ns, n)| ParameterChanges {
            namespace: ns.clone(),
            values: n.dirty_values(),
            executing: n.is_busy(),
            priority: n.priority,
        })
        .collect();
    changes.sort_by_key(|c| c.priority);
    changes
}

#[derive(Clone)]
pub struct CommitCoordinator {
    parameters: ParameterRegistry,
}

impl CommitCoordinator {
    pub fn new(parameters: ParameterRegistry) -> Self {
        Self { parameters }
    }

    pub fn parameter_changes(&self) -> Vec<ParameterChanges> {
        self.parameters.store().read(parameter_changes)
    }

    pub fn changes_for(&self, namespace: &str) -> Option<ParameterChanges> {
        self.parameter_changes()
            .into_iter()
            .find(|c| c.namespace == namespace)
    }

    /// Called whenever the set of pending changes changes.
    pub fn subscribe_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<ParameterChanges>) + Send + Sync + 'static,
    {
        self.parameters.subscribe(parameter_changes, callback)
    }

    fn targets(&self, namespaces: Option<&[String]>) -> Vec<ParameterChanges> {
        self.parameter_changes()
            .into_iter()
            .filter(|c| namespaces.map_or(true, |ns| ns.contains(&c.namespace)))
            .collect()
    }

    /// Execute the pending changes of `namespaces` (all when `None`), one
    /// batch per namespace, in priority order. Stops at the first failure;
    /// the failed namespace and every later one stay dirty.
    pub async fn accept(&self, namespaces: Option<&[String]>) -> Result<(), StateError> {
        let targets = self.targets(namespaces);
        if let Some(busy) = targets.iter().find(|c| c.executing) {
            return Err(StateError::CommitInProgress {
                namespace: busy.namespace.clone(),
            });
        }
        for change in targets {
            tracing::debug!(namespace = %change.namespace, priority = change.priority, "Accepting changes");
            self.parameters
                .execute_batch(&change.namespace, None)
                .await?;
        }
        Ok(())
    }

    pub async fn accept_namespace(&self, namespace: &str) -> Result<(), StateError> {
        let namespaces = [namespace.to_string()];
        self.accept(Some(namespaces.as_slice())).await
    }

    /// Reset the UI values of `namespaces` (all when `None`) to their
    /// executed values. No session is called. Returns the number of
    /// parameters reset.
    pub fn reject(&self, namespaces: Option<&[String]>) -> Result<usize, StateError> {
        let targets = self.targets(namespaces);
        if let Some(busy) = targets.iter().find(|c| c.executing) {
            return Err(StateError::CommitInProgress {
                namespace: busy.namespace.clone(),
            });
        }
        let mut reset = 0;
        for change in targets {
            reset += self.parameters.reset_ui_values(&change.namespace)?;
            tracing::debug!(namespace = %change.namespace, "Rejected changes");
        }
        Ok(reset)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::model::{ParamType, ParamValue, ParameterDefinition};
    use crate::parameters::SessionOptions;
    use crate::session::{CommitMode, MemorySession};

    fn session(id: &str) -> Arc<MemorySession> {
        Arc::new(
            MemorySession::new(
                id,
                vec![
                    ParameterDefinition::new(
                        "size",
                        "Size",
                        ParamType::Int { min: 1, max: 10 },
                        ParamValue::Int(1),
                    ),
                    ParameterDefinition::new("lid", "Lid", ParamType::Bool, ParamValue::Bool(false)),
                ],
            )
            .with_commit_mode(CommitMode::AcceptReject),
        )
    }

    fn setup() -> (ParameterRegistry, CommitCoordinator, Arc<MemorySession>, Arc<MemorySession>) {
        let registry = ParameterRegistry::new(None, None);
        let a = session("a");
        let b = session("b");
        registry.register_session(a.clone(), SessionOptions { priority: 1, commit_mode: None });
        registry.register_session(b.clone(), SessionOptions { priority: 0, commit_mode: None });
        let coordinator = CommitCoordinator::new(registry.clone());
        (registry, coordinator, a, b)
    }

    fn edit(registry: &ParameterRegistry, ns: &str, id: &str, value: ParamValue) {
        assert!(registry.parameter(ns, id).unwrap().set_ui_value(&value));
    }

    #[test]
    fn changes_exist_only_for_dirty_namespaces() {
        let (registry, coordinator, _, _) = setup();
        assert!(coordinator.parameter_changes().is_empty());

        edit(&registry, "a", "size", ParamValue::Int(4));
        edit(&registry, "a", "lid", ParamValue::Bool(true));
        let changes = coordinator.parameter_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].namespace, "a");
        assert_eq!(changes[0].values.len(), 2);
        assert!(!changes[0].executing);

        edit(&registry, "a", "size", ParamValue::Int(1));
        edit(&registry, "a", "lid", ParamValue::Bool(false));
        assert!(coordinator.changes_for("a").is_none());
    }

    #[tokio::test]
    async fn accept_batches_per_namespace_in_priority_order() {
        let (registry, coordinator, a, b) = setup();
        edit(&registry, "a", "size", ParamValue::Int(3));
        edit(&registry, "a", "lid", ParamValue::Bool(true));
        edit(&registry, "b", "size", ParamValue::Int(5));
        b.pause();

        let accepting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.accept(None).await })
        };
        tokio::task::yield_now().await;
        // b has the lower priority and is held, so a has not been sent yet.
        assert_eq!(b.customize_calls().len(), 1);
        assert!(a.customize_calls().is_empty());
        assert!(coordinator.changes_for("b").unwrap().executing);

        b.release(1);
        accepting.await.unwrap().unwrap();

        let calls = a.customize_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
        assert!(coordinator.parameter_changes().is_empty());
        assert_eq!(a.remote_values()["size"], ParamValue::Int(3));
    }

    #[tokio::test]
    async fn accept_stops_at_first_failure() {
        let (registry, coordinator, a, b) = setup();
        edit(&registry, "a", "size", ParamValue::Int(3));
        edit(&registry, "b", "size", ParamValue::Int(5));
        b.fail_next("backend down");

        let err = coordinator.accept(None).await.unwrap_err();
        assert!(matches!(err, StateError::Session { ref namespace, .. } if namespace == "b"));
        assert!(a.customize_calls().is_empty());
        let pending: Vec<String> = coordinator
            .parameter_changes()
            .into_iter()
            .map(|c| c.namespace)
            .collect();
        assert_eq!(pending, vec!["b".to_string(), "a".to_string()]);

        coordinator.accept(None).await.unwrap();
        assert!(coordinator.parameter_changes().is_empty());
    }

    #[tokio::test]
    async fn accept_namespace_leaves_others_pending() {
        let (registry, coordinator, _, b) = setup();
        edit(&registry, "a", "size", ParamValue::Int(3));
        edit(&registry, "b", "size", ParamValue::Int(5));

        coordinator.accept_namespace("a").await.unwrap();
        assert!(coordinator.changes_for("a").is_none());
        assert!(coordinator.changes_for("b").is_some());
        assert!(b.customize_calls().is_empty());
    }

    #[tokio::test]
    async fn reject_restores_executed_values_without_session_calls() {
        let (registry, coordinator, a, b) = setup();
        edit(&registry, "a", "size", ParamValue::Int(3));
        coordinator.accept(None).await.unwrap();
        edit(&registry, "a", "size", ParamValue::Int(7));
        edit(&registry, "b", "lid", ParamValue::Bool(true));

        assert_eq!(coordinator.reject(Some(&["a".to_string()][..])).unwrap(), 1);
        let state = registry.parameter("a", "size").unwrap().state().unwrap();
        assert_eq!(state.ui_value, ParamValue::Int(3));
        assert!(!state.dirty);
        assert!(coordinator.changes_for("b").is_some());

        assert_eq!(coordinator.reject(None).unwrap(), 1);
        assert!(coordinator.parameter_changes().is_empty());
        assert_eq!(a.customize_calls().len(), 1);
        assert!(b.customize_calls().is_empty());
    }

    #[tokio::test]
    async fn reject_refuses_executing_namespace() {
        let (registry, coordinator, a, _) = setup();
        edit(&registry, "a", "size", ParamValue::Int(3));
        a.pause();
        let accepting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.accept_namespace("a").await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(
            coordinator.reject(None),
            Err(StateError::CommitInProgress { .. })
        ));
        assert!(matches!(
            coordinator.accept(None).await,
            Err(StateError::CommitInProgress { .. })
        ));
        a.release(1);
        accepting.await.unwrap().unwrap();
    }

    #[test]
    fn subscribers_see_pending_changes() {
        let (registry, coordinator, _, _) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            coordinator.subscribe_changes(move |changes| seen.lock().push(changes.len()))
        };
        edit(&registry, "a", "size", ParamValue::Int(3));
        // Same dirty set, new value.
        edit(&registry, "a", "size", ParamValue::Int(4));
        edit(&registry, "b", "size", ParamValue::Int(2));
        coordinator.reject(None).unwrap();
        assert_eq!(*seen.lock(), vec![1, 1, 2, 1, 0]);
    }
}
