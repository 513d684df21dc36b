use std::sync::Arc;

use crate::commit::CommitCoordinator;
use crate::history::{HistoryManager, MemoryNavigation, NavigationHost};
use crate::interaction::InteractionArbiter;
use crate::parameters::{ParameterRegistry, SessionOptions};
use crate::process::ProcessRegistry;
use crate::session::Session;
use crate::settings::CoreSettings;
use crate::viewport::{Viewport, ViewportRegistry};

// ── Configurator Core ───────────────────────────────────────────

/// Application-scoped owner of every subsystem. Create one per configurator
/// and call [`ConfiguratorCore::dispose`] on teardown.
pub struct ConfiguratorCore {
    settings: CoreSettings,
    viewports: ViewportRegistry,
    processes: ProcessRegistry,
    parameters: ParameterRegistry,
    commits: CommitCoordinator,
    history: HistoryManager,
    interactions: InteractionArbiter,
}

impl ConfiguratorCore {
    pub fn new(settings: CoreSettings, navigation: Arc<dyn NavigationHost>) -> Self {
        let viewports = ViewportRegistry::new();
        let processes = ProcessRegistry::new(viewports.clone(), settings.render_after_processes);
        let parameters =
            ParameterRegistry::new(settings.default_commit_mode, Some(processes.clone()));
        let commits = CommitCoordinator::new(parameters.clone());
        let history = HistoryManager::new(
            parameters.clone(),
            navigation,
            &settings.model_state_query_param,
        );
        Self {
            settings,
            viewports,
            processes,
            parameters,
            commits,
            history,
            interactions: InteractionArbiter::new(),
        }
    }

    /// A core whose navigation history lives in memory.
    pub fn headless(settings: CoreSettings) -> Self {
        let navigation = Arc::new(MemoryNavigation::new(settings.max_history_entries));
        Self::new(settings, navigation)
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn viewports(&self) -> &ViewportRegistry {
        &self.viewports
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn parameters(&self) -> &ParameterRegistry {
        &self.parameters
    }

    pub fn commits(&self) -> &CommitCoordinator {
        &self.commits
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn interactions(&self) -> &InteractionArbiter {
        &self.interactions
    }

    pub fn register_session(&self, session: Arc<dyn Session>, options: SessionOptions) -> String {
        self.parameters.register_session(session, options)
    }

    pub fn register_viewport(&self, viewport: Arc<dyn Viewport>, controller_session_id: Option<&str>) {
        self.viewports.register(viewport, controller_session_id);
    }

    /// Drop a viewport and every interaction request made on it.
    pub fn unregister_viewport(&self, viewport_id: &str) {
        self.interactions.clear_viewport(viewport_id);
        self.viewports.unregister(viewport_id);
    }

    /// Tear down in reverse order of construction.
    pub fn dispose(&self) {
        self.history.reset();
        self.interactions.clear();
        self.processes.clear();
        for namespace in self.parameters.namespaces() {
            self.parameters.close_session(&namespace);
        }
        self.viewports.clear();
        tracing::info!("Configurator core disposed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use crate::error::SessionError;
    use crate::interaction::{InteractionHandler, InteractionRequest};
    use crate::model::{ParamType, ParamValue, ParameterDefinition, ProcessManagerStatus};
    use crate::process::ProcessDefinition;
    use crate::session::{CommitMode, MemorySession};
    use crate::viewport::{FlagKind, MemoryViewport};

    struct Inert;

    impl InteractionHandler for Inert {
        fn disable(&self) {}
    }

    fn table() -> Arc<MemorySession> {
        Arc::new(
            MemorySession::new(
                "table",
                vec![ParameterDefinition::new(
                    "legs",
                    "Legs",
                    ParamType::Int { min: 3, max: 8 },
                    ParamValue::Int(4),
                )],
            )
            .with_controller_session("controller"),
        )
    }

    #[tokio::test]
    async fn accept_reject_flow_with_history_and_scene_updates() {
        let core = ConfiguratorCore::headless(CoreSettings {
            default_commit_mode: Some(CommitMode::AcceptReject),
            ..CoreSettings::default()
        });
        let viewport = Arc::new(MemoryViewport::new("main"));
        core.register_viewport(viewport.clone(), Some("controller"));
        let session = table();
        let ns = core.register_session(session.clone(), SessionOptions::default());
        core.history().load_default_state(true);

        let legs = core.parameters().parameter(&ns, "Legs").unwrap();
        assert!(legs.set_ui_value(&ParamValue::Int(6)));
        legs.execute_default().await.unwrap();
        assert!(session.customize_calls().is_empty());
        assert_eq!(core.commits().parameter_changes().len(), 1);

        let (done, gate) = tokio::sync::oneshot::channel::<()>();
        session.queue_scene_update(ProcessDefinition::new("instances", async move {
            gate.await.map_err(|_| SessionError::new("scene update dropped"))
        }));
        core.commits().accept(None).await.unwrap();
        assert!(core.commits().parameter_changes().is_empty());
        assert_eq!(core.history().undo_state().entry_count, 2);

        let id = core
            .processes()
            .store()
            .read(|s| s.managers.keys().next().cloned())
            .unwrap();
        assert!(viewport.is_flag_set(FlagKind::Busy));
        let waiter = core.processes().wait(&id);
        done.send(()).unwrap();
        let summary = waiter.await.unwrap();
        assert_eq!(summary.status, ProcessManagerStatus::Finished);
        assert_eq!(summary.process_count, 1);
        assert!(summary.errors.is_empty());
        assert!(!viewport.is_flag_set(FlagKind::Busy));
        assert_eq!(viewport.render_count(), 1);

        assert!(core.history().undo().await.unwrap());
        assert_eq!(legs.state().unwrap().exec_value, ParamValue::Int(4));
    }

    #[test]
    fn dispose_tears_everything_down() {
        let core = ConfiguratorCore::headless(CoreSettings::default());
        core.register_viewport(Arc::new(MemoryViewport::new("main")), None);
        core.register_session(table(), SessionOptions::default());
        core.history().load_default_state(true);
        let token = core
            .interactions()
            .add_interaction_request(InteractionRequest::active("main", Arc::new(Inert)));

        core.dispose();

        assert!(core.parameters().namespaces().is_empty());
        assert!(core.viewports().get("main").is_none());
        assert!(!core.interactions().is_enabled(&token));
        assert!(core.history().default_state().is_none());
        assert_eq!(core.history().undo_state().entry_count, 0);
    }

    #[test]
    fn unregistering_viewport_drops_its_requests() {
        let core = ConfiguratorCore::headless(CoreSettings::default());
        core.register_viewport(Arc::new(MemoryViewport::new("main")), None);
        let token = core
            .interactions()
            .add_interaction_request(InteractionRequest::passive("main", Arc::new(Inert)));
        assert!(core.interactions().is_enabled(&token));

        core.unregister_viewport("main");
        assert!(!core.interactions().is_enabled(&token));
        assert!(core.viewports().get("main").is_none());
    }
}
