//! Process manager: tracks batches of concurrent scene-mutation futures per
//! controller session and aggregates their progress.
//!
//! A manager holds a busy flag and a suspend-scene-updates flag on its
//! viewports from creation until every registered process settled. One
//! process failing never cancels or blocks its siblings; the failure is
//! recorded in the manager's error map and the manager still settles.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{SessionError, StateError};
use crate::model::{
    ProcessManagerStatus, ProcessManagerSummary, ProcessMessage, Progress, ProgressReport,
};
use crate::store::{Store, Subscription};
use crate::viewport::{FlagKind, FlagToken, Viewport, ViewportRegistry};

/// A long-running operation to track.
pub struct ProcessDefinition {
    pub id: String,
    pub name: Option<String>,
    pub future: BoxFuture<'static, Result<(), SessionError>>,
    /// Incremental reports. The last one received is the current progress.
    pub progress: Option<mpsc::UnboundedReceiver<Progress>>,
}

impl ProcessDefinition {
    pub fn new<F>(id: &str, future: F) -> Self
    where
        F: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            name: None,
            future: Box::pin(future),
            progress: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedReceiver<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Observable state of one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessState {
    pub id: String,
    pub name: Option<String>,
    pub resolved: bool,
    pub progress: Vec<Progress>,
    /// Most recent non-empty message, kept across reports without one.
    pub last_msg: Option<String>,
    pub error: Option<String>,
}

impl ProcessState {
    /// Fraction used for aggregation: settled processes count as done.
    fn fraction(&self) -> f64 {
        if self.resolved {
            1.0
        } else {
            self.progress.last().map_or(0.0, |p| p.percentage)
        }
    }
}

/// Observable state of one process manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessManagerState {
    pub id: String,
    pub controller_session_id: String,
    pub processes: IndexMap<String, ProcessState>,
    pub status: ProcessManagerStatus,
}

impl ProcessManagerState {
    pub fn errors(&self) -> BTreeMap<String, String> {
        self.processes
            .values()
            .filter_map(|p| p.error.clone().map(|e| (p.id.clone(), e)))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) -> ProgressReport {
        let percentage = if self.processes.is_empty() {
            0.0
        } else {
            let sum: f64 = self.processes.values().map(ProcessState::fraction).sum();
            sum / self.processes.len() as f64 * 100.0
        };
        let messages = self
            .processes
            .values()
            .filter_map(|p| {
                p.last_msg.as_ref().map(|msg| ProcessMessage {
                    process_id: p.id.clone(),
                    name: p.name.clone(),
                    msg: msg.clone(),
                })
            })
            .collect();
        ProgressReport {
            process_manager_id: self.id.clone(),
            controller_session_id: self.controller_session_id.clone(),
            percentage,
            messages,
            status: self.status,
        }
    }

    fn summary(&self) -> ProcessManagerSummary {
        ProcessManagerSummary {
            id: self.id.clone(),
            controller_session_id: self.controller_session_id.clone(),
            status: self.status,
            process_count: self.processes.len(),
            errors: self.errors(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistryState {
    pub managers: IndexMap<String, ProcessManagerState>,
}

struct HeldFlag {
    viewport: Arc<dyn Viewport>,
    token: FlagToken,
}

struct ProcessRegistryInner {
    store: Store<ProcessRegistryState>,
    viewports: ViewportRegistry,
    render_after_processes: bool,
    flags: Mutex<HashMap<String, Vec<HeldFlag>>>,
    finished: Mutex<HashMap<String, watch::Sender<Option<ProcessManagerSummary>>>>,
}

/// Application-scoped owner of every live process manager.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<ProcessRegistryInner>,
}

impl ProcessRegistry {
    pub fn new(viewports: ViewportRegistry, render_after_processes: bool) -> Self {
        Self {
            inner: Arc::new(ProcessRegistryInner {
                store: Store::new(ProcessRegistryState::default()),
                viewports,
                render_after_processes,
                flags: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Store<ProcessRegistryState> {
        &self.inner.store
    }

    /// Create a manager for `controller_session_id` and flag its viewports
    /// busy and suspended. Returns the manager id.
    pub fn create_process_manager(&self, controller_session_id: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, _rx) = watch::channel(None);
        self.inner.finished.lock().insert(id.clone(), tx);
        self.inner.store.update(|s| {
            s.managers.insert(
                id.clone(),
                ProcessManagerState {
                    id: id.clone(),
                    controller_session_id: controller_session_id.to_string(),
                    processes: IndexMap::new(),
                    status: ProcessManagerStatus::Created,
                },
            );
        });
        self.acquire_flags(&id, controller_session_id);
        tracing::debug!(process_manager = %id, controller_session = %controller_session_id, "Process manager created");
        id
    }

    /// Flag the viewports of a manager. A no-op while the manager already
    /// holds its flags.
    fn acquire_flags(&self, id: &str, controller_session_id: &str) {
        let mut flags = self.inner.flags.lock();
        if flags.contains_key(id) {
            return;
        }
        let mut held = Vec::new();
        for viewport in self.inner.viewports.for_session(controller_session_id) {
            for kind in [FlagKind::Busy, FlagKind::SuspendSceneUpdates] {
                let token = viewport.add_flag(kind);
                held.push(HeldFlag {
                    viewport: Arc::clone(&viewport),
                    token,
                });
            }
        }
        flags.insert(id.to_string(), held);
    }

    /// Release a manager's flags, most recent first, then ask each flagged
    /// viewport to render once.
    fn release_flags(&self, id: &str) {
        let Some(held) = self.inner.flags.lock().remove(id) else {
            return;
        };
        let mut rendered: Vec<String> = Vec::new();
        for flag in held.iter().rev() {
            flag.viewport.remove_flag(&flag.token);
        }
        if self.inner.render_after_processes {
            for flag in &held {
                let viewport_id = flag.viewport.id();
                if !rendered.contains(&viewport_id) {
                    flag.viewport.render();
                    rendered.push(viewport_id);
                }
            }
        }
    }

    /// Register a process with a manager and start driving it.
    pub fn add_process(
        &self,
        process_manager_id: &str,
        process: ProcessDefinition,
    ) -> Result<(), StateError> {
        self.add_processes(process_manager_id, vec![process])
    }

    /// Register a batch of processes with a manager, then start driving them.
    /// The whole batch is registered before any of it runs, so the manager
    /// cannot settle while part of the batch is still unregistered.
    pub fn add_processes(
        &self,
        process_manager_id: &str,
        processes: Vec<ProcessDefinition>,
    ) -> Result<(), StateError> {
        if processes.is_empty() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| StateError::Validation {
            message: format!("Processes need a Tokio runtime: {e}"),
        })?;

        self.inner.store.update(|s| {
            let manager = s.managers.get_mut(process_manager_id).ok_or_else(|| {
                StateError::ProcessManagerClosed {
                    id: process_manager_id.to_string(),
                }
            })?;
            if manager.status.is_settled() {
                return Err(StateError::ProcessManagerClosed {
                    id: process_manager_id.to_string(),
                });
            }
            for (i, process) in processes.iter().enumerate() {
                let repeated = processes.iter().take(i).any(|p| p.id == process.id);
                if repeated || manager.processes.contains_key(&process.id) {
                    return Err(StateError::Validation {
                        message: format!("Process {} is already registered", process.id),
                    });
                }
            }
            for process in &processes {
                manager.processes.insert(
                    process.id.clone(),
                    ProcessState {
                        id: process.id.clone(),
                        name: process.name.clone(),
                        resolved: false,
                        progress: Vec::new(),
                        last_msg: None,
                        error: None,
                    },
                );
            }
            manager.status = ProcessManagerStatus::Running;
            Ok(())
        })?;

        for process in processes {
            let registry = self.clone();
            let manager_id = process_manager_id.to_string();
            runtime.spawn(async move {
                registry.drive(manager_id, process).await;
            });
        }
        Ok(())
    }

    /// Create a manager for `controller_session_id` holding `processes`.
    /// Returns `None` when there is nothing to track.
    pub fn track(
        &self,
        controller_session_id: &str,
        processes: Vec<ProcessDefinition>,
    ) -> Result<Option<String>, StateError> {
        if processes.is_empty() {
            return Ok(None);
        }
        let id = self.create_process_manager(controller_session_id);
        if let Err(e) = self.add_processes(&id, processes) {
            self.remove_process_manager(&id);
            return Err(e);
        }
        Ok(Some(id))
    }

    async fn drive(self, manager_id: String, process: ProcessDefinition) {
        let ProcessDefinition {
            id,
            mut future,
            progress,
            ..
        } = process;

        let outcome = match progress {
            None => future.await,
            Some(mut rx) => {
                let mut open = true;
                loop {
                    tokio::select! {
                        biased;
                        report = rx.recv(), if open => match report {
                            Some(p) => self.record_progress(&manager_id, &id, p),
                            None => open = false,
                        },
                        result = &mut future => {
                            while let Ok(p) = rx.try_recv() {
                                self.record_progress(&manager_id, &id, p);
                            }
                            break result;
                        }
                    }
                }
            }
        };
        self.settle(&manager_id, &id, outcome);
    }

    fn record_progress(&self, manager_id: &str, process_id: &str, progress: Progress) {
        self.inner.store.update(|s| {
            if let Some(process) = s
                .managers
                .get_mut(manager_id)
                .and_then(|m| m.processes.get_mut(process_id))
            {
                if let Some(msg) = progress.msg.as_ref().filter(|m| !m.is_empty()) {
                    process.last_msg = Some(msg.clone());
                }
                process.progress.push(progress);
            }
        });
    }

    fn settle(&self, manager_id: &str, process_id: &str, outcome: Result<(), SessionError>) {
        if let Err(e) = &outcome {
            tracing::warn!(process_manager = %manager_id, process = %process_id, error = %e, "Process failed");
        }
        let summary = self.inner.store.update(|s| {
            let manager = s.managers.get_mut(manager_id)?;
            if let Some(process) = manager.processes.get_mut(process_id) {
                process.resolved = true;
                process.error = outcome.err().map(|e| e.message);
            }
            if manager.processes.values().all(|p| p.resolved) {
                manager.status = ProcessManagerStatus::Finished;
                Some(manager.summary())
            } else {
                None
            }
        });
        if let Some(summary) = summary {
            self.finish(summary);
        }
    }

    fn finish(&self, summary: ProcessManagerSummary) {
        let id = summary.id.clone();
        self.release_flags(&id);
        tracing::info!(
            process_manager = %id,
            status = ?summary.status,
            processes = summary.process_count,
            errors = summary.errors.len(),
            "Process manager settled"
        );
        if let Some(tx) = self.inner.finished.lock().remove(&id) {
            tx.send_replace(Some(summary));
        }
        self.inner.store.update(|s| {
            s.managers.shift_remove(&id);
        });
    }

    /// Deregister a manager without waiting for its processes, releasing its
    /// flags. Processes still running keep running but are no longer tracked.
    pub fn remove_process_manager(&self, process_manager_id: &str) -> bool {
        let removed = self
            .inner
            .store
            .update(|s| s.managers.shift_remove(process_manager_id))
            .is_some();
        if removed {
            self.release_flags(process_manager_id);
            self.inner.finished.lock().remove(process_manager_id);
        }
        removed
    }

    pub fn process_manager(&self, process_manager_id: &str) -> Option<ProcessManagerState> {
        self.inner
            .store
            .read(|s| s.managers.get(process_manager_id).cloned())
    }

    /// Call `callback` with the aggregated progress of a manager whenever it
    /// changes.
    pub fn notify_progress_change<F>(
        &self,
        process_manager_id: &str,
        callback: F,
    ) -> Result<Subscription, StateError>
    where
        F: Fn(&ProgressReport) + Send + Sync + 'static,
    {
        if self.process_manager(process_manager_id).is_none() {
            return Err(StateError::not_found(format!(
                "Process manager {process_manager_id}"
            )));
        }
        let id = process_manager_id.to_string();
        Ok(self.inner.store.subscribe(
            move |s: &ProcessRegistryState| s.managers.get(&id).map(ProcessManagerState::report),
            move |report| {
                if let Some(report) = report {
                    callback(report);
                }
            },
        ))
    }

    /// Resolves with the summary once the manager settled. Resolves with
    /// `None` for unknown managers or managers removed before settling.
    pub fn wait(
        &self,
        process_manager_id: &str,
    ) -> impl Future<Output = Option<ProcessManagerSummary>> + Send + 'static {
        let rx = self
            .inner
            .finished
            .lock()
            .get(process_manager_id)
            .map(watch::Sender::subscribe);
        async move {
            let mut rx = rx?;
            let result = rx.wait_for(Option::is_some).await.ok()?.clone();
            result
        }
    }

    /// Deregister every manager and release all flags.
    pub fn clear(&self) {
        let ids: Vec<String> = self
            .inner
            .store
            .read(|s| s.managers.keys().cloned().collect());
        for id in ids.iter().rev() {
            self.remove_process_manager(id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use crate::viewport::MemoryViewport;

    fn setup() -> (ProcessRegistry, Arc<MemoryViewport>) {
        let viewports = ViewportRegistry::new();
        let viewport = Arc::new(MemoryViewport::new("main"));
        viewports.register(viewport.clone(), Some("session"));
        (ProcessRegistry::new(viewports, true), viewport)
    }

    fn gated(id: &str) -> (ProcessDefinition, oneshot::Sender<Result<(), SessionError>>) {
        let (tx, rx) = oneshot::channel();
        let def = ProcessDefinition::new(id, async move {
            rx.await.unwrap_or_else(|_| Err(SessionError::new("dropped")))
        });
        (def, tx)
    }

    #[tokio::test]
    async fn flags_held_until_all_processes_settle() {
        let (registry, viewport) = setup();
        let id = registry.create_process_manager("session");
        assert!(viewport.is_flag_set(FlagKind::Busy));
        assert!(viewport.is_flag_set(FlagKind::SuspendSceneUpdates));
        assert_eq!(
            registry.process_manager(&id).unwrap().status,
            ProcessManagerStatus::Created
        );

        let (a, done_a) = gated("a");
        let (b, done_b) = gated("b");
        registry.add_process(&id, a).unwrap();
        registry.add_process(&id, b).unwrap();
        assert_eq!(
            registry.process_manager(&id).unwrap().status,
            ProcessManagerStatus::Running
        );
        let waiter = registry.wait(&id);

        done_a.send(Ok(())).unwrap();
        tokio::task::yield_now().await;
        assert!(viewport.is_flag_set(FlagKind::Busy));
        assert!(viewport.released_tokens().is_empty());

        done_b.send(Ok(())).unwrap();
        let summary = waiter.await.unwrap();
        assert_eq!(summary.status, ProcessManagerStatus::Finished);
        assert_eq!(summary.process_count, 2);

        assert!(!viewport.is_flag_set(FlagKind::Busy));
        assert!(!viewport.is_flag_set(FlagKind::SuspendSceneUpdates));
        assert_eq!(viewport.released_tokens().len(), 2);
        assert_eq!(viewport.render_count(), 1);
        assert!(registry.process_manager(&id).is_none());
    }

    #[tokio::test]
    async fn failure_is_recorded_without_blocking_siblings() {
        let (registry, viewport) = setup();
        let id = registry.create_process_manager("session");
        let (a, done_a) = gated("a");
        let (b, done_b) = gated("b");
        registry.add_process(&id, a).unwrap();
        registry.add_process(&id, b).unwrap();
        let waiter = registry.wait(&id);

        done_a.send(Err(SessionError::new("instancing failed"))).unwrap();
        done_b.send(Ok(())).unwrap();

        let summary = waiter.await.unwrap();
        assert_eq!(summary.status, ProcessManagerStatus::Finished);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors["a"], "instancing failed");
        assert!(!viewport.is_flag_set(FlagKind::Busy));
        assert_eq!(viewport.released_tokens().len(), 2);
    }

    #[tokio::test]
    async fn aggregate_progress_is_mean_of_last_reports() {
        let (registry, _viewport) = setup();
        let id = registry.create_process_manager("session");

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let _sub = registry
            .notify_progress_change(&id, move |r| sink.lock().push(r.clone()))
            .unwrap();

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (a, done_a) = gated("a");
        let (b, done_b) = gated("b");
        registry.add_process(&id, a.with_progress(rx_a)).unwrap();
        registry
            .add_process(&id, b.with_name("Instancing").with_progress(rx_b))
            .unwrap();
        let waiter = registry.wait(&id);

        tx_a.send(Progress::new(0.1)).unwrap();
        tx_a.send(Progress::new(0.4)).unwrap();
        tx_b.send(Progress::with_msg(0.6, "placing parts")).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let last = reports.lock().last().cloned().unwrap();
        assert!((last.percentage - 50.0).abs() < 1e-9);
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].msg, "placing parts");
        assert_eq!(last.messages[0].name.as_deref(), Some("Instancing"));

        let state = registry.process_manager(&id).unwrap();
        assert_eq!(state.processes["a"].progress.len(), 2);

        done_a.send(Ok(())).unwrap();
        done_b.send(Ok(())).unwrap();
        waiter.await.unwrap();

        let last = reports.lock().last().cloned().unwrap();
        assert!((last.percentage - 100.0).abs() < 1e-9);
        assert!(last.status.is_settled());
    }

    #[tokio::test]
    async fn settled_manager_rejects_new_processes() {
        let (registry, _viewport) = setup();
        let id = registry.create_process_manager("session");
        let (a, done_a) = gated("a");
        registry.add_process(&id, a).unwrap();
        let waiter = registry.wait(&id);
        done_a.send(Ok(())).unwrap();
        waiter.await.unwrap();

        let (late, _tx) = gated("late");
        let err = registry.add_process(&id, late).unwrap_err();
        assert!(matches!(err, StateError::ProcessManagerClosed { .. }));
    }

    #[tokio::test]
    async fn duplicate_process_id_is_rejected() {
        let (registry, _viewport) = setup();
        let id = registry.create_process_manager("session");
        let (a, _done_a) = gated("a");
        let (again, _done_again) = gated("a");
        registry.add_process(&id, a).unwrap();
        assert!(matches!(
            registry.add_process(&id, again),
            Err(StateError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn removing_manager_releases_flags_once() {
        let (registry, viewport) = setup();
        let id = registry.create_process_manager("session");
        assert!(registry.remove_process_manager(&id));
        assert!(!registry.remove_process_manager(&id));
        assert_eq!(viewport.released_tokens().len(), 2);
        assert!(!viewport.is_flag_set(FlagKind::Busy));
        assert!(registry.wait(&id).await.is_none());
    }

    #[tokio::test]
    async fn later_reports_without_message_keep_the_last_one() {
        let (registry, _viewport) = setup();
        let id = registry.create_process_manager("session");
        let (tx, rx) = mpsc::unbounded_channel();
        let (a, done_a) = gated("a");
        registry.add_process(&id, a.with_progress(rx)).unwrap();

        tx.send(Progress::with_msg(0.2, "loading textures")).unwrap();
        tx.send(Progress::new(0.5)).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let report = registry.process_manager(&id).unwrap().report();
        assert!((report.percentage - 50.0).abs() < 1e-9);
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].msg, "loading textures");

        done_a.send(Ok(())).unwrap();
    }

    #[tokio::test]
    async fn acquiring_flags_again_adds_no_tokens() {
        let (registry, viewport) = setup();
        let id = registry.create_process_manager("session");
        registry.acquire_flags(&id, "session");
        assert_eq!(viewport.flag_count(FlagKind::Busy), 1);
        assert_eq!(viewport.flag_count(FlagKind::SuspendSceneUpdates), 1);

        assert!(registry.remove_process_manager(&id));
        assert_eq!(viewport.released_tokens().len(), 2);
        assert!(!viewport.is_flag_set(FlagKind::Busy));
    }

    #[tokio::test]
    async fn batch_with_repeated_id_registers_nothing() {
        let (registry, _viewport) = setup();
        let id = registry.create_process_manager("session");
        let (a, _done_a) = gated("a");
        let (b, _done_b) = gated("a");
        assert!(matches!(
            registry.add_processes(&id, vec![a, b]),
            Err(StateError::Validation { .. })
        ));
        let state = registry.process_manager(&id).unwrap();
        assert!(state.processes.is_empty());
        assert_eq!(state.status, ProcessManagerStatus::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tracked_batch_settles_only_after_every_process() {
        for _ in 0..200 {
            let (registry, viewport) = setup();
            let ran = Arc::new(AtomicUsize::new(0));
            let processes = (0..21)
                .map(|i| {
                    let ran = Arc::clone(&ran);
                    ProcessDefinition::new(&format!("p{i}"), async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .collect();
            let id = registry.track("session", processes).unwrap().unwrap();

            while registry.process_manager(&id).is_some() {
                tokio::task::yield_now().await;
            }
            assert_eq!(ran.load(Ordering::SeqCst), 21);
            assert_eq!(viewport.released_tokens().len(), 2);
            assert!(!viewport.is_flag_set(FlagKind::Busy));
            assert!(!viewport.is_flag_set(FlagKind::SuspendSceneUpdates));
        }
    }

    #[tokio::test]
    async fn track_with_no_processes_creates_nothing() {
        let (registry, viewport) = setup();
        assert!(registry.track("session", Vec::new()).unwrap().is_none());
        assert!(!viewport.is_flag_set(FlagKind::Busy));
    }
}
