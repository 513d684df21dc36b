//! Undo/redo over committed state, backed by the host's navigation stack.
//!
//! Every successful batch execution pushes a [`HistoryEntry`] snapshot of the
//! executed values of all namespaces. Navigating back or forward restores an
//! entry through the sessions, all namespaces or none.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::StateError;
use crate::model::{HistoryEntry, NamespaceValues, UndoState};
use crate::parameters::{ParameterRegistry, RestoreTicket};
use crate::store::Subscription;

/// The host's navigation history (the browser's, in a web host).
pub trait NavigationHost: Send + Sync {
    /// Append an entry after the current one, dropping any forward entries.
    fn push_state(&self, entry: HistoryEntry);
    /// Overwrite the current entry.
    fn replace_state(&self, entry: HistoryEntry);
    fn current_state(&self) -> Option<HistoryEntry>;
    /// Step back and return the entry that became current.
    fn back(&self) -> Option<HistoryEntry>;
    fn forward(&self) -> Option<HistoryEntry>;
    fn undo_state(&self) -> UndoState;
    fn query_param(&self, key: &str) -> Option<String>;
    fn set_query_param(&self, key: &str, value: Option<&str>);
    fn reset(&self);
}

#[derive(Default)]
struct NavigationStack {
    entries: Vec<HistoryEntry>,
    index: usize,
    query: BTreeMap<String, String>,
}

/// In-memory navigation stack, capped at `max_entries`.
pub struct MemoryNavigation {
    stack: Mutex<NavigationStack>,
    max_entries: usize,
}

impl MemoryNavigation {
    pub fn new(max_entries: usize) -> Self {
        Self {
            stack: Mutex::new(NavigationStack::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.stack.lock().entries.clone()
    }
}

impl NavigationHost for MemoryNavigation {
    fn push_state(&self, entry: HistoryEntry) {
        let mut stack = self.stack.lock();
        if !stack.entries.is_empty() {
            let keep = stack.index + 1;
            stack.entries.truncate(keep);
        }
        stack.entries.push(entry);
        if stack.entries.len() > self.max_entries {
            stack.entries.remove(0);
        }
        stack.index = stack.entries.len() - 1;
    }

    fn replace_state(&self, entry: HistoryEntry) {
        let mut stack = self.stack.lock();
        let index = stack.index;
        match stack.entries.get_mut(index) {
            Some(current) => *current = entry,
            None => {
                stack.entries.push(entry);
                stack.index = stack.entries.len() - 1;
            }
        }
    }

    fn current_state(&self) -> Option<HistoryEntry> {
        let stack = self.stack.lock();
        stack.entries.get(stack.index).cloned()
    }

    fn back(&self) -> Option<HistoryEntry> {
        let mut stack = self.stack.lock();
        if stack.index == 0 {
            return None;
        }
        stack.index -= 1;
        stack.entries.get(stack.index).cloned()
    }

    fn forward(&self) -> Option<HistoryEntry> {
        let mut stack = self.stack.lock();
        if stack.index + 1 >= stack.entries.len() {
            return None;
        }
        stack.index += 1;
        stack.entries.get(stack.index).cloned()
    }

    fn undo_state(&self) -> UndoState {
        let stack = self.stack.lock();
        UndoState {
            can_undo: stack.index > 0,
            can_redo: stack.index + 1 < stack.entries.len(),
            entry_count: stack.entries.len(),
            current_index: stack.index,
        }
    }

    fn query_param(&self, key: &str) -> Option<String> {
        self.stack.lock().query.get(key).cloned()
    }

    fn set_query_param(&self, key: &str, value: Option<&str>) {
        let mut stack = self.stack.lock();
        match value {
            Some(v) => {
                stack.query.insert(key.to_string(), v.to_string());
            }
            None => {
                stack.query.remove(key);
            }
        }
    }

    fn reset(&self) {
        *self.stack.lock() = NavigationStack::default();
    }
}

// ── HistoryManager ──────────────────────────────────────────────

struct HistoryInner {
    parameters: ParameterRegistry,
    navigation: Arc<dyn NavigationHost>,
    query_param: String,
    sequence: AtomicU64,
    loaded: AtomicBool,
    /// Entry matching the current executed state.
    last: Mutex<Option<HistoryEntry>>,
    baseline: Mutex<Option<HistoryEntry>>,
    commits: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct HistoryManager {
    inner: Arc<HistoryInner>,
}

impl HistoryManager {
    pub fn new(
        parameters: ParameterRegistry,
        navigation: Arc<dyn NavigationHost>,
        query_param: &str,
    ) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                parameters,
                navigation,
                query_param: query_param.to_string(),
                sequence: AtomicU64::new(0),
                loaded: AtomicBool::new(false),
                last: Mutex::new(None),
                baseline: Mutex::new(None),
                commits: Mutex::new(None),
            }),
        }
    }

    fn snapshot(&self) -> HistoryEntry {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        HistoryEntry::new(sequence, self.inner.parameters.snapshot())
    }

    /// Capture the baseline once the initial parameter load of every
    /// namespace is complete. The baseline replaces the current navigation
    /// entry. From then on every successful commit pushes an entry.
    /// Returns `None` if not `loaded` yet or already captured.
    pub fn load_default_state(&self, loaded: bool) -> Option<HistoryEntry> {
        if !loaded || self.inner.loaded.swap(true, Ordering::SeqCst) {
            return None;
        }
        let entry = self.snapshot();
        self.inner.navigation.replace_state(entry.clone());
        *self.inner.last.lock() = Some(entry.clone());
        *self.inner.baseline.lock() = Some(entry.clone());

        let weak: Weak<HistoryInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.parameters.subscribe(
            |s| s.committed,
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    HistoryManager { inner }.push_committed();
                }
            },
        );
        *self.inner.commits.lock() = Some(subscription);
        tracing::debug!(sequence = entry.sequence, "History baseline captured");
        Some(entry)
    }

    pub fn default_state(&self) -> Option<HistoryEntry> {
        self.inner.baseline.lock().clone()
    }

    fn push_committed(&self) {
        let entry = self.snapshot();
        let mut last = self.inner.last.lock();
        if last.as_ref().is_some_and(|l| l.same_values(&entry)) {
            return;
        }
        tracing::debug!(sequence = entry.sequence, "History entry pushed");
        self.inner.navigation.push_state(entry.clone());
        *last = Some(entry);
    }

    pub fn undo_state(&self) -> UndoState {
        self.inner.navigation.undo_state()
    }

    /// Step back one entry and restore it. On failure the navigation stack
    /// is moved forward again.
    pub async fn undo(&self) -> Result<bool, StateError> {
        let Some(entry) = self.inner.navigation.back() else {
            return Ok(false);
        };
        if let Err(e) = self.restore_history_state_from_entry(&entry).await {
            self.inner.navigation.forward();
            return Err(e);
        }
        Ok(true)
    }

    pub async fn redo(&self) -> Result<bool, StateError> {
        let Some(entry) = self.inner.navigation.forward() else {
            return Ok(false);
        };
        if let Err(e) = self.restore_history_state_from_entry(&entry).await {
            self.inner.navigation.back();
            return Err(e);
        }
        Ok(true)
    }

    /// Restore every namespace referenced by `entry`. Each session is sent
    /// the entry's values in turn; local state changes only after all of
    /// them succeeded. Editing stays disabled until then.
    pub async fn restore_history_state_from_entry(
        &self,
        entry: &HistoryEntry,
    ) -> Result<(), StateError> {
        let namespaces: Vec<String> = entry.per_namespace.keys().cloned().collect();
        let ticket = self.inner.parameters.begin_restore(&namespaces)?;
        tracing::debug!(sequence = entry.sequence, namespaces = ticket.sessions.len(), "Restoring history entry");

        let mut restored: Vec<&str> = Vec::new();
        for (namespace, session) in &ticket.sessions {
            let Some(values) = entry.per_namespace.get(namespace) else {
                continue;
            };
            let result = self
                .inner
                .parameters
                .customize(namespace, session.as_ref(), values.clone())
                .await;
            if !self.inner.parameters.ticket_is_current(&ticket) {
                self.inner.parameters.end_restore(&ticket, None)?;
                tracing::warn!(sequence = entry.sequence, "History restore superseded");
                return Err(StateError::Superseded {
                    namespace: namespace.clone(),
                });
            }
            match result {
                Ok(()) => restored.push(namespace),
                Err(e) => {
                    self.roll_back(&ticket, &restored).await;
                    self.inner.parameters.end_restore(&ticket, None)?;
                    tracing::warn!(namespace = %namespace, error = %e, "History restore failed");
                    return Err(StateError::Restore {
                        namespace: namespace.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.inner
            .parameters
            .end_restore(&ticket, Some(&entry.per_namespace))?;
        *self.inner.last.lock() = Some(HistoryEntry {
            sequence: entry.sequence,
            per_namespace: self.inner.parameters.snapshot(),
            timestamp: entry.timestamp,
        });
        tracing::info!(sequence = entry.sequence, "History entry restored");
        Ok(())
    }

    /// Send the pre-restore values back to sessions that already took the
    /// entry's values. Best effort.
    async fn roll_back(&self, ticket: &RestoreTicket, restored: &[&str]) {
        for namespace in restored {
            let (Some(session), Some(previous)) = (
                ticket.sessions.get(*namespace),
                ticket.previous.get(*namespace),
            ) else {
                continue;
            };
            if let Err(e) = self
                .inner
                .parameters
                .customize(namespace, session.as_ref(), previous.clone())
                .await
            {
                tracing::warn!(namespace = %namespace, error = %e, "Rollback of restored namespace failed");
            }
        }
    }

    /// Store the executed values of `namespace` as a model state and reflect
    /// its id into the URL.
    pub async fn create_model_state(&self, namespace: &str) -> Result<String, StateError> {
        let session = self
            .inner
            .parameters
            .session(namespace)
            .ok_or_else(|| StateError::not_found(format!("Namespace {namespace}")))?;
        let values = self
            .inner
            .parameters
            .executed_values(namespace)
            .unwrap_or_default();
        let id = session
            .create_model_state(values)
            .await
            .map_err(|e| StateError::session(namespace, &e))?;
        self.inner
            .navigation
            .set_query_param(&self.inner.query_param, Some(&id));
        tracing::info!(namespace = %namespace, model_state = %id, "Model state created");
        Ok(id)
    }

    /// Apply the model state named in the URL, if any. The first namespace
    /// whose session knows the id provides the values. The resulting state
    /// replaces the current navigation entry.
    pub async fn import_model_state_from_url(&self) -> Result<Option<HistoryEntry>, StateError> {
        let Some(id) = self.inner.navigation.query_param(&self.inner.query_param) else {
            return Ok(None);
        };
        let mut found: Option<(String, NamespaceValues)> = None;
        for namespace in self.inner.parameters.namespaces() {
            let Some(session) = self.inner.parameters.session(&namespace) else {
                continue;
            };
            match session.load_model_state(&id).await {
                Ok(values) => {
                    found = Some((namespace, values));
                    break;
                }
                Err(e) => {
                    tracing::debug!(namespace = %namespace, error = %e, "Model state not in namespace");
                }
            }
        }
        let (namespace, values) =
            found.ok_or_else(|| StateError::not_found(format!("Model state {id}")))?;

        let mut per_namespace = BTreeMap::new();
        per_namespace.insert(namespace, values);
        let import = HistoryEntry::new(self.inner.sequence.fetch_add(1, Ordering::Relaxed), per_namespace);
        self.restore_history_state_from_entry(&import).await?;

        let entry = self.snapshot();
        self.inner.navigation.replace_state(entry.clone());
        *self.inner.last.lock() = Some(entry.clone());
        tracing::info!(model_state = %id, "Model state imported");
        Ok(Some(entry))
    }

    /// Stop recording and clear the navigation stack.
    pub fn reset(&self) {
        if let Some(subscription) = self.inner.commits.lock().take() {
            subscription.unsubscribe();
        }
        self.inner.navigation.reset();
        *self.inner.last.lock() = None;
        *self.inner.baseline.lock() = None;
        self.inner.loaded.store(false, Ordering::SeqCst);
    }
}
