//! Interaction request arbiter.
//!
//! Each viewport has at most one *active* request (exclusive, e.g. dragging
//! or selecting) and a list of *passive* requests (best effort, e.g. hover
//! highlighting). An active request suspends every passive one. Among the
//! passive requests only the head of the list is enabled; the list is kept
//! newest first, so removing the head hands control back to the request that
//! held it before. While an active request holds the viewport, removing a
//! passive request enables nothing; the passive head is enabled when the
//! active request goes away.
//!
//! All operations are synchronous. Handler callbacks run after the internal
//! lock is released, in the order the transitions happened, so a handler may
//! call back into the arbiter.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum InteractionKind {
    Active,
    Passive,
}

/// Callbacks through which the arbiter switches an interaction mode off and on.
pub trait InteractionHandler: Send + Sync {
    /// Leave the interactive mode. Does not cancel outstanding work.
    fn disable(&self);

    fn enable(&self) {}
}

pub struct InteractionRequest {
    pub kind: InteractionKind,
    pub viewport_id: String,
    pub handler: Arc<dyn InteractionHandler>,
}

impl InteractionRequest {
    pub fn active(viewport_id: &str, handler: Arc<dyn InteractionHandler>) -> Self {
        Self {
            kind: InteractionKind::Active,
            viewport_id: viewport_id.to_string(),
            handler,
        }
    }

    pub fn passive(viewport_id: &str, handler: Arc<dyn InteractionHandler>) -> Self {
        Self {
            kind: InteractionKind::Passive,
            viewport_id: viewport_id.to_string(),
            handler,
        }
    }
}

/// The only externally visible identity of a registered request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionToken(pub String);

struct RegisteredRequest {
    token: InteractionToken,
    handler: Arc<dyn InteractionHandler>,
}

#[derive(Default)]
struct ViewportRequests {
    active: Option<RegisteredRequest>,
    passive: Vec<RegisteredRequest>,
}

enum Transition {
    Disable(Arc<dyn InteractionHandler>),
    Enable(Arc<dyn InteractionHandler>),
}

impl Transition {
    fn run(self) {
        match self {
            Transition::Disable(h) => h.disable(),
            Transition::Enable(h) => h.enable(),
        }
    }
}

#[derive(Clone, Default)]
pub struct InteractionArbiter {
    viewports: Arc<Mutex<IndexMap<String, ViewportRequests>>>,
}

impl InteractionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interaction_request(&self, request: InteractionRequest) -> InteractionToken {
        let token = InteractionToken(uuid::Uuid::new_v4().to_string());
        let mut transitions = Vec::new();
        {
            let mut viewports = self.viewports.lock();
            let entry = viewports.entry(request.viewport_id.clone()).or_default();
            let registered = RegisteredRequest {
                token: token.clone(),
                handler: Arc::clone(&request.handler),
            };
            match request.kind {
                InteractionKind::Active => {
                    if let Some(previous) = entry.active.take() {
                        transitions.push(Transition::Disable(previous.handler));
                    }
                    for passive in &entry.passive {
                        transitions.push(Transition::Disable(Arc::clone(&passive.handler)));
                    }
                    entry.active = Some(registered);
                }
                InteractionKind::Passive => {
                    if entry.active.is_some() {
                        transitions.push(Transition::Disable(Arc::clone(&request.handler)));
                    } else {
                        for passive in &entry.passive {
                            transitions.push(Transition::Disable(Arc::clone(&passive.handler)));
                        }
                    }
                    entry.passive.insert(0, registered);
                }
            }
        }
        tracing::debug!(
            viewport = %request.viewport_id,
            kind = ?request.kind,
            token = %token.0,
            "Interaction request added"
        );
        for t in transitions {
            t.run();
        }
        token
    }

    /// Remove the request behind `token`. Returns false if it is unknown.
    pub fn remove_interaction_request(&self, token: &InteractionToken) -> bool {
        let mut transition = None;
        let mut found = false;
        {
            let mut viewports = self.viewports.lock();
            for (viewport_id, entry) in viewports.iter_mut() {
                if entry.active.as_ref().is_some_and(|a| &a.token == token) {
                    entry.active = None;
                    if let Some(head) = entry.passive.first() {
                        transition = Some(Transition::Enable(Arc::clone(&head.handler)));
                    }
                    found = true;
                } else if let Some(pos) = entry.passive.iter().position(|p| &p.token == token) {
                    entry.passive.remove(pos);
                    // The head is re-enabled even if it already was.
                    if entry.active.is_none() {
                        if let Some(head) = entry.passive.first() {
                            transition = Some(Transition::Enable(Arc::clone(&head.handler)));
                        }
                    }
                    found = true;
                }
                if found {
                    tracing::debug!(viewport = %viewport_id, token = %token.0, "Interaction request removed");
                    break;
                }
            }
            viewports.retain(|_, e| e.active.is_some() || !e.passive.is_empty());
        }
        if let Some(t) = transition {
            t.run();
        }
        found
    }

    pub fn active_request(&self, viewport_id: &str) -> Option<InteractionToken> {
        self.viewports
            .lock()
            .get(viewport_id)
            .and_then(|e| e.active.as_ref().map(|a| a.token.clone()))
    }

    /// Passive requests of a viewport, head (enabled candidate) first.
    pub fn passive_requests(&self, viewport_id: &str) -> Vec<InteractionToken> {
        self.viewports
            .lock()
            .get(viewport_id)
            .map(|e| e.passive.iter().map(|p| p.token.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the arbiter currently grants control to `token`.
    pub fn is_enabled(&self, token: &InteractionToken) -> bool {
        self.viewports.lock().values().any(|e| match &e.active {
            Some(active) => &active.token == token,
            None => e.passive.first().is_some_and(|p| &p.token == token),
        })
    }

    /// Drop every request of a viewport without calling any handler, for
    /// viewport teardown.
    pub fn clear_viewport(&self, viewport_id: &str) {
        self.viewports.lock().shift_remove(viewport_id);
    }

    pub fn clear(&self) {
        self.viewports.lock().clear();
    }
}
