//! The viewer collaborator: viewports with token-guarded flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FlagKind {
    /// Show a busy indicator.
    Busy,
    /// Hold back scene-tree updates until released.
    SuspendSceneUpdates,
}

/// Identity of one acquired flag. Only the holder may release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagToken(pub String);

impl FlagToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for FlagToken {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Viewport: Send + Sync {
    fn id(&self) -> String;
    fn add_flag(&self, flag: FlagKind) -> FlagToken;
    /// Release one token. Returns false for unknown or already released tokens.
    fn remove_flag(&self, token: &FlagToken) -> bool;
    fn render(&self);
}

/// Token-guarded flag bookkeeping. A flag kind is set while at least one
/// token of that kind is outstanding.
#[derive(Debug, Default)]
pub struct FlagSet {
    tokens: HashMap<FlagToken, FlagKind>,
}

impl FlagSet {
    pub fn add(&mut self, kind: FlagKind) -> FlagToken {
        let token = FlagToken::new();
        self.tokens.insert(token.clone(), kind);
        token
    }

    pub fn remove(&mut self, token: &FlagToken) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn is_set(&self, kind: FlagKind) -> bool {
        self.tokens.values().any(|k| *k == kind)
    }

    pub fn count(&self, kind: FlagKind) -> usize {
        self.tokens.values().filter(|k| **k == kind).count()
    }
}

/// Headless viewport that only records flags and render requests.
pub struct MemoryViewport {
    id: String,
    flags: Mutex<FlagSet>,
    released: Mutex<Vec<FlagToken>>,
    renders: AtomicUsize,
}

impl MemoryViewport {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            flags: Mutex::new(FlagSet::default()),
            released: Mutex::new(Vec::new()),
            renders: AtomicUsize::new(0),
        }
    }

    pub fn is_flag_set(&self, kind: FlagKind) -> bool {
        self.flags.lock().is_set(kind)
    }

    pub fn flag_count(&self, kind: FlagKind) -> usize {
        self.flags.lock().count(kind)
    }

    /// Every token released so far, in release order.
    pub fn released_tokens(&self) -> Vec<FlagToken> {
        self.released.lock().clone()
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl Viewport for MemoryViewport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn add_flag(&self, flag: FlagKind) -> FlagToken {
        self.flags.lock().add(flag)
    }

    fn remove_flag(&self, token: &FlagToken) -> bool {
        let removed = self.flags.lock().remove(token);
        if removed {
            self.released.lock().push(token.clone());
        }
        removed
    }

    fn render(&self) {
        self.renders.fetch_add(1, Ordering::SeqCst);
    }
}

struct RegisteredViewport {
    viewport: Arc<dyn Viewport>,
    controller_session_id: Option<String>,
}

/// Application-scoped set of live viewports.
#[derive(Clone, Default)]
pub struct ViewportRegistry {
    viewports: Arc<Mutex<IndexMap<String, RegisteredViewport>>>,
}

impl ViewportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `viewport`, optionally bound to the controller session it displays.
    pub fn register(&self, viewport: Arc<dyn Viewport>, controller_session_id: Option<&str>) {
        let id = viewport.id();
        self.viewports.lock().insert(
            id,
            RegisteredViewport {
                viewport,
                controller_session_id: controller_session_id.map(ToString::to_string),
            },
        );
    }

    pub fn unregister(&self, viewport_id: &str) -> Option<Arc<dyn Viewport>> {
        self.viewports
            .lock()
            .shift_remove(viewport_id)
            .map(|r| r.viewport)
    }

    pub fn get(&self, viewport_id: &str) -> Option<Arc<dyn Viewport>> {
        self.viewports
            .lock()
            .get(viewport_id)
            .map(|r| Arc::clone(&r.viewport))
    }

    /// Viewports bound to `controller_session_id`, or every registered
    /// viewport when none is bound to it.
    pub fn for_session(&self, controller_session_id: &str) -> Vec<Arc<dyn Viewport>> {
        let viewports = self.viewports.lock();
        let bound: Vec<Arc<dyn Viewport>> = viewports
            .values()
            .filter(|r| r.controller_session_id.as_deref() == Some(controller_session_id))
            .map(|r| Arc::clone(&r.viewport))
            .collect();
        if bound.is_empty() {
            viewports.values().map(|r| Arc::clone(&r.viewport)).collect()
        } else {
            bound
        }
    }

    pub fn clear(&self) {
        self.viewports.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn flag_stays_set_until_last_token_released() {
        let viewport = MemoryViewport::new("vp");
        let t1 = viewport.add_flag(FlagKind::Busy);
        let t2 = viewport.add_flag(FlagKind::Busy);
        assert_eq!(viewport.flag_count(FlagKind::Busy), 2);

        assert!(viewport.remove_flag(&t1));
        assert!(viewport.is_flag_set(FlagKind::Busy));
        assert!(!viewport.remove_flag(&t1));
        assert!(viewport.remove_flag(&t2));
        assert!(!viewport.is_flag_set(FlagKind::Busy));
        assert_eq!(viewport.released_tokens(), vec![t1, t2]);
    }

    #[test]
    fn registry_falls_back_to_all_viewports() {
        let registry = ViewportRegistry::new();
        registry.register(Arc::new(MemoryViewport::new("a")), Some("s1"));
        registry.register(Arc::new(MemoryViewport::new("b")), None);

        let bound: Vec<String> = registry.for_session("s1").iter().map(|v| v.id()).collect();
        assert_eq!(bound, vec!["a".to_string()]);

        let fallback: Vec<String> = registry.for_session("s2").iter().map(|v| v.id()).collect();
        assert_eq!(fallback, vec!["a".to_string(), "b".to_string()]);

        assert!(registry.unregister("a").is_some());
        assert!(registry.get("a").is_none());
    }
}
