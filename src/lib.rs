//! State coordination for a 3D model configurator.
//!
//! Parameters of every loaded session, accept/reject commits, undo/redo over
//! the host's navigation history, mutual exclusion of viewport interactions,
//! and progress tracking of scene-update processes. [`ConfiguratorCore`]
//! wires them together.

pub mod commit;
pub mod configurator;
pub mod error;
pub mod history;
pub mod interaction;
pub mod model;
pub mod parameters;
pub mod process;
pub mod session;
pub mod settings;
pub mod store;
pub mod viewport;

pub use configurator::ConfiguratorCore;
pub use error::{SessionError, StateError};
