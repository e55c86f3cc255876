//! Manager facade: the single entry point tying every component together.
//!
//! Split into focused submodules:
//! - `core`: Manager struct, constructor, introspection and operator controls
//! - `submit`: the `submit` path and caller-side timeout handling
//! - `dispatch`: the supervised dispatch loop draining the priority queue
//! - `lifecycle`: explicit start/stop and the periodic cleanup loop

mod core;
mod dispatch;
mod lifecycle;
mod submit;

pub use self::core::{CleanupReport, Manager, ManagerStats};
