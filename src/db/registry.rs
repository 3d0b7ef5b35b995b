//! Process-wide engine slot.
//!
//! Code that cannot thread an [`Engine`] handle through its call graph can
//! install one here and fetch it later. The slot is explicit and resettable;
//! nothing in this crate reads it implicitly.

use crate::db::engine::Engine;
use crate::error::{DbError, DbResult};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

static ENGINE: Lazy<RwLock<Option<Arc<Engine>>>> = Lazy::new(|| RwLock::new(None));

/// Install `engine` as the process-wide engine, returning the previous one.
pub fn install(engine: Arc<Engine>) -> Option<Arc<Engine>> {
    info!(engine_id = engine.id(), "Installing process-wide engine");
    ENGINE.write().replace(engine)
}

/// Get the process-wide engine.
pub fn get() -> DbResult<Arc<Engine>> {
    ENGINE.read().clone().ok_or_else(|| {
        DbError::not_configured("call registry::install() before registry::get()")
    })
}

/// Check whether an engine is installed.
pub fn is_installed() -> bool {
    ENGINE.read().is_some()
}

/// Clear the slot, returning the engine that was installed.
///
/// The returned engine is not disposed; that stays the caller's decision.
pub fn reset() -> Option<Arc<Engine>> {
    ENGINE.write().take()
}
