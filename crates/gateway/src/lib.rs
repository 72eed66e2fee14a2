//! Thin HTTP surface over the Strand thread API.

pub mod api;
pub mod config;

use std::sync::Arc;

use strand_engine::Engine;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
