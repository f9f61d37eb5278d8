//! Shared application state.

use std::sync::Arc;

use crate::job::{JobContext, JobController};

/// State handed to every request handler.
pub struct AppState {
    pub jobs: JobController,
}

impl AppState {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            jobs: JobController::new(Arc::new(ctx)),
        }
    }
}
