//! Shared state for API handlers.

use std::sync::Arc;

use crate::bridge::ChatBridge;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<ChatBridge>,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(bridge: Arc<ChatBridge>) -> Self {
        Self {
            bridge,
            cors_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Arc::new(origins);
        self
    }
}
