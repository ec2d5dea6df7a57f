use crate::call::CallSession;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The call this process drives
    pub call: Arc<CallSession>,
}

impl AppState {
    pub fn new(call: Arc<CallSession>) -> Self {
        Self { call }
    }
}
