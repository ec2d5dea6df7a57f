//! HTTP API for driving a call from a local UI
//!
//! - GET /health - Health check
//! - GET /call/status - Connection, negotiation, media and recording state
//! - POST /call/join, /call/leave - Enter or hang up a room
//! - POST /call/chat - Send an acknowledged chat message
//! - POST /call/media/toggle, /call/media/switch - Local devices
//! - POST /call/recording/{start,pause,resume,stop} - Recording control

mod handlers;
mod routes;
mod state;

pub use routes::{cors_layer, create_router};
pub use state::AppState;
