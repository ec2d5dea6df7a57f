use super::state::AppState;
use crate::call::SavedRecording;
use crate::error::{CallError, NegotiationError, RecordingError, TransportError};
use crate::media::{MediaState, TrackKind};
use crate::recording::RecordingInfo;
use crate::signaling::{Room, SendOutcome};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub interview_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub acknowledged: bool,
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub kind: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub kind: TrackKind,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct MediaResponse {
    /// False when a device could not be acquired; the previous track stays
    pub applied: bool,
    pub media: MediaState,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `CallError` rendered as a JSON error body
pub struct ApiError(CallError);

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CallError::NotJoined => StatusCode::NOT_FOUND,
            CallError::Recording(RecordingError::InvalidState { .. })
            | CallError::Negotiation(NegotiationError::InvalidState { .. })
            | CallError::Negotiation(NegotiationError::WrongRole { .. })
            | CallError::Transport(TransportError::AlreadyInRoom(_))
            | CallError::Transport(TransportError::NotInRoom(_)) => StatusCode::CONFLICT,
            CallError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /call/status
pub async fn call_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.call.status())
}

/// POST /call/join
pub async fn join_call(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<Room> {
    info!("Joining room {} for interview {}", req.room_id, req.interview_id);
    let room = state.call.join(&req.room_id, &req.interview_id).await?;
    Ok(Json(room))
}

/// POST /call/leave
/// Always succeeds, also when no call is active
pub async fn leave_call(State(state): State<AppState>) -> impl IntoResponse {
    state.call.leave().await;
    StatusCode::NO_CONTENT
}

/// POST /call/chat
pub async fn send_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let outcome = state.call.send_chat(&req.text).await?;
    let response = match outcome {
        SendOutcome::Acknowledged(ack) => ChatResponse {
            acknowledged: true,
            message_id: Some(ack.message_id),
        },
        SendOutcome::Sent => ChatResponse {
            acknowledged: false,
            message_id: None,
        },
    };
    Ok(Json(response))
}

/// POST /call/media/toggle
pub async fn toggle_media(
    State(state): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> Json<MediaResponse> {
    let applied = state.call.toggle(req.kind, req.enabled).await;
    Json(MediaResponse {
        applied,
        media: state.call.devices().media_state(),
    })
}

/// POST /call/media/switch
pub async fn switch_device(
    State(state): State<AppState>,
    Json(req): Json<SwitchRequest>,
) -> Json<MediaResponse> {
    let applied = state.call.switch_device(req.kind, &req.device_id).await;
    Json(MediaResponse {
        applied,
        media: state.call.devices().media_state(),
    })
}

/// POST /call/recording/start
pub async fn start_recording(State(state): State<AppState>) -> ApiResult<RecordingInfo> {
    Ok(Json(state.call.start_recording().await?))
}

/// POST /call/recording/pause
pub async fn pause_recording(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.call.pause_recording().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /call/recording/resume
pub async fn resume_recording(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.call.resume_recording().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /call/recording/stop
pub async fn stop_recording(State(state): State<AppState>) -> ApiResult<SavedRecording> {
    Ok(Json(state.call.stop_recording().await?))
}
