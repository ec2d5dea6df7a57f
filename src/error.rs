//! Error taxonomy for the call core
//!
//! Each component owns one error enum. Control calls return these directly;
//! failures that happen after a call has returned travel as events instead.

use std::time::Duration;
use thiserror::Error;

use crate::media::TrackKind;
use crate::negotiation::NegotiationState;
use crate::recording::RecordingState;
use crate::signaling::Role;

/// Signaling transport failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("relay rejected identity: {0}")]
    Auth(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("not joined to room {0}")]
    NotInRoom(String),

    #[error("already joined to room {0}")]
    AlreadyInRoom(String),

    #[error("no acknowledgment received within {0:?}")]
    AckTimeout(Duration),

    #[error("relay rejected request: {0}")]
    Rejected(String),

    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the supervisor should keep retrying after this failure.
    ///
    /// Auth rejections will not heal by waiting, everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Peer negotiation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },

    #[error("{operation} is not valid for the {role:?} role")]
    WrongRole { operation: &'static str, role: Role },

    #[error("session description failed: {0}")]
    Description(String),

    #[error("peer binding error: {0}")]
    Binding(String),

    #[error("peer connection is closed")]
    Closed,
}

/// Local capture device failures (never fatal to the call)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no {kind} device with id {device_id}")]
    NotFound { kind: TrackKind, device_id: String },

    #[error("failed to acquire {kind} track: {reason}")]
    Acquisition { kind: TrackKind, reason: String },

    #[error("failed to replace outbound {kind} track: {reason}")]
    Replace { kind: TrackKind, reason: String },
}

/// Media codec failures (a broken codec drops media, not the call)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to start {codec} codec: {reason}")]
    Start { codec: &'static str, reason: String },

    #[error("{codec} codec expected {expected}, got {actual}")]
    Format {
        codec: &'static str,
        expected: String,
        actual: String,
    },

    #[error("{codec} codec failed: {reason}")]
    Stream { codec: &'static str, reason: String },
}

/// Recording failures (never fatal to the call)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordingError {
    #[error("{operation} is not valid while recording is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RecordingState,
    },

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("artifact hand-off failed: {0}")]
    Sink(String),
}

/// Errors returned by the call-level facade
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("not joined to a room")]
    NotJoined,

    #[error("peer connection ended {0} times in a row without connecting")]
    RestartsExhausted(u32),
}
