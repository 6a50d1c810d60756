//! Ошибки сигналинга, захвата медиа и установки звонка.

use thiserror::Error;

/// Ошибки хранилища документов, через которое идёт сигналинг
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Причина, по которой локальный поток не получен
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("media capture is not supported on this platform")]
    Unsupported,

    #[error("media permission denied")]
    PermissionDenied,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling unavailable: {0}")]
    Signaling(#[from] StoreError),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("malformed room {room_id}: {reason}")]
    MalformedRoom { room_id: String, reason: String },

    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no active call")]
    NoActiveCall,

    #[error("a call is already in progress")]
    CallInProgress,
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
