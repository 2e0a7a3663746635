//! Error taxonomy for the transfer engine.
//!
//! Errors split into two groups: fatal errors finalize the session into the
//! `Error` status, recoverable ones are logged at the point of origin and the
//! session continues.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Relay unreachable after retries. Fatal only once retries are exhausted.
    #[error("signaling connect failed: {0}")]
    SignalingConnect(String),

    /// Malformed or unexpected relay payload. The session continues.
    #[error("signaling message error: {0}")]
    SignalingMessage(String),

    /// One bad ICE candidate. Dropped, never fatal to negotiation.
    #[error("ice candidate rejected: {0}")]
    IceCandidate(String),

    /// The peer connection never reached `connected` within the overall timer.
    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    /// The peer connection entered `failed` and an ICE restart did not help.
    #[error("peer connection failed: {0}")]
    ConnectionFailed(String),

    /// The send buffer never drained below the high-water mark. A stalled
    /// transport is unrecoverable, so this aborts the whole session.
    #[error("send buffer stalled above {high_water} bytes for file {file_index}")]
    BufferTimeout { high_water: usize, file_index: u32 },

    /// Transport-level error event on the data channel.
    #[error("data channel error: {0}")]
    Channel(String),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error must finalize the session into the `Error` status.
    ///
    /// Protocol-level anomalies (bad candidate, malformed relay payload) are
    /// recovered locally; transport and negotiation failures are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::SignalingMessage(_) | EngineError::IceCandidate(_)
        )
    }
}
