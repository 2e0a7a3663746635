//! Wire types for both planes:
//!
//! - control-plane JSON exchanged with the signaling relay
//!   (`ClientMessage` / `ServerMessage`)
//! - data-channel control frames exchanged between the two peers
//!   (`ControlFrame`)
//!
//! All shapes are camelCase/kebab-case JSON so either end of the transfer
//! can be a browser client.

use serde::{Deserialize, Serialize};

use crate::settings::{AdaptiveSettingsUpdate, IceServerDescriptor};

/// Which side of the transfer this peer is. Fixed for the session; the
/// sender owns the file list and drives transfer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Sender => write!(f, "sender"),
            PeerRole::Receiver => write!(f, "receiver"),
        }
    }
}

/// One file in the sender's declared queue. `file_index` is the position in
/// that queue and the sole correlation key between the two peers' state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    /// Unix millis of the source file's mtime.
    #[serde(default)]
    pub last_modified: u64,
    pub file_index: u32,
}

/// Live per-file progress, upserted (not appended) on each update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressRecord {
    pub file_index: u32,
    pub file_name: String,
    pub percent_complete: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_second: f64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<PeerRole>,
}

/// SDP description relayed through the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// One ICE candidate relayed through the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// Negotiation message kinds relayed between the two room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

// ============================================================================
// Signaling messages
// ============================================================================

/// Messages sent to the signaling relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<PeerRole>,
        #[serde(skip_serializing_if = "Option::is_none")]
        network_info: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        room_id: String,
        candidate: IceCandidatePayload,
    },
    #[serde(rename_all = "camelCase")]
    TransferStart { room_id: String },
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        room_id: String,
        file_index: u32,
        progress: f64,
        bytes_transferred: u64,
        total_bytes: u64,
        speed: f64,
        stage: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferComplete { room_id: String, total_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    TransferCancel {
        room_id: String,
        cancelled_by: PeerRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Messages received from the signaling relay. Unknown kinds deserialize to
/// `Unknown` so one unexpected push never kills the reader task.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    WebrtcOffer {
        offer: SessionDescription,
    },
    WebrtcAnswer {
        answer: SessionDescription,
    },
    WebrtcIceCandidate {
        candidate: IceCandidatePayload,
    },
    TurnServers {
        servers: Vec<IceServerDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    TurnServerSwitch {
        server: IceServerDescriptor,
        new_index: usize,
    },
    AdaptiveSettingsUpdate(AdaptiveSettingsUpdate),
    RoomFull,
    RoomBusy,
    RoomExpired,
    PeerJoined,
    PeerDisconnected,
    TransferStarted,
    #[serde(rename_all = "camelCase")]
    TransferCompleted {
        #[serde(default)]
        total_bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    TransferCancelled {
        #[serde(default)]
        cancelled_by: Option<PeerRole>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Data-channel control frames
// ============================================================================

/// JSON control frames multiplexed with binary payload frames on the one
/// reliable channel. Envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// The sender's full queue, sent once on channel open.
    FileList(Vec<FileDescriptor>),
    /// Declares the file the following payload frames belong to.
    FileMeta(FileDescriptor),
    /// Sender-measured progress mirrored to the receiver.
    ProgressSync(TransferProgressRecord),
    /// One file was cancelled; later files are unaffected.
    #[serde(rename_all = "camelCase")]
    FileCancelled {
        file_index: u32,
        file_name: String,
        cancelled_by: PeerRole,
    },
    /// The whole session was cancelled by one peer.
    #[serde(rename_all = "camelCase")]
    TransferCancelled { cancelled_by: PeerRole },
    /// All files sent; terminal for the session.
    TransferComplete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_envelope_shape() {
        let frame = ControlFrame::FileMeta(FileDescriptor {
            name: "photo.jpg".into(),
            size: 1024,
            mime_type: "image/jpeg".into(),
            last_modified: 1_700_000_000_000,
            file_index: 0,
        });
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "file-meta");
        assert_eq!(json["data"]["fileIndex"], 0);
        assert_eq!(json["data"]["mimeType"], "image/jpeg");
    }

    #[test]
    fn unit_control_frames_roundtrip() {
        let json = serde_json::to_string(&ControlFrame::TransferComplete).unwrap();
        let back: ControlFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ControlFrame::TransferComplete));
    }

    #[test]
    fn unknown_server_message_is_tolerated() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"brand-new-push","extra":42}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
    }

    #[test]
    fn join_room_wire_shape() {
        let msg = ClientMessage::JoinRoom {
            room_id: "AB12CD34".into(),
            role: Some(PeerRole::Sender),
            network_info: None,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["roomId"], "AB12CD34");
        assert_eq!(json["role"], "sender");
    }

    #[test]
    fn cancelled_frame_carries_role() {
        let json = serde_json::to_string(&ControlFrame::FileCancelled {
            file_index: 2,
            file_name: "big.iso".into(),
            cancelled_by: PeerRole::Receiver,
        })
        .unwrap();
        let back: ControlFrame = serde_json::from_str(&json).unwrap();
        match back {
            ControlFrame::FileCancelled {
                file_index,
                cancelled_by,
                ..
            } => {
                assert_eq!(file_index, 2);
                assert_eq!(cancelled_by, PeerRole::Receiver);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
