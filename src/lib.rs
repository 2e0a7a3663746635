//! Peer-to-peer file transfer engine: WebRTC data channels negotiated
//! through a WebSocket signaling relay, with chunked streaming, adaptive
//! flow control, live progress, and cooperative cancellation.
//!
//! A [`session::Session`] owns one full transfer lifecycle end to end;
//! the lower layers are public for callers that want to compose them
//! differently.

pub mod channel;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod room;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod state;
pub mod transfer;

pub use channel::{ChannelEvent, ReliableChannel, RtcChannel};
pub use error::{EngineError, Result};
pub use protocol::{ControlFrame, FileDescriptor, PeerRole, TransferProgressRecord};
pub use room::{generate_room_code, is_valid_room_code, normalize_room_code};
pub use session::{Session, SessionConfig, SessionOutcome};
pub use settings::{AdaptiveTransferSettings, IceServerDescriptor, IceServerSet};
pub use state::{SessionStatus, StatusTracker};
pub use transfer::{OutgoingFile, ReceivedFile, ReceiverEngine, SenderEngine};
