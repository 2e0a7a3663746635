//! The one reliable, ordered channel between the two peers.
//!
//! Two frame kinds share it: UTF-8 JSON control frames and raw binary
//! payload frames. The transport guarantees byte-order delivery only; flow
//! control is the sender engine's job, driven by the `buffered_amount`
//! gauge exposed here.
//!
//! `ReliableChannel` abstracts the browser data-channel primitives so the
//! transfer engine runs identically over a real `RTCDataChannel` or the
//! in-memory pair used in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{EngineError, Result};
use crate::protocol::ControlFrame;

/// Fixed label for the single negotiated channel.
pub const DATA_CHANNEL_LABEL: &str = "beamdrop-data";

/// Retransmit budget for the negotiated channel.
const MAX_RETRANSMITS: u16 = 30;

/// Channel init options used by the sender when negotiating the channel.
pub fn data_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        max_retransmits: Some(MAX_RETRANSMITS),
        ..Default::default()
    }
}

/// Events surfaced by a channel to whoever is driving the transfer.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Control(ControlFrame),
    Payload(Bytes),
    Closed,
    Error(String),
}

/// Ordered byte-stream send side with a buffered-amount gauge.
#[async_trait]
pub trait ReliableChannel: Send + Sync + 'static {
    /// Send one JSON control frame as a text message.
    async fn send_control(&self, frame: &ControlFrame) -> Result<()>;

    /// Send one raw payload frame.
    async fn send_payload(&self, data: Bytes) -> Result<()>;

    /// Bytes queued for send but not yet flushed, used for backpressure.
    async fn buffered_amount(&self) -> usize;

    /// Resolve once the buffered amount has drained to `threshold` bytes
    /// or fewer. Returns immediately when it is already there.
    async fn wait_buffered_below(&self, threshold: usize);

    async fn close(&self) -> Result<()>;
}

/// `ReliableChannel` backed by a WebRTC data channel.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    /// Wrap a data channel and wire its callbacks into `events`.
    ///
    /// Incoming text messages are parsed as control frames; a frame with an
    /// unknown `type` is logged and dropped, never surfaced as an error.
    /// Binary messages pass through as payload frames.
    pub fn attach(dc: Arc<RTCDataChannel>, events: mpsc::Sender<ChannelEvent>) -> Self {
        let tx = events.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Open).await;
            })
        }));

        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if msg.is_string {
                    match serde_json::from_slice::<ControlFrame>(&msg.data) {
                        Ok(frame) => {
                            let _ = tx.send(ChannelEvent::Control(frame)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping unparseable control frame");
                        }
                    }
                } else {
                    let _ = tx.send(ChannelEvent::Payload(msg.data)).await;
                }
            })
        }));

        let tx = events.clone();
        dc.on_error(Box::new(move |err| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Error(err.to_string())).await;
            })
        }));

        let tx = events;
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("data channel closed");
                let _ = tx.send(ChannelEvent::Closed).await;
            })
        }));

        Self { dc }
    }
}

#[async_trait]
impl ReliableChannel for RtcChannel {
    async fn send_control(&self, frame: &ControlFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.dc
            .send_text(json)
            .await
            .map_err(|e| EngineError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn send_payload(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map_err(|e| EngineError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_below(&self, threshold: usize) {
        if self.dc.buffered_amount().await <= threshold {
            return;
        }
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = std::sync::Mutex::new(Some(tx));
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                let fired = tx.lock().ok().and_then(|mut slot| slot.take());
                Box::pin(async move {
                    if let Some(fired) = fired {
                        let _ = fired.send(());
                    }
                })
            }))
            .await;
        // The buffer may have drained between the gauge read and the
        // handler registration; recheck so the wait cannot strand.
        if self.dc.buffered_amount().await <= threshold {
            return;
        }
        let _ = rx.await;
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| EngineError::Channel(e.to_string()))?;
        Ok(())
    }
}

pub mod memory {
    //! In-memory channel pair standing in for the WebRTC transport in
    //! tests, the way the wire would deliver frames: control frames go
    //! through a JSON round trip, payload frames as raw bytes.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// One end of an in-memory channel pair.
    pub struct MemoryChannel {
        peer_tx: mpsc::Sender<ChannelEvent>,
        buffered: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl MemoryChannel {
        /// Create a connected pair. Each side's receiver yields what the
        /// other side sends.
        pub fn pair() -> (
            (Arc<MemoryChannel>, mpsc::Receiver<ChannelEvent>),
            (Arc<MemoryChannel>, mpsc::Receiver<ChannelEvent>),
        ) {
            let (a_tx, a_rx) = mpsc::channel(256);
            let (b_tx, b_rx) = mpsc::channel(256);
            let a = Arc::new(MemoryChannel {
                peer_tx: b_tx,
                buffered: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            });
            let b = Arc::new(MemoryChannel {
                peer_tx: a_tx,
                buffered: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            });
            ((a, a_rx), (b, b_rx))
        }

        /// Pin the buffered-amount gauge, for backpressure tests.
        pub fn set_buffered_amount(&self, value: usize) {
            self.buffered.store(value, Ordering::SeqCst);
        }

        fn ensure_open(&self) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EngineError::Channel("channel closed".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ReliableChannel for MemoryChannel {
        async fn send_control(&self, frame: &ControlFrame) -> Result<()> {
            self.ensure_open()?;
            // Round-trip through JSON so wire-shape bugs show up in tests.
            let wire = serde_json::to_vec(frame)?;
            let frame: ControlFrame = serde_json::from_slice(&wire)?;
            self.peer_tx
                .send(ChannelEvent::Control(frame))
                .await
                .map_err(|_| EngineError::Channel("peer receiver dropped".into()))
        }

        async fn send_payload(&self, data: Bytes) -> Result<()> {
            self.ensure_open()?;
            self.peer_tx
                .send(ChannelEvent::Payload(data))
                .await
                .map_err(|_| EngineError::Channel("peer receiver dropped".into()))
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn wait_buffered_below(&self, threshold: usize) {
            while self.buffered.load(Ordering::SeqCst) > threshold {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.peer_tx.send(ChannelEvent::Closed).await;
            Ok(())
        }
    }
}
