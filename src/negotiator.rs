//! Peer-connection negotiation: candidate gathering, offer/answer exchange,
//! connection-state monitoring, ICE-restart-on-failure, and the overall
//! connect timeout.
//!
//! One `PeerNegotiator` per session. The sender creates the data channel
//! and the offer; the receiver answers. Gathering only starts once a local
//! description is set, so each description is set first and relayed after
//! the gathering-complete wait, carrying the gathered candidates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{data_channel_init, DATA_CHANNEL_LABEL};
use crate::error::{EngineError, Result};
use crate::protocol::{IceCandidatePayload, PeerRole, SessionDescription};
use crate::signaling::SignalingClient;

/// Give up on ICE gathering after this long and proceed with whatever
/// candidates exist; latency is preferred over a complete candidate set.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall budget for reaching `connected`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a transient `disconnected` may last before it counts as failed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Pre-gathered candidate pool so initial candidates are ready before the
/// offer goes out.
const CANDIDATE_POOL_SIZE: u8 = 10;

/// High-level outcomes of the monitored connection lifecycle.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    Connected,
    TimedOut,
    Failed(String),
    Closed,
}

/// Owns the peer connection for one session.
pub struct PeerNegotiator {
    pc: Arc<RTCPeerConnection>,
    role: PeerRole,
    room: String,
    signaling: Arc<SignalingClient>,
    state_rx: Mutex<Option<mpsc::Receiver<RTCPeerConnectionState>>>,
    candidate_rx: Mutex<Option<mpsc::Receiver<RTCIceCandidate>>>,
    incoming_channel_rx: Mutex<Option<mpsc::Receiver<Arc<RTCDataChannel>>>>,
    ice_restarted: AtomicBool,
}

impl PeerNegotiator {
    /// Allocate one peer connection configured with the current ICE server
    /// set, candidate bundling, and a pre-gather pool.
    pub async fn create_session(
        role: PeerRole,
        room: &str,
        signaling: Arc<SignalingClient>,
    ) -> Result<Self> {
        let config = RTCConfiguration {
            ice_servers: signaling.cache().ice_servers().to_rtc(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ice_candidate_pool_size: CANDIDATE_POOL_SIZE,
            ..Default::default()
        };
        Self::with_config(role, room, signaling, config).await
    }

    async fn with_config(
        role: PeerRole,
        room: &str,
        signaling: Arc<SignalingClient>,
        config: RTCConfiguration,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (state_tx, state_rx) = mpsc::channel(16);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let _ = state_tx.send(state).await;
            })
        }));

        let (candidate_tx, candidate_rx) = mpsc::channel(50);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let _ = candidate_tx.send(candidate).await;
                }
            })
        }));

        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        pc.on_data_channel(Box::new(move |dc| {
            let incoming_tx = incoming_tx.clone();
            debug!(label = dc.label(), "incoming data channel");
            Box::pin(async move {
                let _ = incoming_tx.send(dc).await;
            })
        }));

        Ok(Self {
            pc,
            role,
            room: room.to_string(),
            signaling,
            state_rx: Mutex::new(Some(state_rx)),
            candidate_rx: Mutex::new(Some(candidate_rx)),
            incoming_channel_rx: Mutex::new(Some(incoming_rx)),
            ice_restarted: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// The sender negotiates the one reliable ordered channel.
    pub async fn create_data_channel(&self) -> Result<Arc<RTCDataChannel>> {
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(data_channel_init()))
            .await?;
        Ok(dc)
    }

    /// The receiver side's channel arrives through the connection.
    pub async fn take_incoming_channel_rx(&self) -> Option<mpsc::Receiver<Arc<RTCDataChannel>>> {
        self.incoming_channel_rx.lock().await.take()
    }

    /// Set a local description and wait for ICE gathering to complete (or
    /// for the gather timeout). Gathering only starts once the description
    /// is set, so the promise is obtained first, then the set, then the
    /// wait. Returns the description as it stands after gathering, with
    /// whatever candidates were collected.
    async fn gathered_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let mut done = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await?;
        if timeout(ICE_GATHER_TIMEOUT, done.recv()).await.is_err() {
            warn!(
                timeout_s = ICE_GATHER_TIMEOUT.as_secs(),
                "ice gathering incomplete, proceeding with partial candidates"
            );
        }
        self.pc.local_description().await.ok_or_else(|| {
            EngineError::ConnectionFailed("local description missing after gathering".to_string())
        })
    }

    /// Produce the local offer, set it, wait out candidate gathering, and
    /// relay the candidate-bearing SDP.
    pub async fn create_offer_and_send(&self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        let local = self.gathered_local_description(offer).await?;
        self.signaling
            .send_offer(
                &self.room,
                SessionDescription {
                    sdp: local.sdp,
                    sdp_type: "offer".to_string(),
                },
            )
            .await?;
        info!(room = %self.room, "sent offer");
        Ok(())
    }

    /// Apply the remote offer, then produce and set the answer, wait out
    /// candidate gathering, and relay the candidate-bearing SDP.
    pub async fn create_answer_and_send(&self, remote_offer: SessionDescription) -> Result<()> {
        self.apply_remote_description("offer", remote_offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let local = self.gathered_local_description(answer).await?;
        self.signaling
            .send_answer(
                &self.room,
                SessionDescription {
                    sdp: local.sdp,
                    sdp_type: "answer".to_string(),
                },
            )
            .await?;
        info!(room = %self.room, "sent answer");
        Ok(())
    }

    /// Set a remote offer or answer. Failures surface as
    /// `SignalingMessage`, which is not fatal to the session.
    pub async fn apply_remote_description(
        &self,
        kind: &str,
        desc: SessionDescription,
    ) -> Result<()> {
        let parsed = match kind {
            "offer" => RTCSessionDescription::offer(desc.sdp),
            "answer" => RTCSessionDescription::answer(desc.sdp),
            other => {
                return Err(EngineError::SignalingMessage(format!(
                    "unexpected description kind: {other}"
                )))
            }
        }
        .map_err(|e| EngineError::SignalingMessage(e.to_string()))?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| EngineError::SignalingMessage(e.to_string()))
    }

    /// Best-effort candidate add; one bad candidate must not abort
    /// negotiation.
    pub async fn add_remote_candidate(&self, candidate: IceCandidatePayload) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            let err = EngineError::IceCandidate(e.to_string());
            warn!(error = %err, "ignoring rejected remote candidate");
        }
    }

    /// Forward locally gathered candidates to the relay until gathering
    /// ends. Spawned once per session.
    pub async fn spawn_candidate_forwarder(self: &Arc<Self>) {
        let mut rx = match self.candidate_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                let payload = match candidate.to_json() {
                    Ok(json) => IceCandidatePayload {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_m_line_index: json.sdp_mline_index,
                    },
                    Err(e) => {
                        warn!(error = %e, "skipping unserializable local candidate");
                        continue;
                    }
                };
                if let Err(e) = this.signaling.send_candidate(&this.room, payload).await {
                    debug!(error = %e, "could not relay local candidate");
                }
            }
        });
    }

    /// One ICE restart: a fresh offer with the restart flag. Allowed once
    /// per session, after `failed`.
    async fn restart_ice(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await?;
        let local = self.gathered_local_description(offer).await?;
        self.signaling
            .send_offer(
                &self.room,
                SessionDescription {
                    sdp: local.sdp,
                    sdp_type: "offer".to_string(),
                },
            )
            .await?;
        info!(room = %self.room, "sent ice-restart offer");
        Ok(())
    }

    /// Watch connection-state changes and reduce them to high-level
    /// outcomes:
    ///
    /// - `connected` cancels the overall connect timer
    /// - `disconnected` gets a short grace period for spontaneous recovery
    /// - the first `failed` triggers exactly one ICE restart, the second is
    ///   fatal
    /// - never reaching `connected` inside the budget times the session out
    pub async fn spawn_monitor(self: &Arc<Self>) -> mpsc::Receiver<NegotiationEvent> {
        let (event_tx, event_rx) = mpsc::channel(8);
        let mut state_rx = match self.state_rx.lock().await.take() {
            Some(rx) => rx,
            None => return event_rx,
        };
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let connect_deadline = Instant::now() + CONNECT_TIMEOUT;
            let mut connected_once = false;
            let mut grace_deadline: Option<Instant> = None;

            loop {
                let grace_sleep = async move {
                    match grace_deadline {
                        Some(deadline) => {
                            sleep(deadline.saturating_duration_since(Instant::now())).await
                        }
                        None => std::future::pending().await,
                    }
                };
                let connect_sleep = async move {
                    if connected_once {
                        std::future::pending().await
                    } else {
                        sleep(connect_deadline.saturating_duration_since(Instant::now())).await
                    }
                };

                tokio::select! {
                    _ = connect_sleep => {
                        warn!("connection not established within budget");
                        let _ = event_tx.send(NegotiationEvent::TimedOut).await;
                        break;
                    }
                    _ = grace_sleep => {
                        grace_deadline = None;
                        if this.pc.connection_state() == RTCPeerConnectionState::Disconnected {
                            if let Some(event) = this.handle_failure().await {
                                let _ = event_tx.send(event).await;
                                break;
                            }
                        }
                    }
                    state = state_rx.recv() => {
                        let Some(state) = state else { break };
                        debug!(?state, "peer connection state");
                        match state {
                            RTCPeerConnectionState::Connected => {
                                connected_once = true;
                                grace_deadline = None;
                                let _ = event_tx.send(NegotiationEvent::Connected).await;
                            }
                            RTCPeerConnectionState::Disconnected => {
                                grace_deadline = Some(Instant::now() + DISCONNECT_GRACE);
                            }
                            RTCPeerConnectionState::Failed => {
                                grace_deadline = None;
                                if let Some(event) = this.handle_failure().await {
                                    let _ = event_tx.send(event).await;
                                    break;
                                }
                            }
                            RTCPeerConnectionState::Closed => {
                                let _ = event_tx.send(NegotiationEvent::Closed).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        event_rx
    }

    /// Returns the terminal event to emit, or None if monitoring should
    /// continue through an ICE restart. Only the sender (the offerer)
    /// issues the restart offer; a receiver restart offer would collide
    /// with the sender's and both sides already answer sender offers. The
    /// receiver's first failure therefore just waits for the restart
    /// offer to arrive over signaling.
    async fn handle_failure(&self) -> Option<NegotiationEvent> {
        if self.ice_restarted.swap(true, Ordering::SeqCst) {
            return Some(NegotiationEvent::Failed(
                "connection failed after ice restart".to_string(),
            ));
        }
        match self.role {
            PeerRole::Sender => {
                warn!("connection failed, attempting one ice restart");
                match self.restart_ice().await {
                    Ok(()) => None,
                    Err(e) => Some(NegotiationEvent::Failed(format!("ice restart failed: {e}"))),
                }
            }
            PeerRole::Receiver => {
                warn!("connection failed, waiting for the sender's ice restart");
                None
            }
        }
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

impl NegotiationEvent {
    /// The fatal error this outcome maps to, if any.
    pub fn into_error(self) -> Option<EngineError> {
        match self {
            NegotiationEvent::Connected | NegotiationEvent::Closed => None,
            NegotiationEvent::TimedOut => Some(EngineError::ConnectionTimeout(CONNECT_TIMEOUT)),
            NegotiationEvent::Failed(reason) => Some(EngineError::ConnectionFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn offline_negotiator(role: PeerRole) -> PeerNegotiator {
        let signaling = Arc::new(SignalingClient::new());
        PeerNegotiator::with_config(role, "AB23CD45", signaling, RTCConfiguration::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn gathering_completes_once_local_description_is_set() {
        let negotiator = offline_negotiator(PeerRole::Sender).await;
        let _dc = negotiator.create_data_channel().await.unwrap();
        let offer = negotiator.pc.create_offer(None).await.unwrap();

        let started = Instant::now();
        let local = negotiator.gathered_local_description(offer).await.unwrap();
        assert!(
            started.elapsed() < ICE_GATHER_TIMEOUT,
            "host-only gathering should finish well inside the cap"
        );
        assert!(!local.sdp.is_empty());
        assert!(negotiator.pc.local_description().await.is_some());
        negotiator.close().await.unwrap();
    }

    #[tokio::test]
    async fn receiver_defers_ice_restart_to_the_offerer() {
        let negotiator = offline_negotiator(PeerRole::Receiver).await;
        assert!(negotiator.handle_failure().await.is_none());
        match negotiator.handle_failure().await {
            Some(NegotiationEvent::Failed(_)) => {}
            other => panic!("second failure should be terminal, got {other:?}"),
        }
        negotiator.close().await.unwrap();
    }
}
