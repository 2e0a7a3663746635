//! WebSocket client for the signaling relay.
//!
//! The relay only carries negotiation messages and informational pushes,
//! never file content. One reader task feeds parsed `ServerMessage`s into a
//! dispatcher; ICE-server and adaptive-settings pushes update the shared
//! cache as soon as they validate, independent of any registered listener,
//! so a late subscriber immediately reads the current value.
//!
//! Listener registration is last-wins: one owned callback slot per push
//! kind, re-registering replaces the previous callback instead of adding a
//! second, which prevents duplicate delivery.

use futures::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::protocol::{
    ClientMessage, IceCandidatePayload, PeerRole, ServerMessage, SessionDescription, SignalKind,
};
use crate::settings::{AdaptiveTransferSettings, IceServerSet};

/// Per-attempt dial timeout; with the retry schedule below the whole
/// connect phase stays within the two-minute signaling budget.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(25);
const CONNECT_RETRIES: u32 = 4;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Last-registration-wins callback slot.
pub(crate) struct Slot<T: ?Sized>(RwLock<Option<Arc<T>>>);

pub(crate) type Callback<A> = dyn Fn(A) + Send + Sync;

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self(RwLock::new(None))
    }
}

impl<T: ?Sized> Slot<T> {
    pub(crate) fn set(&self, cb: Arc<T>) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(cb);
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut slot) = self.0.write() {
            *slot = None;
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}

/// Summary of a `transfer-cancelled` relay push.
#[derive(Debug, Clone)]
pub struct CancelNotice {
    pub cancelled_by: Option<PeerRole>,
    pub reason: Option<String>,
}

#[derive(Default)]
struct HandlerSlots {
    offer: Slot<Callback<SessionDescription>>,
    answer: Slot<Callback<SessionDescription>>,
    ice: Slot<Callback<IceCandidatePayload>>,
    room_full: Slot<Callback<()>>,
    room_busy: Slot<Callback<()>>,
    room_expired: Slot<Callback<()>>,
    peer_joined: Slot<Callback<()>>,
    peer_disconnected: Slot<Callback<()>>,
    transfer_started: Slot<Callback<()>>,
    transfer_completed: Slot<Callback<u64>>,
    transfer_cancelled: Slot<Callback<CancelNotice>>,
    adaptive_update: Slot<Callback<AdaptiveTransferSettings>>,
}

impl HandlerSlots {
    fn clear_all(&self) {
        self.offer.clear();
        self.answer.clear();
        self.ice.clear();
        self.room_full.clear();
        self.room_busy.clear();
        self.room_expired.clear();
        self.peer_joined.clear();
        self.peer_disconnected.clear();
        self.transfer_started.clear();
        self.transfer_completed.clear();
        self.transfer_cancelled.clear();
        self.adaptive_update.clear();
    }
}

/// Relay-pushed state cached for the session: the active ICE server list
/// and the adaptive transfer settings.
pub struct SignalingCache {
    ice_servers: RwLock<IceServerSet>,
    settings: RwLock<AdaptiveTransferSettings>,
}

impl Default for SignalingCache {
    fn default() -> Self {
        Self {
            ice_servers: RwLock::new(IceServerSet::default()),
            settings: RwLock::new(AdaptiveTransferSettings::default()),
        }
    }
}

impl SignalingCache {
    pub fn ice_servers(&self) -> IceServerSet {
        self.ice_servers
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn settings(&self) -> AdaptiveTransferSettings {
        self.settings.read().map(|s| *s).unwrap_or_default()
    }

    fn reset(&self) {
        if let Ok(mut servers) = self.ice_servers.write() {
            *servers = IceServerSet::default();
        }
        if let Ok(mut settings) = self.settings.write() {
            *settings = AdaptiveTransferSettings::default();
        }
    }
}

struct Connection {
    out_tx: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    fn teardown(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Control-plane client. Owns at most one socket; connect attempts are
/// serialized and a reconnect tears down the previous socket first.
pub struct SignalingClient {
    conn: Mutex<Option<Connection>>,
    slots: Arc<HandlerSlots>,
    cache: Arc<SignalingCache>,
}

impl Default for SignalingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingClient {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            slots: Arc::new(HandlerSlots::default()),
            cache: Arc::new(SignalingCache::default()),
        }
    }

    /// Shared cache handle; the negotiator reads the current ICE server set
    /// from here and the transfer engine the current chunking settings.
    pub fn cache(&self) -> Arc<SignalingCache> {
        Arc::clone(&self.cache)
    }

    /// Establish the relay connection. Already connected is a no-op; a dead
    /// previous socket is torn down first. Dial failures retry with a delay
    /// and surface `SignalingConnect` once the attempts are exhausted.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.is_alive() {
                return Ok(());
            }
            existing.teardown();
            *guard = None;
        }

        let mut last_err = String::new();
        for attempt in 1..=CONNECT_RETRIES {
            match timeout(CONNECT_ATTEMPT_TIMEOUT, connect_async(url)).await {
                Ok(Ok((ws, _resp))) => {
                    info!(url, attempt, "connected to signaling relay");
                    *guard = Some(self.spawn_io(ws));
                    return Ok(());
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "connect attempt timed out".to_string(),
            }
            warn!(url, attempt, error = %last_err, "signaling connect failed");
            if attempt < CONNECT_RETRIES {
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }
        Err(EngineError::SignalingConnect(last_err))
    }

    fn spawn_io(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Connection {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let slots = Arc::clone(&self.slots);
        let cache = Arc::clone(&self.cache);
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(incoming) = stream.next().await {
                match incoming {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => dispatch(&slots, &cache, msg),
                        Err(e) => {
                            warn!(error = %e, "unparseable relay message, session continues");
                        }
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!(error = %e, "signaling socket error");
                        break;
                    }
                    _ => {}
                }
            }
            debug!("signaling reader task finished");
        });

        Connection {
            out_tx,
            writer,
            reader,
        }
    }

    async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .filter(|c| c.is_alive())
            .ok_or_else(|| EngineError::SignalingConnect("not connected to relay".into()))?;
        conn.out_tx
            .send(Message::Text(json))
            .await
            .map_err(|_| EngineError::SignalingConnect("relay writer gone".into()))
    }

    /// Announce room membership. Fire-and-forget, no synchronous ack.
    pub async fn join_room(
        &self,
        code: &str,
        role: Option<PeerRole>,
        network_hint: Option<serde_json::Value>,
    ) -> Result<()> {
        self.send(&ClientMessage::JoinRoom {
            room_id: code.to_string(),
            role,
            network_info: network_hint,
        })
        .await
    }

    /// Relay one negotiation message by kind name. Unknown kinds are logged
    /// and dropped, never an error.
    pub async fn send_signal(
        &self,
        kind: &str,
        payload: serde_json::Value,
        room: &str,
    ) -> Result<()> {
        let parsed = match kind {
            "offer" => SignalKind::Offer,
            "answer" => SignalKind::Answer,
            "ice" => SignalKind::Ice,
            other => {
                warn!(kind = other, "dropping signal of unknown kind");
                return Ok(());
            }
        };
        match parsed {
            SignalKind::Offer => {
                let offer: SessionDescription = serde_json::from_value(payload)?;
                self.send_offer(room, offer).await
            }
            SignalKind::Answer => {
                let answer: SessionDescription = serde_json::from_value(payload)?;
                self.send_answer(room, answer).await
            }
            SignalKind::Ice => {
                let candidate: IceCandidatePayload = serde_json::from_value(payload)?;
                self.send_candidate(room, candidate).await
            }
        }
    }

    pub async fn send_offer(&self, room: &str, offer: SessionDescription) -> Result<()> {
        self.send(&ClientMessage::WebrtcOffer {
            room_id: room.to_string(),
            offer,
        })
        .await
    }

    pub async fn send_answer(&self, room: &str, answer: SessionDescription) -> Result<()> {
        self.send(&ClientMessage::WebrtcAnswer {
            room_id: room.to_string(),
            answer,
        })
        .await
    }

    pub async fn send_candidate(&self, room: &str, candidate: IceCandidatePayload) -> Result<()> {
        self.send(&ClientMessage::WebrtcIceCandidate {
            room_id: room.to_string(),
            candidate,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Informational transfer-lifecycle mirrors. Best effort: a dead relay
    // must not fail an in-flight direct transfer, so errors are logged.
    // ------------------------------------------------------------------

    pub async fn notify_transfer_started(&self, room: &str) {
        let msg = ClientMessage::TransferStart {
            room_id: room.to_string(),
        };
        if let Err(e) = self.send(&msg).await {
            debug!(error = %e, "could not mirror transfer-start to relay");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn notify_transfer_progress(
        &self,
        room: &str,
        file_index: u32,
        progress: f64,
        bytes_transferred: u64,
        total_bytes: u64,
        speed: f64,
        stage: &str,
    ) {
        let msg = ClientMessage::TransferProgress {
            room_id: room.to_string(),
            file_index,
            progress,
            bytes_transferred,
            total_bytes,
            speed,
            stage: stage.to_string(),
        };
        if let Err(e) = self.send(&msg).await {
            debug!(error = %e, "could not mirror transfer-progress to relay");
        }
    }

    pub async fn notify_transfer_complete(&self, room: &str, total_bytes: u64) {
        let msg = ClientMessage::TransferComplete {
            room_id: room.to_string(),
            total_bytes,
        };
        if let Err(e) = self.send(&msg).await {
            debug!(error = %e, "could not mirror transfer-complete to relay");
        }
    }

    pub async fn notify_transfer_cancel(
        &self,
        room: &str,
        cancelled_by: PeerRole,
        reason: Option<String>,
    ) {
        let msg = ClientMessage::TransferCancel {
            room_id: room.to_string(),
            cancelled_by,
            reason,
        };
        if let Err(e) = self.send(&msg).await {
            debug!(error = %e, "could not mirror transfer-cancel to relay");
        }
    }

    // ------------------------------------------------------------------
    // Handler registration, one owned slot per kind.
    // ------------------------------------------------------------------

    pub fn on_offer(&self, cb: impl Fn(SessionDescription) + Send + Sync + 'static) {
        self.slots.offer.set(Arc::new(cb));
    }

    pub fn on_answer(&self, cb: impl Fn(SessionDescription) + Send + Sync + 'static) {
        self.slots.answer.set(Arc::new(cb));
    }

    pub fn on_ice(&self, cb: impl Fn(IceCandidatePayload) + Send + Sync + 'static) {
        self.slots.ice.set(Arc::new(cb));
    }

    pub fn on_room_full(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.room_full.set(Arc::new(cb));
    }

    pub fn on_room_busy(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.room_busy.set(Arc::new(cb));
    }

    pub fn on_room_expired(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.room_expired.set(Arc::new(cb));
    }

    pub fn on_peer_joined(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.peer_joined.set(Arc::new(cb));
    }

    pub fn on_peer_disconnected(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.peer_disconnected.set(Arc::new(cb));
    }

    pub fn on_transfer_started(&self, cb: impl Fn(()) + Send + Sync + 'static) {
        self.slots.transfer_started.set(Arc::new(cb));
    }

    pub fn on_transfer_completed(&self, cb: impl Fn(u64) + Send + Sync + 'static) {
        self.slots.transfer_completed.set(Arc::new(cb));
    }

    pub fn on_transfer_cancelled(&self, cb: impl Fn(CancelNotice) + Send + Sync + 'static) {
        self.slots.transfer_cancelled.set(Arc::new(cb));
    }

    /// Fires with the merged settings after each validated relay push.
    pub fn on_adaptive_settings_update(
        &self,
        cb: impl Fn(AdaptiveTransferSettings) + Send + Sync + 'static,
    ) {
        self.slots.adaptive_update.set(Arc::new(cb));
    }

    /// Tear down the socket and clear all listeners and cached relay state.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.teardown();
        }
        self.slots.clear_all();
        self.cache.reset();
        info!("disconnected from signaling relay");
    }
}

/// Route one relay message: cache updates apply before any listener fires.
fn dispatch(slots: &HandlerSlots, cache: &SignalingCache, msg: ServerMessage) {
    match msg {
        ServerMessage::WebrtcOffer { offer } => {
            if let Some(cb) = slots.offer.get() {
                cb(offer);
            }
        }
        ServerMessage::WebrtcAnswer { answer } => {
            if let Some(cb) = slots.answer.get() {
                cb(answer);
            }
        }
        ServerMessage::WebrtcIceCandidate { candidate } => {
            if let Some(cb) = slots.ice.get() {
                cb(candidate);
            }
        }
        ServerMessage::TurnServers { servers } => {
            if let Ok(mut set) = cache.ice_servers.write() {
                set.replace_all(servers);
            }
        }
        ServerMessage::TurnServerSwitch { server, new_index } => {
            if let Ok(mut set) = cache.ice_servers.write() {
                set.patch(new_index, server);
            }
        }
        ServerMessage::AdaptiveSettingsUpdate(update) => {
            let merged = {
                match cache.settings.write() {
                    Ok(mut settings) => {
                        settings.apply(&update);
                        Some(*settings)
                    }
                    Err(_) => None,
                }
            };
            if let (Some(merged), Some(cb)) = (merged, slots.adaptive_update.get()) {
                cb(merged);
            }
        }
        ServerMessage::RoomFull => {
            if let Some(cb) = slots.room_full.get() {
                cb(());
            }
        }
        ServerMessage::RoomBusy => {
            if let Some(cb) = slots.room_busy.get() {
                cb(());
            }
        }
        ServerMessage::RoomExpired => {
            if let Some(cb) = slots.room_expired.get() {
                cb(());
            }
        }
        ServerMessage::PeerJoined => {
            if let Some(cb) = slots.peer_joined.get() {
                cb(());
            }
        }
        ServerMessage::PeerDisconnected => {
            if let Some(cb) = slots.peer_disconnected.get() {
                cb(());
            }
        }
        ServerMessage::TransferStarted => {
            if let Some(cb) = slots.transfer_started.get() {
                cb(());
            }
        }
        ServerMessage::TransferCompleted { total_bytes } => {
            if let Some(cb) = slots.transfer_completed.get() {
                cb(total_bytes);
            }
        }
        ServerMessage::TransferCancelled {
            cancelled_by,
            reason,
        } => {
            if let Some(cb) = slots.transfer_cancelled.get() {
                cb(CancelNotice {
                    cancelled_by,
                    reason,
                });
            }
        }
        ServerMessage::Unknown => {
            debug!("ignoring unknown relay push");
        }
    }
}
