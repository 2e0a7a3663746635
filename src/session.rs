//! The owned session object: one value wires signaling, negotiation, the
//! data channel, and the transfer engine together and drives a full
//! transfer to a terminal status.
//!
//! Lifecycle callbacks hang off the session the same way relay handlers
//! hang off the signaling client: one owned slot per event, re-registering
//! replaces. All spawned work is reachable from `run_sender` /
//! `run_receiver`; `cleanup` tears everything down for reuse.

use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ReliableChannel, RtcChannel};
use crate::error::{EngineError, Result};
use crate::negotiator::{NegotiationEvent, PeerNegotiator};
use crate::protocol::{
    ControlFrame, FileDescriptor, IceCandidatePayload, PeerRole, SessionDescription,
    TransferProgressRecord,
};
use crate::signaling::{Callback, SignalingClient, Slot};
use crate::state::{SessionStatus, StatusTracker};
use crate::transfer::{
    CancelRegistry, OutgoingFile, ReceivedFile, ReceiverEngine, ReceiverOutcome, SenderEngine,
};

/// Budget for the whole signaling phase: relay dial, room join, and the
/// peer showing up.
const SIGNALING_WAIT: Duration = Duration::from_secs(120);

/// How a session ended, when it ended without a fatal error.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed { total_bytes: u64 },
    Cancelled { by: PeerRole },
}

/// Connection parameters shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the signaling relay.
    pub signaling_url: String,
    /// Optional network description forwarded to the relay on join, used
    /// by the relay to pick TURN servers and tune settings.
    pub network_hint: Option<serde_json::Value>,
}

impl SessionConfig {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            network_hint: None,
        }
    }
}

#[derive(Default)]
struct SessionCallbacks {
    status: Slot<Callback<SessionStatus>>,
    file_list: Slot<Callback<Vec<FileDescriptor>>>,
    progress: Slot<Callback<TransferProgressRecord>>,
    file_received: Slot<Callback<ReceivedFile>>,
    file_cancelled: Slot<Callback<(u32, String, PeerRole)>>,
}

impl SessionCallbacks {
    fn clear_all(&self) {
        self.status.clear();
        self.file_list.clear();
        self.progress.clear();
        self.file_received.clear();
        self.file_cancelled.clear();
    }
}

/// Handles the transfer loop needs for an in-flight cancel request.
struct ActiveTransfer {
    channel: Arc<dyn ReliableChannel>,
    registry: CancelRegistry,
    role: PeerRole,
}

/// One peer's session. Create, register callbacks, then drive with
/// `run_sender` or `run_receiver`; the method resolves when the session
/// reaches a terminal status.
pub struct Session {
    config: SessionConfig,
    signaling: Arc<SignalingClient>,
    status: Arc<StatusTracker>,
    callbacks: Arc<SessionCallbacks>,
    active: RwLock<Option<Arc<ActiveTransfer>>>,
    negotiator: RwLock<Option<Arc<PeerNegotiator>>>,
    cancel_requested: Notify,
    cancel_reason: RwLock<Option<String>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            signaling: Arc::new(SignalingClient::new()),
            status: Arc::new(StatusTracker::new()),
            callbacks: Arc::new(SessionCallbacks::default()),
            active: RwLock::new(None),
            negotiator: RwLock::new(None),
            cancel_requested: Notify::new(),
            cancel_reason: RwLock::new(None),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status.status()
    }

    pub fn signaling(&self) -> Arc<SignalingClient> {
        Arc::clone(&self.signaling)
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn on_status(&self, cb: impl Fn(SessionStatus) + Send + Sync + 'static) {
        self.callbacks.status.set(Arc::new(cb));
    }

    pub fn on_file_list(&self, cb: impl Fn(Vec<FileDescriptor>) + Send + Sync + 'static) {
        self.callbacks.file_list.set(Arc::new(cb));
    }

    pub fn on_progress(&self, cb: impl Fn(TransferProgressRecord) + Send + Sync + 'static) {
        self.callbacks.progress.set(Arc::new(cb));
    }

    pub fn on_file_received(&self, cb: impl Fn(ReceivedFile) + Send + Sync + 'static) {
        self.callbacks.file_received.set(Arc::new(cb));
    }

    /// Fired as `(file_index, file_name, cancelled_by)` when a single file
    /// is cancelled by either peer.
    pub fn on_file_cancelled(&self, cb: impl Fn((u32, String, PeerRole)) + Send + Sync + 'static) {
        self.callbacks.file_cancelled.set(Arc::new(cb));
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel one file. Already-sent files are unaffected and later files
    /// still transfer. No-op when no transfer is active or the file is
    /// already cancelled.
    pub async fn cancel_file(&self, file_index: u32, file_name: &str) {
        let Some(active) = self.active.read().ok().and_then(|a| a.clone()) else {
            debug!(file_index, "cancel_file with no active transfer");
            return;
        };
        if !active.registry.mark(file_index, active.role) {
            return;
        }
        let frame = ControlFrame::FileCancelled {
            file_index,
            file_name: file_name.to_string(),
            cancelled_by: active.role,
        };
        if let Err(e) = active.channel.send_control(&frame).await {
            warn!(error = %e, "could not notify peer of file cancel");
        }
        if let Some(cb) = self.callbacks.file_cancelled.get() {
            cb((file_index, file_name.to_string(), active.role));
        }
    }

    /// Cancel the whole session. The running `run_sender` / `run_receiver`
    /// observes the request at its next loop turn and resolves with
    /// `SessionOutcome::Cancelled`.
    pub fn cancel_transfer(&self, reason: Option<String>) {
        if let Ok(mut slot) = self.cancel_reason.write() {
            *slot = reason;
        }
        self.cancel_requested.notify_one();
    }

    // ------------------------------------------------------------------
    // Sender lifecycle
    // ------------------------------------------------------------------

    /// Drive a full sending session: join the room, wait for the peer,
    /// negotiate, stream every file, and mirror lifecycle to the relay.
    pub async fn run_sender(
        self: &Arc<Self>,
        room: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<SessionOutcome> {
        let result = self.sender_inner(room, files).await;
        self.settle(room, &result).await;
        result
    }

    async fn sender_inner(
        self: &Arc<Self>,
        room: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<SessionOutcome> {
        self.set_status(SessionStatus::Connecting);
        self.signaling.connect(&self.config.signaling_url).await?;

        // The sender sits in the room until the receiver shows up.
        let (joined_tx, mut joined_rx) = mpsc::channel::<()>(1);
        self.signaling.on_peer_joined(move |()| {
            let _ = joined_tx.try_send(());
        });
        let room_err_rx = self.watch_room_errors();

        self.signaling
            .join_room(room, Some(PeerRole::Sender), self.config.network_hint.clone())
            .await?;
        info!(room, "joined as sender, waiting for peer");
        if self
            .wait_for(&mut joined_rx, room_err_rx, "peer never joined")
            .await?
            .is_none()
        {
            return Ok(SessionOutcome::Cancelled { by: PeerRole::Sender });
        }

        let negotiator = Arc::new(
            PeerNegotiator::create_session(PeerRole::Sender, room, self.signaling()).await?,
        );
        self.store_negotiator(&negotiator);

        let dc = negotiator.create_data_channel().await?;
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let channel = Arc::new(RtcChannel::attach(dc, events_tx));

        self.bridge_remote_description(&negotiator, false);
        self.bridge_remote_candidates(&negotiator);
        negotiator.spawn_candidate_forwarder().await;
        negotiator.create_offer_and_send().await?;
        let mut monitor_rx = negotiator.spawn_monitor().await;

        // Both the connection and the channel must be up before any frame
        // goes out; the two events race and either order is fine.
        let mut connected = false;
        let mut channel_open = false;
        while !(connected && channel_open) {
            tokio::select! {
                event = monitor_rx.recv() => match event {
                    Some(NegotiationEvent::Connected) => connected = true,
                    Some(other) => {
                        if let Some(err) = other.into_error() {
                            return Err(err);
                        }
                        return Err(EngineError::ConnectionFailed("connection closed during setup".into()));
                    }
                    None => return Err(EngineError::ConnectionFailed("negotiation monitor gone".into())),
                },
                event = events_rx.recv() => match event {
                    Some(ChannelEvent::Open) => channel_open = true,
                    Some(ChannelEvent::Closed) | None => {
                        return Err(EngineError::ConnectionFailed("data channel closed during setup".into()))
                    }
                    Some(ChannelEvent::Error(e)) => return Err(EngineError::Channel(e)),
                    Some(_) => {}
                },
                _ = self.cancel_requested.notified() => {
                    return Ok(SessionOutcome::Cancelled { by: PeerRole::Sender });
                }
            }
        }

        let registry = CancelRegistry::default();
        self.store_active(channel.clone(), &registry, PeerRole::Sender);

        if !self.status.note_once("transfer-start") {
            return Err(EngineError::ConnectionFailed("transfer already started".into()));
        }
        self.set_status(SessionStatus::Transferring);
        self.signaling.notify_transfer_started(room).await;

        // Mirror progress to the relay off the hot path; the engine already
        // paces its records, the mirror task adds its own 500 ms throttle.
        let (mirror_tx, mut mirror_rx) = mpsc::channel::<TransferProgressRecord>(64);
        {
            let signaling = self.signaling();
            let room = room.to_string();
            tokio::spawn(async move {
                let mut last_sent: Option<tokio::time::Instant> = None;
                while let Some(record) = mirror_rx.recv().await {
                    let finished = record.percent_complete >= 100.0;
                    let due = last_sent
                        .map_or(true, |at| at.elapsed() >= Duration::from_millis(500));
                    if !(finished || due) {
                        continue;
                    }
                    last_sent = Some(tokio::time::Instant::now());
                    let stage = if finished { "completed" } else { "transferring" };
                    signaling
                        .notify_transfer_progress(
                            &room,
                            record.file_index,
                            record.percent_complete,
                            record.bytes_transferred,
                            record.total_bytes,
                            record.speed_bytes_per_second,
                            stage,
                        )
                        .await;
                }
            });
        }

        let progress_slot = Arc::clone(&self.callbacks);
        let engine = SenderEngine::new(Arc::clone(&channel), self.signaling.cache(), registry.clone())
            .on_progress(Arc::new(move |record| {
                let _ = mirror_tx.try_send(record.clone());
                if let Some(cb) = progress_slot.progress.get() {
                    cb(record);
                }
            }));

        let run = engine.run(&files);
        tokio::pin!(run);
        let mut monitor_open = true;
        loop {
            tokio::select! {
                result = &mut run => {
                    let total = result?;
                    self.signaling.notify_transfer_complete(room, total).await;
                    return Ok(SessionOutcome::Completed { total_bytes: total });
                }
                event = events_rx.recv() => match event {
                    Some(ChannelEvent::Control(ControlFrame::FileCancelled { file_index, file_name, cancelled_by })) => {
                        registry.mark(file_index, cancelled_by);
                        if let Some(cb) = self.callbacks.file_cancelled.get() {
                            cb((file_index, file_name, cancelled_by));
                        }
                    }
                    Some(ChannelEvent::Control(ControlFrame::TransferCancelled { cancelled_by })) => {
                        info!(canceller = %cancelled_by, "peer cancelled the session");
                        return Ok(SessionOutcome::Cancelled { by: cancelled_by });
                    }
                    Some(ChannelEvent::Error(e)) => return Err(EngineError::Channel(e)),
                    Some(ChannelEvent::Closed) | None => {
                        return Err(EngineError::ConnectionFailed("data channel closed mid-transfer".into()))
                    }
                    Some(_) => {}
                },
                event = monitor_rx.recv(), if monitor_open => {
                    match event {
                        Some(event) => {
                            if let Some(err) = event.into_error() {
                                return Err(err);
                            }
                        }
                        None => monitor_open = false,
                    }
                }
                _ = self.cancel_requested.notified() => {
                    let frame = ControlFrame::TransferCancelled { cancelled_by: PeerRole::Sender };
                    if let Err(e) = channel.send_control(&frame).await {
                        debug!(error = %e, "could not notify peer of session cancel");
                    }
                    return Ok(SessionOutcome::Cancelled { by: PeerRole::Sender });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiver lifecycle
    // ------------------------------------------------------------------

    /// Drive a full receiving session: join the room, answer the offer,
    /// and reassemble every incoming file.
    pub async fn run_receiver(self: &Arc<Self>, room: &str) -> Result<SessionOutcome> {
        let result = self.receiver_inner(room).await;
        self.settle(room, &result).await;
        result
    }

    async fn receiver_inner(self: &Arc<Self>, room: &str) -> Result<SessionOutcome> {
        self.set_status(SessionStatus::Connecting);
        self.signaling.connect(&self.config.signaling_url).await?;

        let negotiator = Arc::new(
            PeerNegotiator::create_session(PeerRole::Receiver, room, self.signaling()).await?,
        );
        self.store_negotiator(&negotiator);

        // Answer every offer, including a later ice-restart offer.
        self.bridge_remote_description(&negotiator, true);
        self.bridge_remote_candidates(&negotiator);
        negotiator.spawn_candidate_forwarder().await;

        let room_err_rx = self.watch_room_errors();
        self.signaling
            .join_room(room, Some(PeerRole::Receiver), self.config.network_hint.clone())
            .await?;
        info!(room, "joined as receiver, waiting for offer");

        let mut incoming_rx = negotiator
            .take_incoming_channel_rx()
            .await
            .ok_or_else(|| EngineError::ConnectionFailed("session already consumed".into()))?;
        let dc = match self
            .wait_for(&mut incoming_rx, room_err_rx, "no data channel arrived")
            .await?
        {
            Some(dc) => dc,
            None => return Ok(SessionOutcome::Cancelled { by: PeerRole::Receiver }),
        };
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let channel = Arc::new(RtcChannel::attach(dc, events_tx));
        let mut monitor_rx = negotiator.spawn_monitor().await;

        let registry = CancelRegistry::default();
        self.store_active(channel.clone(), &registry, PeerRole::Receiver);
        self.set_status(SessionStatus::Transferring);

        let cbs = Arc::clone(&self.callbacks);
        let list_cbs = Arc::clone(&self.callbacks);
        let file_cbs = Arc::clone(&self.callbacks);
        let mut engine = ReceiverEngine::new(registry)
            .on_file_list(Arc::new(move |files| {
                if let Some(cb) = list_cbs.file_list.get() {
                    cb(files);
                }
            }))
            .on_progress(Arc::new(move |record| {
                if let Some(cb) = cbs.progress.get() {
                    cb(record);
                }
            }))
            .on_file_received(Arc::new(move |file| {
                if let Some(cb) = file_cbs.file_received.get() {
                    cb(file);
                }
            }));

        let run = engine.run(&mut events_rx);
        tokio::pin!(run);
        let mut monitor_open = true;
        loop {
            tokio::select! {
                outcome = &mut run => {
                    return match outcome? {
                        ReceiverOutcome::Completed { total_bytes } => {
                            Ok(SessionOutcome::Completed { total_bytes })
                        }
                        ReceiverOutcome::Cancelled { by } => Ok(SessionOutcome::Cancelled { by }),
                        ReceiverOutcome::ChannelClosed => Err(EngineError::ConnectionFailed(
                            "data channel closed mid-transfer".into(),
                        )),
                    };
                }
                event = monitor_rx.recv(), if monitor_open => {
                    match event {
                        Some(event) => {
                            if let Some(err) = event.into_error() {
                                return Err(err);
                            }
                        }
                        None => monitor_open = false,
                    }
                }
                _ = self.cancel_requested.notified() => {
                    let frame = ControlFrame::TransferCancelled { cancelled_by: PeerRole::Receiver };
                    if let Err(e) = channel.send_control(&frame).await {
                        debug!(error = %e, "could not notify peer of session cancel");
                    }
                    return Ok(SessionOutcome::Cancelled { by: PeerRole::Receiver });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release the connection, the channel, and all relay state so the
    /// session value can run again with a fresh room.
    pub async fn cleanup(&self) {
        self.release_transport().await;
        self.callbacks.clear_all();
        self.status.reset();
        if let Ok(mut reason) = self.cancel_reason.write() {
            *reason = None;
        }
    }

    /// Close the data channel, the peer connection, and the relay socket.
    /// Idempotent: everything is taken out of its slot before closing.
    async fn release_transport(&self) {
        let active = self.active.write().ok().and_then(|mut a| a.take());
        if let Some(active) = active {
            if let Err(e) = active.channel.close().await {
                debug!(error = %e, "channel close during teardown");
            }
        }
        let negotiator = self.negotiator.write().ok().and_then(|mut n| n.take());
        if let Some(negotiator) = negotiator {
            if let Err(e) = negotiator.close().await {
                debug!(error = %e, "peer connection close during teardown");
            }
        }
        self.signaling.disconnect().await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn set_status(&self, next: SessionStatus) {
        if self.status.transition(next) {
            if let Some(cb) = self.callbacks.status.get() {
                cb(next);
            }
        }
    }

    /// Map the final result onto the status tracker and relay mirrors.
    /// Cancelled and errored sessions also tear the transport down here:
    /// the cancel mirror goes to the relay first, then the channel, the
    /// peer connection, and the relay socket close. A completed session
    /// keeps its transport until `cleanup` so late control traffic drains.
    async fn settle(&self, room: &str, result: &Result<SessionOutcome>) {
        match result {
            Ok(SessionOutcome::Completed { .. }) => {
                if self.status.finalize(SessionStatus::Completed) {
                    if let Some(cb) = self.callbacks.status.get() {
                        cb(SessionStatus::Completed);
                    }
                }
            }
            Ok(SessionOutcome::Cancelled { by }) => {
                if self.status.finalize(SessionStatus::Cancelled) {
                    if let Some(cb) = self.callbacks.status.get() {
                        cb(SessionStatus::Cancelled);
                    }
                    let reason = self.cancel_reason.read().ok().and_then(|r| r.clone());
                    self.signaling.notify_transfer_cancel(room, *by, reason).await;
                }
                self.release_transport().await;
            }
            Err(e) => {
                warn!(error = %e, "session ended with error");
                if self.status.finalize(SessionStatus::Error) {
                    if let Some(cb) = self.callbacks.status.get() {
                        cb(SessionStatus::Error);
                    }
                }
                self.release_transport().await;
            }
        }
    }

    fn store_negotiator(&self, negotiator: &Arc<PeerNegotiator>) {
        if let Ok(mut slot) = self.negotiator.write() {
            *slot = Some(Arc::clone(negotiator));
        }
    }

    fn store_active(
        &self,
        channel: Arc<dyn ReliableChannel>,
        registry: &CancelRegistry,
        role: PeerRole,
    ) {
        if let Ok(mut slot) = self.active.write() {
            *slot = Some(Arc::new(ActiveTransfer {
                channel,
                registry: registry.clone(),
                role,
            }));
        }
    }

    /// Feed relayed remote descriptions into the negotiator. The receiver
    /// answers every offer, including a later ice-restart offer; the sender
    /// applies answers.
    fn bridge_remote_description(&self, negotiator: &Arc<PeerNegotiator>, answer_offers: bool) {
        let (tx, mut rx) = mpsc::channel::<SessionDescription>(4);
        if answer_offers {
            self.signaling.on_offer(move |offer| {
                let _ = tx.try_send(offer);
            });
        } else {
            self.signaling.on_answer(move |answer| {
                let _ = tx.try_send(answer);
            });
        }
        let negotiator = Arc::clone(negotiator);
        tokio::spawn(async move {
            while let Some(desc) = rx.recv().await {
                let result = if answer_offers {
                    negotiator.create_answer_and_send(desc).await
                } else {
                    negotiator.apply_remote_description("answer", desc).await
                };
                if let Err(e) = result {
                    warn!(error = %e, "could not apply remote description");
                }
            }
        });
    }

    fn bridge_remote_candidates(&self, negotiator: &Arc<PeerNegotiator>) {
        let (tx, mut rx) = mpsc::channel::<IceCandidatePayload>(64);
        self.signaling.on_ice(move |candidate| {
            let _ = tx.try_send(candidate);
        });
        let negotiator = Arc::clone(negotiator);
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                negotiator.add_remote_candidate(candidate).await;
            }
        });
    }

    /// Surface room-level relay rejections as a one-shot error channel.
    fn watch_room_errors(&self) -> mpsc::Receiver<EngineError> {
        let (tx, rx) = mpsc::channel::<EngineError>(4);
        let full_tx = tx.clone();
        self.signaling.on_room_full(move |()| {
            let _ = full_tx.try_send(EngineError::SignalingConnect("room is full".into()));
        });
        let busy_tx = tx.clone();
        self.signaling.on_room_busy(move |()| {
            let _ = busy_tx.try_send(EngineError::SignalingConnect(
                "room is busy with another transfer".into(),
            ));
        });
        self.signaling.on_room_expired(move |()| {
            let _ = tx.try_send(EngineError::SignalingConnect("room has expired".into()));
        });
        rx
    }

    /// Wait for one value, racing room errors, cancellation, and the
    /// signaling budget. `Ok(None)` means the session was cancelled while
    /// waiting.
    async fn wait_for<T>(
        self: &Arc<Self>,
        rx: &mut mpsc::Receiver<T>,
        mut err_rx: mpsc::Receiver<EngineError>,
        what: &str,
    ) -> Result<Option<T>> {
        timeout(SIGNALING_WAIT, async {
            tokio::select! {
                value = rx.recv() => match value {
                    Some(value) => Ok(Some(value)),
                    None => Err(EngineError::SignalingConnect(format!("{what}: signaling closed"))),
                },
                err = err_rx.recv() => Err(err.unwrap_or_else(|| {
                    EngineError::SignalingConnect("relay rejected the room".into())
                })),
                _ = self.cancel_requested.notified() => Ok(None),
            }
        })
        .await
        .map_err(|_| EngineError::ConnectionTimeout(SIGNALING_WAIT))?
    }
}
