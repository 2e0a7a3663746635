//! The application protocol over the reliable channel: advertise a file
//! queue, stream each file as ordered chunks with buffer-aware flow
//! control, reassemble on the far side, report progress, and honor
//! per-file and whole-session cancellation.
//!
//! Files are processed strictly sequentially over an index cursor; two
//! files' chunks never interleave. The cancelled-set is checked once per
//! chunk boundary, so at most one chunk beyond a cancellation request may
//! still go out.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ReliableChannel};
use crate::error::{EngineError, Result};
use crate::protocol::{ControlFrame, FileDescriptor, PeerRole, TransferProgressRecord};
use crate::settings::AdaptiveTransferSettings;
use crate::signaling::SignalingCache;

const BUFFER_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BUFFER_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// Bounded drain attempts; mostly at the backoff cap this is roughly half
/// a minute of stall before the session aborts.
const BUFFER_BACKOFF_ATTEMPTS: u32 = 300;

/// Mirror progress to the peer at most this often per file (plus always
/// at 100 %).
const PROGRESS_SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// The buffer counts as deep when more than this many chunks are queued,
/// which raises the pacing delay so relayed paths are not overwhelmed.
const DEEP_BUFFER_CHUNKS: usize = 4;
const DEEP_BUFFER_DELAY: Duration = Duration::from_millis(10);

/// Callback invoked with each upserted progress record.
pub type ProgressCallback = Arc<dyn Fn(TransferProgressRecord) + Send + Sync>;

/// Callback invoked once with the sender's declared queue.
pub type FileListCallback = Arc<dyn Fn(Vec<FileDescriptor>) + Send + Sync>;

/// Callback invoked with each fully reassembled file.
pub type FileReceivedCallback = Arc<dyn Fn(ReceivedFile) + Send + Sync>;

/// One file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        last_modified: u64,
        file_index: u32,
        data: Bytes,
    ) -> Self {
        Self {
            descriptor: FileDescriptor {
                name: name.into(),
                size: data.len() as u64,
                mime_type: mime_type.into(),
                last_modified,
                file_index,
            },
            data,
        }
    }
}

/// One fully reassembled file, delivered with its original metadata.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}

/// Shared cancelled-file set, keyed by file index and recording which peer
/// cancelled first. Written by cancel requests and incoming cancel frames,
/// read at every chunk boundary.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<u32, PeerRole>>>,
}

impl CancelRegistry {
    /// Record a cancellation. Returns false if the file was already
    /// cancelled; the first canceller's role sticks.
    pub fn mark(&self, file_index: u32, by: PeerRole) -> bool {
        let mut map = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match map.entry(file_index) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(by);
                true
            }
        }
    }

    pub fn cancelled_by(&self, file_index: u32) -> Option<PeerRole> {
        let map = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&file_index).copied()
    }
}

/// Instantaneous throughput, clamped to a non-negative finite number.
fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let speed = bytes as f64 / secs;
    if speed.is_finite() && speed >= 0.0 {
        speed
    } else {
        0.0
    }
}

fn percent(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (bytes as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// Human-readable byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Drives the outgoing side of a transfer over any reliable channel.
pub struct SenderEngine<C: ReliableChannel> {
    channel: Arc<C>,
    cache: Arc<SignalingCache>,
    cancelled: CancelRegistry,
    on_progress: Option<ProgressCallback>,
    max_buffer_waits: u32,
}

impl<C: ReliableChannel> SenderEngine<C> {
    pub fn new(channel: Arc<C>, cache: Arc<SignalingCache>, cancelled: CancelRegistry) -> Self {
        Self {
            channel,
            cache,
            cancelled,
            on_progress: None,
            max_buffer_waits: BUFFER_BACKOFF_ATTEMPTS,
        }
    }

    pub fn on_progress(mut self, cb: ProgressCallback) -> Self {
        self.on_progress = Some(cb);
        self
    }

    /// Shrink the drain-attempt bound so a stalled transport fails fast.
    #[cfg(test)]
    fn with_max_buffer_waits(mut self, attempts: u32) -> Self {
        self.max_buffer_waits = attempts;
        self
    }

    /// Run the whole queue to completion. Returns total payload bytes sent.
    ///
    /// Cancelled files are skipped at the next chunk boundary; a stalled
    /// transport aborts the session with `BufferTimeout`.
    pub async fn run(&self, files: &[OutgoingFile]) -> Result<u64> {
        let list: Vec<FileDescriptor> = files.iter().map(|f| f.descriptor.clone()).collect();
        self.channel.send_control(&ControlFrame::FileList(list)).await?;
        info!(files = files.len(), "declared file queue");

        let mut total_sent = 0u64;
        // Explicit cursor over the queue; no per-file recursion.
        for file in files {
            total_sent += self.send_file(file).await?;
        }

        self.channel.send_control(&ControlFrame::TransferComplete).await?;
        info!(total = %format_bytes(total_sent), "transfer complete");
        Ok(total_sent)
    }

    async fn send_file(&self, file: &OutgoingFile) -> Result<u64> {
        let desc = &file.descriptor;
        if let Some(by) = self.cancelled.cancelled_by(desc.file_index) {
            debug!(index = desc.file_index, "skipping cancelled file");
            self.emit_cancelled(desc, 0, by);
            return Ok(0);
        }

        self.channel
            .send_control(&ControlFrame::FileMeta(desc.clone()))
            .await?;

        let started = Instant::now();
        let mut sent = 0u64;
        let mut last_sync: Option<Instant> = None;

        let mut offset = 0usize;
        while offset < file.data.len() {
            // Cancellation is cooperative: checked once per chunk boundary.
            if let Some(by) = self.cancelled.cancelled_by(desc.file_index) {
                info!(index = desc.file_index, canceller = %by, "file cancelled mid-transfer");
                self.emit_cancelled(desc, sent, by);
                return Ok(sent);
            }

            // Re-read each chunk so mid-session relay updates take effect.
            let settings = self.cache.settings();
            self.wait_for_buffer_capacity(&settings, desc.file_index).await?;

            let end = (offset + settings.chunk_size).min(file.data.len());
            let chunk = file.data.slice(offset..end);
            let chunk_len = chunk.len() as u64;
            self.channel.send_payload(chunk).await?;
            offset = end;
            sent += chunk_len;

            let record = TransferProgressRecord {
                file_index: desc.file_index,
                file_name: desc.name.clone(),
                percent_complete: percent(sent, desc.size),
                bytes_transferred: sent,
                total_bytes: desc.size,
                speed_bytes_per_second: throughput(sent, started.elapsed()),
                cancelled: false,
                cancelled_by: None,
            };
            if let Some(cb) = &self.on_progress {
                cb(record.clone());
            }

            let finished = sent >= desc.size;
            let due = last_sync.map_or(true, |at| at.elapsed() >= PROGRESS_SYNC_INTERVAL);
            if finished || due {
                self.channel
                    .send_control(&ControlFrame::ProgressSync(record))
                    .await?;
                last_sync = Some(Instant::now());
            }

            if !finished {
                self.pace(&settings).await;
            }
        }

        // Zero-byte files still get their progress mark.
        if file.data.is_empty() {
            let record = TransferProgressRecord {
                file_index: desc.file_index,
                file_name: desc.name.clone(),
                percent_complete: 100.0,
                bytes_transferred: 0,
                total_bytes: 0,
                speed_bytes_per_second: 0.0,
                cancelled: false,
                cancelled_by: None,
            };
            if let Some(cb) = &self.on_progress {
                cb(record.clone());
            }
            self.channel
                .send_control(&ControlFrame::ProgressSync(record))
                .await?;
        }

        Ok(sent)
    }

    /// Exponential backoff while `buffered_amount` sits above the
    /// high-water mark. Each attempt also listens for the channel's
    /// low-buffer event so a fast drain resumes sending without waiting
    /// out the full backoff. Exhausting the attempts aborts the whole
    /// session, not just the current file.
    async fn wait_for_buffer_capacity(
        &self,
        settings: &AdaptiveTransferSettings,
        file_index: u32,
    ) -> Result<()> {
        let mut backoff = BUFFER_BACKOFF_INITIAL;
        for _ in 0..self.max_buffer_waits {
            if self.channel.buffered_amount().await <= settings.buffer_high_water {
                return Ok(());
            }
            let _ = timeout(
                backoff,
                self.channel.wait_buffered_below(settings.buffer_high_water),
            )
            .await;
            backoff = (backoff * 2).min(BUFFER_BACKOFF_MAX);
        }
        warn!(file_index, "send buffer never drained, aborting session");
        Err(EngineError::BufferTimeout {
            high_water: settings.buffer_high_water,
            file_index,
        })
    }

    /// Inter-chunk pacing; a buffer more than a few chunks deep gets the
    /// larger delay.
    async fn pace(&self, settings: &AdaptiveTransferSettings) {
        let mut delay = settings.inter_chunk_delay;
        if self.channel.buffered_amount().await > DEEP_BUFFER_CHUNKS * settings.chunk_size {
            delay = delay.max(DEEP_BUFFER_DELAY);
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    fn emit_cancelled(&self, desc: &FileDescriptor, sent: u64, by: PeerRole) {
        if let Some(cb) = &self.on_progress {
            cb(TransferProgressRecord {
                file_index: desc.file_index,
                file_name: desc.name.clone(),
                percent_complete: percent(sent, desc.size),
                bytes_transferred: sent,
                total_bytes: desc.size,
                speed_bytes_per_second: 0.0,
                cancelled: true,
                cancelled_by: Some(by),
            });
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Why the receiver loop ended.
#[derive(Debug, Clone)]
pub enum ReceiverOutcome {
    /// The sender finished the whole queue.
    Completed { total_bytes: u64 },
    /// The peer cancelled the whole session.
    Cancelled { by: PeerRole },
    /// The channel closed under us.
    ChannelClosed,
}

struct Assembly {
    descriptor: FileDescriptor,
    buf: BytesMut,
    received: u64,
}

/// Drives the incoming side: reassembles payload frames into files by
/// cumulative byte count against the sender-declared size.
///
/// No frame boundary other than the byte-count comparison is used, since
/// payload frames may arrive fragmented differently than they were sent.
pub struct ReceiverEngine {
    cancelled: CancelRegistry,
    on_file_list: Option<FileListCallback>,
    on_progress: Option<ProgressCallback>,
    on_file_received: Option<FileReceivedCallback>,
    assembly: Option<Assembly>,
    total_received: u64,
}

impl ReceiverEngine {
    pub fn new(cancelled: CancelRegistry) -> Self {
        Self {
            cancelled,
            on_file_list: None,
            on_progress: None,
            on_file_received: None,
            assembly: None,
            total_received: 0,
        }
    }

    pub fn on_file_list(mut self, cb: FileListCallback) -> Self {
        self.on_file_list = Some(cb);
        self
    }

    pub fn on_progress(mut self, cb: ProgressCallback) -> Self {
        self.on_progress = Some(cb);
        self
    }

    pub fn on_file_received(mut self, cb: FileReceivedCallback) -> Self {
        self.on_file_received = Some(cb);
        self
    }

    /// Consume channel events until the session ends one way or another.
    pub async fn run(
        &mut self,
        events: &mut mpsc::Receiver<ChannelEvent>,
    ) -> Result<ReceiverOutcome> {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {}
                ChannelEvent::Control(frame) => {
                    if let Some(outcome) = self.handle_control(frame) {
                        return Ok(outcome);
                    }
                }
                ChannelEvent::Payload(data) => self.handle_payload(data),
                ChannelEvent::Closed => return Ok(ReceiverOutcome::ChannelClosed),
                ChannelEvent::Error(e) => return Err(EngineError::Channel(e)),
            }
        }
        Ok(ReceiverOutcome::ChannelClosed)
    }

    fn handle_control(&mut self, frame: ControlFrame) -> Option<ReceiverOutcome> {
        match frame {
            ControlFrame::FileList(files) => {
                info!(files = files.len(), "received file queue");
                if let Some(cb) = &self.on_file_list {
                    cb(files);
                }
            }
            ControlFrame::FileMeta(descriptor) => {
                debug!(index = descriptor.file_index, name = %descriptor.name, "file meta");
                // A locally cancelled file may still be in flight; its
                // frames are consumed without ever assembling.
                if self.cancelled.cancelled_by(descriptor.file_index).is_some() {
                    debug!(index = descriptor.file_index, "ignoring meta for cancelled file");
                    self.assembly = None;
                    return None;
                }
                let expected = descriptor.size;
                self.assembly = Some(Assembly {
                    buf: BytesMut::with_capacity(expected.min(8 * 1024 * 1024) as usize),
                    descriptor,
                    received: 0,
                });
                if expected == 0 {
                    self.finalize_current();
                }
            }
            ControlFrame::ProgressSync(record) => {
                // Forwarded verbatim so both ends display the
                // sender-measured numbers.
                if let Some(cb) = &self.on_progress {
                    cb(record);
                }
            }
            ControlFrame::FileCancelled {
                file_index,
                file_name,
                cancelled_by,
            } => {
                self.cancelled.mark(file_index, cancelled_by);
                // Drop any half-assembled state for that file.
                if self
                    .assembly
                    .as_ref()
                    .is_some_and(|a| a.descriptor.file_index == file_index)
                {
                    self.assembly = None;
                }
                if let Some(cb) = &self.on_progress {
                    cb(TransferProgressRecord {
                        file_index,
                        file_name,
                        percent_complete: 0.0,
                        bytes_transferred: 0,
                        total_bytes: 0,
                        speed_bytes_per_second: 0.0,
                        cancelled: true,
                        cancelled_by: Some(cancelled_by),
                    });
                }
            }
            ControlFrame::TransferCancelled { cancelled_by } => {
                return Some(ReceiverOutcome::Cancelled { by: cancelled_by });
            }
            ControlFrame::TransferComplete => {
                return Some(ReceiverOutcome::Completed {
                    total_bytes: self.total_received,
                });
            }
        }
        None
    }

    fn handle_payload(&mut self, data: Bytes) {
        let Some(assembly) = self.assembly.as_mut() else {
            debug!(bytes = data.len(), "payload frame without an open assembly, dropping");
            return;
        };
        // Local cancellation can land between payload frames; the rest of
        // the file drains on the floor instead of finalizing.
        if let Some(by) = self.cancelled.cancelled_by(assembly.descriptor.file_index) {
            debug!(
                index = assembly.descriptor.file_index,
                canceller = %by,
                "dropping in-flight bytes for cancelled file"
            );
            self.assembly = None;
            return;
        }
        assembly.buf.extend_from_slice(&data);
        assembly.received += data.len() as u64;
        self.total_received += data.len() as u64;
        if assembly.received >= assembly.descriptor.size {
            self.finalize_current();
        }
    }

    fn finalize_current(&mut self) {
        if let Some(assembly) = self.assembly.take() {
            info!(
                index = assembly.descriptor.file_index,
                name = %assembly.descriptor.name,
                size = %format_bytes(assembly.received),
                "file reassembled"
            );
            if let Some(cb) = &self.on_file_received {
                cb(ReceivedFile {
                    descriptor: assembly.descriptor,
                    data: assembly.buf.freeze(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryChannel;

    fn cache() -> Arc<SignalingCache> {
        Arc::new(SignalingCache::default())
    }

    fn file(index: u32, name: &str, data: &[u8]) -> OutgoingFile {
        OutgoingFile::new(
            name,
            "application/octet-stream",
            0,
            index,
            Bytes::copy_from_slice(data),
        )
    }

    #[test]
    fn throughput_is_clamped() {
        assert_eq!(throughput(100, Duration::ZERO), 0.0);
        let speed = throughput(1000, Duration::from_secs(2));
        assert!((speed - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn cancel_registry_first_role_sticks() {
        let registry = CancelRegistry::default();
        assert!(registry.mark(2, PeerRole::Receiver));
        assert!(!registry.mark(2, PeerRole::Sender));
        assert_eq!(registry.cancelled_by(2), Some(PeerRole::Receiver));
        assert_eq!(registry.cancelled_by(0), None);
    }

    #[tokio::test]
    async fn sender_skips_cancelled_file_and_continues() {
        let ((sender_ch, _sender_rx), (_receiver_ch, mut receiver_rx)) = MemoryChannel::pair();
        let cancelled = CancelRegistry::default();
        cancelled.mark(1, PeerRole::Receiver);

        let engine = SenderEngine::new(sender_ch, cache(), cancelled);
        let files = vec![
            file(0, "a.txt", b"aaaa"),
            file(1, "b.txt", b"bbbb"),
            file(2, "c.txt", b"cccc"),
        ];
        let sent = engine.run(&files).await.unwrap();
        assert_eq!(sent, 8); // b.txt never hits the wire

        let mut metas = Vec::new();
        let mut payload_bytes = 0usize;
        while let Ok(event) = receiver_rx.try_recv() {
            match event {
                ChannelEvent::Control(ControlFrame::FileMeta(d)) => metas.push(d.file_index),
                ChannelEvent::Payload(p) => payload_bytes += p.len(),
                _ => {}
            }
        }
        assert_eq!(metas, vec![0, 2]);
        assert_eq!(payload_bytes, 8);
    }

    #[tokio::test]
    async fn mid_file_cancel_stops_at_the_next_chunk_boundary() {
        let ((sender_ch, _sender_rx), (_receiver_ch, mut receiver_rx)) = MemoryChannel::pair();
        let cancelled = CancelRegistry::default();
        let registry = cancelled.clone();
        let cancel_records: Arc<Mutex<Vec<TransferProgressRecord>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&cancel_records);

        // The user cancels file 1 as soon as its first chunk reports
        // progress, while the file is mid-flight.
        let engine = SenderEngine::new(sender_ch, cache(), cancelled).on_progress(Arc::new(
            move |record| {
                if record.file_index == 1 && !record.cancelled {
                    registry.mark(1, PeerRole::Receiver);
                }
                if record.cancelled {
                    sink.lock().unwrap().push(record);
                }
            },
        ));

        let big = vec![7u8; 200_000]; // several chunks at the default chunk size
        let files = vec![
            file(0, "first.bin", b"0123456789"),
            file(1, "dropped.bin", &big),
            file(2, "last.bin", b"9876543210"),
        ];
        let sent = engine.run(&files).await.unwrap();
        // Exactly one 64 KiB chunk of the cancelled file escapes before
        // the boundary check fires.
        assert_eq!(sent, 10 + 65_536 + 10);

        let records = cancel_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_index, 1);
        assert_eq!(records[0].cancelled_by, Some(PeerRole::Receiver));
        assert_eq!(records[0].bytes_transferred, 65_536);

        let mut metas = Vec::new();
        let mut payload_bytes = 0usize;
        while let Ok(event) = receiver_rx.try_recv() {
            match event {
                ChannelEvent::Control(ControlFrame::FileMeta(d)) => metas.push(d.file_index),
                ChannelEvent::Payload(p) => payload_bytes += p.len(),
                _ => {}
            }
        }
        assert_eq!(metas, vec![0, 1, 2]);
        assert_eq!(payload_bytes, 10 + 65_536 + 10);
    }

    #[tokio::test]
    async fn buffer_stall_aborts_with_buffer_timeout() {
        let ((sender_ch, _sender_rx), (_receiver_ch, _receiver_rx)) = MemoryChannel::pair();
        sender_ch.set_buffered_amount(usize::MAX);

        let engine = SenderEngine::new(sender_ch.clone(), cache(), CancelRegistry::default())
            .with_max_buffer_waits(3);
        let files = vec![file(0, "a.bin", &[0u8; 1024])];
        match engine.run(&files).await {
            Err(EngineError::BufferTimeout { file_index, .. }) => assert_eq!(file_index, 0),
            other => panic!("expected BufferTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receiver_reassembles_across_refragmented_payloads() {
        let (tx, mut events_rx) = mpsc::channel(16);
        let descriptor = FileDescriptor {
            name: "doc.bin".into(),
            size: 10,
            mime_type: String::new(),
            last_modified: 0,
            file_index: 0,
        };
        let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut engine = ReceiverEngine::new(CancelRegistry::default())
            .on_file_received(Arc::new(move |f| sink.lock().unwrap().push(f)));

        // Sent as one 10-byte chunk, arrives as 3+7.
        tx.send(ChannelEvent::Control(ControlFrame::FileMeta(descriptor)))
            .await
            .unwrap();
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"defghij")))
            .await
            .unwrap();
        tx.send(ChannelEvent::Control(ControlFrame::TransferComplete))
            .await
            .unwrap();

        let outcome = engine.run(&mut events_rx).await.unwrap();
        match outcome {
            ReceiverOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 10),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].data[..], b"abcdefghij");
        assert_eq!(received[0].descriptor.name, "doc.bin");
    }

    #[tokio::test]
    async fn locally_cancelled_file_never_finalizes() {
        let (tx, mut events_rx) = mpsc::channel(16);
        let registry = CancelRegistry::default();
        let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut engine = ReceiverEngine::new(registry.clone())
            .on_file_received(Arc::new(move |f| sink.lock().unwrap().push(f)));
        let handle = tokio::spawn(async move { engine.run(&mut events_rx).await });

        let meta = |index: u32, name: &str, size: u64| {
            ChannelEvent::Control(ControlFrame::FileMeta(FileDescriptor {
                name: name.into(),
                size,
                mime_type: String::new(),
                last_modified: 0,
                file_index: index,
            }))
        };

        // File 0 starts arriving, then the local side cancels it while
        // the rest of its bytes are still in flight.
        tx.send(meta(0, "half.bin", 6)).await.unwrap();
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        registry.mark(0, PeerRole::Receiver);
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"def")))
            .await
            .unwrap();

        tx.send(meta(1, "whole.bin", 3)).await.unwrap();
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"xyz")))
            .await
            .unwrap();

        // File 2 was cancelled before its meta even arrived.
        registry.mark(2, PeerRole::Receiver);
        tx.send(meta(2, "late.bin", 3)).await.unwrap();
        tx.send(ChannelEvent::Payload(Bytes::from_static(b"opq")))
            .await
            .unwrap();
        tx.send(ChannelEvent::Control(ControlFrame::TransferComplete))
            .await
            .unwrap();

        match handle.await.unwrap().unwrap() {
            ReceiverOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 6),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].descriptor.name, "whole.bin");
        assert_eq!(&received[0].data[..], b"xyz");
    }

    #[tokio::test]
    async fn zero_byte_file_finalizes_at_meta() {
        let (tx, mut events_rx) = mpsc::channel(8);
        let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut engine = ReceiverEngine::new(CancelRegistry::default())
            .on_file_received(Arc::new(move |f| sink.lock().unwrap().push(f)));

        tx.send(ChannelEvent::Control(ControlFrame::FileMeta(FileDescriptor {
            name: "empty".into(),
            size: 0,
            mime_type: String::new(),
            last_modified: 0,
            file_index: 0,
        })))
        .await
        .unwrap();
        tx.send(ChannelEvent::Control(ControlFrame::TransferComplete))
            .await
            .unwrap();

        engine.run(&mut events_rx).await.unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].data.is_empty());
    }
}
