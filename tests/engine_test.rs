//! End-to-end transfer scenarios over the in-memory channel pair.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use beamdrop::channel::memory::MemoryChannel;
use beamdrop::channel::{ChannelEvent, ReliableChannel};
use beamdrop::protocol::{ControlFrame, PeerRole, TransferProgressRecord};
use beamdrop::signaling::SignalingCache;
use beamdrop::transfer::{
    CancelRegistry, OutgoingFile, ReceivedFile, ReceiverEngine, ReceiverOutcome, SenderEngine,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn outgoing(index: u32, name: &str, data: &[u8]) -> OutgoingFile {
    OutgoingFile::new(
        name,
        "application/octet-stream",
        1_700_000_000_000,
        index,
        Bytes::copy_from_slice(data),
    )
}

fn cache() -> Arc<SignalingCache> {
    Arc::new(SignalingCache::default())
}

#[tokio::test]
async fn two_files_arrive_in_order_and_complete() {
    init_tracing();
    let ((sender_ch, _sender_rx), (_receiver_ch, mut receiver_rx)) = MemoryChannel::pair();

    let files = vec![
        outgoing(0, "first.txt", b"0123456789"),
        outgoing(1, "second.txt", b"abcdefghijklmnopqrst"),
    ];

    let announced: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
    let progress: Arc<Mutex<Vec<TransferProgressRecord>>> = Arc::new(Mutex::new(Vec::new()));

    let list_sink = Arc::clone(&announced);
    let file_sink = Arc::clone(&received);
    let progress_sink = Arc::clone(&progress);
    let receiver = tokio::spawn(async move {
        let mut engine = ReceiverEngine::new(CancelRegistry::default())
            .on_file_list(Arc::new(move |files| {
                let mut names = list_sink.lock().unwrap();
                for f in files {
                    names.push(f.name);
                }
            }))
            .on_progress(Arc::new(move |record| {
                progress_sink.lock().unwrap().push(record);
            }))
            .on_file_received(Arc::new(move |file| {
                file_sink.lock().unwrap().push(file);
            }));
        engine.run(&mut receiver_rx).await.unwrap()
    });

    let sender = SenderEngine::new(sender_ch, cache(), CancelRegistry::default());
    let sent = sender.run(&files).await.unwrap();
    assert_eq!(sent, 30);

    let outcome = receiver.await.unwrap();
    match outcome {
        ReceiverOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 30),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The queue announcement precedes any file content.
    assert_eq!(
        *announced.lock().unwrap(),
        vec!["first.txt".to_string(), "second.txt".to_string()]
    );

    // Files arrive whole, in queue order, byte for byte.
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].descriptor.file_index, 0);
    assert_eq!(&received[0].data[..], b"0123456789");
    assert_eq!(received[1].descriptor.file_index, 1);
    assert_eq!(&received[1].data[..], b"abcdefghijklmnopqrst");

    // Mirrored progress reaches 100 % for both files with the
    // sender-measured byte counts intact.
    let progress = progress.lock().unwrap();
    let final_for = |index: u32| {
        progress
            .iter()
            .filter(|r| r.file_index == index)
            .last()
            .cloned()
            .unwrap()
    };
    assert_eq!(final_for(0).bytes_transferred, 10);
    assert!((final_for(0).percent_complete - 100.0).abs() < f64::EPSILON);
    assert_eq!(final_for(1).bytes_transferred, 20);
    assert!((final_for(1).percent_complete - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cancelling_one_file_leaves_the_rest_of_the_queue_intact() {
    init_tracing();
    let ((sender_ch, _sender_rx), (_receiver_ch, mut receiver_rx)) = MemoryChannel::pair();

    let files: Vec<OutgoingFile> = (0..5)
        .map(|i| outgoing(i, &format!("file-{i}.bin"), &[i as u8; 64]))
        .collect();

    // The receiver has already asked for file 1 to be skipped.
    let registry = CancelRegistry::default();
    registry.mark(1, PeerRole::Receiver);

    let cancelled_records: Arc<Mutex<Vec<TransferProgressRecord>>> =
        Arc::new(Mutex::new(Vec::new()));
    let record_sink = Arc::clone(&cancelled_records);
    let sender = SenderEngine::new(sender_ch, cache(), registry).on_progress(Arc::new(
        move |record| {
            if record.cancelled {
                record_sink.lock().unwrap().push(record);
            }
        },
    ));

    let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
    let file_sink = Arc::clone(&received);
    let receiver = tokio::spawn(async move {
        let mut engine = ReceiverEngine::new(CancelRegistry::default())
            .on_file_received(Arc::new(move |file| {
                file_sink.lock().unwrap().push(file);
            }));
        engine.run(&mut receiver_rx).await.unwrap()
    });

    let sent = sender.run(&files).await.unwrap();
    assert_eq!(sent, 4 * 64);

    match receiver.await.unwrap() {
        ReceiverOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 4 * 64),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let indices: Vec<u32> = received
        .lock()
        .unwrap()
        .iter()
        .map(|f| f.descriptor.file_index)
        .collect();
    assert_eq!(indices, vec![0, 2, 3, 4]);

    // The skipped file's record carries the cancelled flag and who asked.
    let cancelled = cancelled_records.lock().unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].file_index, 1);
    assert_eq!(cancelled[0].cancelled_by, Some(PeerRole::Receiver));
}

#[tokio::test]
async fn file_cancelled_frame_drops_partial_assembly() {
    init_tracing();
    let (tx, mut events_rx) = mpsc::channel(16);

    let received: Arc<Mutex<Vec<ReceivedFile>>> = Arc::new(Mutex::new(Vec::new()));
    let progress: Arc<Mutex<Vec<TransferProgressRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let file_sink = Arc::clone(&received);
    let progress_sink = Arc::clone(&progress);
    let mut engine = ReceiverEngine::new(CancelRegistry::default())
        .on_progress(Arc::new(move |record| {
            progress_sink.lock().unwrap().push(record);
        }))
        .on_file_received(Arc::new(move |file| {
            file_sink.lock().unwrap().push(file);
        }));

    tx.send(ChannelEvent::Control(ControlFrame::FileMeta(
        outgoing(0, "half.bin", &[7u8; 100]).descriptor,
    )))
    .await
    .unwrap();
    tx.send(ChannelEvent::Payload(Bytes::from_static(&[7u8; 40])))
        .await
        .unwrap();
    tx.send(ChannelEvent::Control(ControlFrame::FileCancelled {
        file_index: 0,
        file_name: "half.bin".into(),
        cancelled_by: PeerRole::Sender,
    }))
    .await
    .unwrap();
    tx.send(ChannelEvent::Control(ControlFrame::TransferComplete))
        .await
        .unwrap();

    engine.run(&mut events_rx).await.unwrap();

    // Nothing finalized, and the cancellation surfaced as a record.
    assert!(received.lock().unwrap().is_empty());
    let progress = progress.lock().unwrap();
    assert!(progress.iter().any(|r| {
        r.file_index == 0 && r.cancelled && r.cancelled_by == Some(PeerRole::Sender)
    }));
}

#[tokio::test]
async fn whole_session_cancel_ends_the_receiver() {
    init_tracing();
    let ((sender_ch, _sender_rx), (_receiver_ch, mut receiver_rx)) = MemoryChannel::pair();

    sender_ch
        .send_control(&ControlFrame::TransferCancelled {
            cancelled_by: PeerRole::Sender,
        })
        .await
        .unwrap();

    let mut engine = ReceiverEngine::new(CancelRegistry::default());
    match engine.run(&mut receiver_rx).await.unwrap() {
        ReceiverOutcome::Cancelled { by } => assert_eq!(by, PeerRole::Sender),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
