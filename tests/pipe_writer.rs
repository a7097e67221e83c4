//! Pipe Writer Integration Tests
//!
//! Exercises PipeWriter against real FIFOs: open modes, ordering under
//! concurrency, disconnects and the exclusive lock.

mod common;

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::{Duration, Instant};

use piperelay::codec::{decode_str, encode};
use piperelay::domain::{Event, EventKind, PipeTarget};
use piperelay::pipe::{PipeError, PipeWriter, WriterOptions, WriterState};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use common::{attach_reader, make_fifo, spawn_reader};

#[tokio::test]
async fn test_nonblocking_open_without_reader_fails_fast() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");

    let writer = PipeWriter::new(PipeTarget::new(&path), WriterOptions::nonblocking());

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(2), writer.connect())
        .await
        .expect("non-blocking open must not wait for a reader");

    assert!(matches!(result, Err(PipeError::NoReader(_))));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Nothing was opened, so nothing can be written
    assert_eq!(writer.state().await, WriterState::Unopened);
    assert!(matches!(writer.write(b"x\n").await, Err(PipeError::NotOpen(_))));
}

#[tokio::test]
async fn test_blocking_open_with_deadline_reports_no_reader() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");

    let options = WriterOptions::blocking().with_open_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let result = PipeWriter::open(PipeTarget::new(&path), options).await;

    assert!(matches!(result, Err(PipeError::NoReader(_))));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_blocking_open_abandoned_by_caller_timeout_leaves_no_descriptor() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let writer = PipeWriter::new(PipeTarget::new(&path), WriterOptions::blocking());

    let waited = tokio::time::timeout(Duration::from_millis(100), writer.connect()).await;
    assert_err!(waited);
    assert_eq!(writer.state().await, WriterState::Unopened);

    // A reader arriving later must see this writer's record, not an early EOF
    let reader = spawn_reader(path.clone());
    let connected = tokio::time::timeout(Duration::from_secs(5), writer.connect())
        .await
        .expect("reader attached, connect must finish");
    assert_ok!(connected);

    let record = encode(&Event::with_session_id(EventKind::TaskOk, "late")).unwrap();
    writer.write(&record).await.unwrap();
    writer.close().await.unwrap();

    let received = reader.join().unwrap();
    assert_eq!(received.as_bytes(), record.as_slice());
}

#[tokio::test]
async fn test_blocking_open_waits_for_reader_and_close_flushes() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let reader = spawn_reader(path.clone());

    let writer = PipeWriter::open(PipeTarget::new(&path), WriterOptions::blocking())
        .await
        .unwrap();
    assert_eq!(writer.state().await, WriterState::Open);

    let mut expected = String::new();
    for i in 0..5i64 {
        let event = Event::with_session_id(EventKind::TaskStart, "abc").with_field("step", i);
        let record = encode(&event).unwrap();
        expected.push_str(std::str::from_utf8(&record).unwrap());
        assert_ok!(writer.write(&record).await);
    }

    assert_ok!(writer.close().await);
    assert_eq!(writer.state().await, WriterState::Closed);

    let received = reader.join().unwrap();
    assert_eq!(received, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_are_not_interleaved() {
    const WRITERS: i64 = 16;

    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let reader = spawn_reader(path.clone());

    let writer = Arc::new(
        PipeWriter::open(PipeTarget::new(&path), WriterOptions::blocking())
            .await
            .unwrap(),
    );

    // Payloads larger than PIPE_BUF would tear without serialization
    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let writer = Arc::clone(&writer);
        handles.push(tokio::spawn(async move {
            let filler = format!("{} ", i).repeat(4096);
            let event = Event::with_session_id(EventKind::TaskOk, "abc")
                .with_field("index", i)
                .with_field("payload", filler);
            writer.write(&encode(&event).unwrap()).await
        }));
    }

    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }
    writer.close().await.unwrap();

    let received = reader.join().unwrap();
    let mut seen: Vec<i64> = received
        .lines()
        .map(|line| {
            let event = decode_str(line).expect("every record arrives whole");
            let index = event.field("index").and_then(|v| v.as_i64()).unwrap();
            let payload = event.field("payload").and_then(|v| v.as_str()).unwrap();
            assert_eq!(payload, format!("{} ", index).repeat(4096));
            index
        })
        .collect();

    seen.sort_unstable();
    assert_eq!(seen, (0..WRITERS).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_nonblocking_open_then_writes_apply_backpressure() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let reader_file = attach_reader(&path);

    let writer = PipeWriter::open(PipeTarget::new(&path), WriterOptions::nonblocking())
        .await
        .unwrap();

    // Well beyond the default 64KiB pipe buffer
    let event = Event::with_session_id(EventKind::TaskOk, "abc")
        .with_field("blob", "x".repeat(256 * 1024));
    let record = encode(&event).unwrap();

    let reader = std::thread::spawn(move || {
        let mut line = String::new();
        BufReader::new(reader_file).read_line(&mut line).unwrap();
        line
    });

    assert_ok!(writer.write(&record).await);
    let line = reader.join().unwrap();

    assert_eq!(line.as_bytes(), record.as_slice());
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_reader_disconnect_closes_writer() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let reader_file = attach_reader(&path);

    let writer = PipeWriter::open(PipeTarget::new(&path), WriterOptions::nonblocking())
        .await
        .unwrap();
    assert_ok!(writer.write(b"kind=task-start session_id=a timestamp=1\n").await);

    drop(reader_file);

    let err = assert_err!(writer.write(b"kind=task-end session_id=a timestamp=2\n").await);
    assert!(matches!(err, PipeError::BrokenPipe(_)));
    assert_eq!(writer.state().await, WriterState::Closed);

    // Closed is terminal for this handle
    assert!(matches!(
        writer.write(b"kind=task-end session_id=a timestamp=3\n").await,
        Err(PipeError::Closed(_))
    ));
    assert!(matches!(writer.connect().await, Err(PipeError::Closed(_))));
}

#[tokio::test]
async fn test_exclusive_lock_rejects_second_writer() {
    let temp = TempDir::new().unwrap();
    let path = make_fifo(temp.path(), "status.fifo");
    let _reader = attach_reader(&path);
    let options = WriterOptions::nonblocking().with_exclusive(true);

    let first = PipeWriter::open(PipeTarget::new(&path), options.clone())
        .await
        .unwrap();

    let second = PipeWriter::open(PipeTarget::new(&path), options.clone()).await;
    assert!(matches!(second, Err(PipeError::TargetLocked(_))));

    first.close().await.unwrap();

    let third = PipeWriter::open(PipeTarget::new(&path), options).await;
    assert!(third.is_ok());

    // The lock lives on the pipe itself; nothing else is created
    let entries = std::fs::read_dir(temp.path()).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_non_fifo_target_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let dir_target = PipeTarget::new(temp.path());

    let result = PipeWriter::open(dir_target, WriterOptions::nonblocking()).await;
    assert!(matches!(result, Err(PipeError::PipeUnavailable { .. })));
}
