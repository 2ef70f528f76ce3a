//! End-to-end pipeline tests: real temp files, real subprocesses.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::*;
use futures::StreamExt;
use seedcast_av::ExitKind;
use seedcast_core::{Error, PipelineKey, ResourceKey, Variant};
use seedcast_pipeline::{ByteSource, TranscodeOptions, TranscodeStream};

/// Prints the file size at start, waits until the file holds 100000 bytes,
/// prints the size again.
const GROWTH_SCRIPT: &str = r#"
size() { wc -c < "$1" | tr -d ' '; }
size "$1"
while [ "$(size "$1")" -lt 100000 ]; do sleep 0.05; done
size "$1"
"#;

const SIZE_SCRIPT: &str = r#"wc -c < "$1" | tr -d ' '"#;

const LONG_RUNNING: &str = "exec sleep 30";

/// Prints the starting size, then keeps running like a transcoder
/// following a growing file.
const REPORT_THEN_FOLLOW: &str = r#"wc -c < "$1" | tr -d ' '; exec sleep 30"#;

fn full_key(id: &str) -> PipelineKey {
    PipelineKey::new(ResourceKey::new(id, 0), Variant::Full)
}

/// Read from `stream` until `buf` holds a full line; return that line.
async fn next_line(stream: &mut TranscodeStream, buf: &mut Vec<u8>) -> String {
    loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            return String::from_utf8_lossy(&line).trim().to_string();
        }
        let chunk = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("transcoder output stalled")
            .expect("stream ended before a full line")
            .unwrap();
        buf.extend_from_slice(&chunk);
    }
}

#[tokio::test]
async fn large_file_starts_transcoding_before_download_completes() {
    let h = harness(ScriptInvoker::new(GROWTH_SCRIPT));
    let (tx, source) = channel_source();

    // 100 kB declared, 15 kB minimum: threshold is 10 kB.
    tx.send(chunk(12_000)).await.unwrap();
    let mut stream = h.service.transcode(request("big", 100_000), source).await.unwrap();
    assert_eq!(stream.content_type(), "video/mp4");
    let completion = stream.completion();

    let mut buf = Vec::new();
    assert_eq!(next_line(&mut stream, &mut buf).await, "12000");
    assert_eq!(h.service.active_processes().len(), 1);

    for _ in 0..11 {
        tx.send(chunk(8_000)).await.unwrap();
    }
    drop(tx);

    assert_eq!(next_line(&mut stream, &mut buf).await, "100000");
    assert!(stream.next().await.is_none());

    let outcome = tokio::time::timeout(Duration::from_secs(5), completion.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.bytes_at_start, 12_000);
    assert!(outcome.bytes_at_start < 100_000);
    assert!(outcome.process.unwrap().is_success());
    assert!(outcome.file_removed);

    assert_eq!(h.start_count(), 1);
    assert!(h.temp_files().is_empty());
    assert!(h.service.active_processes().is_empty());
    let service = &h.service;
    assert!(eventually(Duration::from_secs(5), || service.active_downloads().is_empty()).await);
}

#[tokio::test]
async fn small_file_in_one_chunk_starts_exactly_once() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let (tx, source) = channel_source();
    tx.send(chunk(5_000)).await.unwrap();
    drop(tx);

    let stream = h.service.transcode(request("clip", 5_000), source).await.unwrap();
    let completion = stream.completion();
    let out = read_all(stream).await;
    assert_eq!(String::from_utf8_lossy(&out).trim(), "5000");

    let outcome = completion.wait().await.unwrap();
    assert!(outcome.file_removed);
    assert_eq!(h.start_count(), 1);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn source_shorter_than_threshold_starts_on_completion() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let (tx, source) = channel_source();
    tx.send(chunk(3_000)).await.unwrap();

    // Unknown size: the 15 kB minimum applies and is never reached.
    let pending = h.service.transcode(request("short", 0), source);
    tokio::pin!(pending);
    let early = tokio::time::timeout(Duration::from_millis(300), &mut pending).await;
    assert!(early.is_err(), "transcode started before the download finished");
    assert_eq!(h.start_count(), 0);

    drop(tx);
    let stream = pending.await.unwrap();
    let out = read_all(stream).await;
    assert_eq!(String::from_utf8_lossy(&out).trim(), "3000");
    assert_eq!(h.start_count(), 1);
}

#[tokio::test]
async fn second_request_joins_in_flight_download() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let (tx, source) = channel_source();
    tx.send(chunk(12_000)).await.unwrap();
    let first = h
        .service
        .download_until_threshold(request("shared", 100_000), source)
        .await
        .unwrap();

    let polled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&polled);
    let unused: ByteSource = Box::pin(futures::stream::poll_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
        std::task::Poll::Ready(None)
    }));
    let second = h
        .service
        .download_until_threshold(request("shared", 100_000), unused)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert!(!polled.load(Ordering::SeqCst));
    assert_eq!(h.service.active_downloads().len(), 1);
    drop(tx);
}

#[tokio::test]
async fn abort_before_threshold_leaves_no_file() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let (tx, source) = channel_source();
    tx.send(chunk(1_000)).await.unwrap();

    let pending = h.service.transcode(request("aborted", 100_000), source);
    tokio::pin!(pending);
    let written = {
        let service = &h.service;
        let wait = eventually(Duration::from_secs(5), || {
            service
                .active_downloads()
                .first()
                .is_some_and(|s| s.bytes_written == 1_000)
        });
        tokio::select! {
            ok = wait => ok,
            _ = &mut pending => panic!("transcode resolved before abort"),
        }
    };
    assert!(written);
    assert_eq!(h.temp_files().len(), 1);

    assert!(h.service.abort_download(&full_key("aborted")));
    let err = pending.await.unwrap_err();
    assert!(matches!(err, Error::Aborted));
    assert!(h.temp_files().is_empty());
    assert_eq!(h.start_count(), 0);

    // A second abort is a no-op.
    assert!(!h.service.abort_download(&full_key("aborted")));
    drop(tx);
}

#[tokio::test]
async fn threshold_timeout_aborts_download() {
    let h = harness_with(ScriptInvoker::new(SIZE_SCRIPT), |c| c.session_timeout_secs = 1);
    let (tx, source) = channel_source();
    tx.send(chunk(100)).await.unwrap();

    let err = h
        .service
        .transcode(request("slow", 100_000), source)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.is_retryable());
    assert!(h.temp_files().is_empty());
    assert!(h.service.active_downloads().is_empty());
    assert_eq!(h.start_count(), 0);
    drop(tx);
}

#[tokio::test]
async fn dropping_stream_terminates_process_and_deletes_file() {
    let h = harness(ScriptInvoker::new(LONG_RUNNING));
    let (tx, source) = channel_source();
    tx.send(chunk(12_000)).await.unwrap();

    let stream = h.service.transcode(request("leave", 100_000), source).await.unwrap();
    let completion = stream.completion();
    assert_eq!(h.service.active_processes().len(), 1);
    assert_eq!(h.temp_files().len(), 1);

    drop(stream);
    let outcome = tokio::time::timeout(Duration::from_secs(5), completion.wait())
        .await
        .expect("process was not terminated in time")
        .unwrap();
    assert_eq!(outcome.process.unwrap().kind, ExitKind::Terminated);
    assert!(outcome.file_removed);
    assert!(h.temp_files().is_empty());
    assert!(h.service.active_processes().is_empty());

    // The download has nothing left to feed and is stopped too.
    let service = &h.service;
    assert!(eventually(Duration::from_secs(5), || service.active_downloads().is_empty()).await);
    drop(tx);
}

/// Read the next item, failing the test if none arrives in time.
async fn next_item(stream: &mut TranscodeStream) -> Option<std::io::Result<bytes::Bytes>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no item from the transcode stream")
}

#[tokio::test]
async fn source_failure_after_start_ends_stream_with_error() {
    let h = harness(ScriptInvoker::new(REPORT_THEN_FOLLOW));
    let (tx, source) = channel_source();
    tx.send(chunk(12_000)).await.unwrap();

    let mut stream = h.service.transcode(request("cut", 100_000), source).await.unwrap();
    let completion = stream.completion();
    let mut buf = Vec::new();
    assert_eq!(next_line(&mut stream, &mut buf).await, "12000");

    tx.send(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "peer reset",
    )))
    .await
    .unwrap();

    let err = next_item(&mut stream).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    assert!(err.to_string().contains("peer reset"), "unexpected error: {err}");
    assert!(next_item(&mut stream).await.is_none());

    let outcome = completion.wait().await.unwrap();
    assert!(matches!(
        outcome.download_error.as_deref(),
        Some(Error::Source(_))
    ));
    assert_eq!(outcome.process.unwrap().kind, ExitKind::Terminated);
    assert!(outcome.file_removed);
    assert!(h.temp_files().is_empty());
    assert!(h.service.active_processes().is_empty());
}

#[tokio::test]
async fn abort_during_transcode_stops_process_and_reports() {
    let h = harness(ScriptInvoker::new(REPORT_THEN_FOLLOW));
    let (tx, source) = channel_source();
    tx.send(chunk(12_000)).await.unwrap();

    let mut stream = h.service.transcode(request("stop", 100_000), source).await.unwrap();
    let mut buf = Vec::new();
    assert_eq!(next_line(&mut stream, &mut buf).await, "12000");

    assert!(h.service.abort_download(&full_key("stop")));
    let err = next_item(&mut stream).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    assert!(next_item(&mut stream).await.is_none());

    let service = &h.service;
    assert!(eventually(Duration::from_secs(5), || service.active_processes().is_empty()).await);
    assert!(h.temp_files().is_empty());
    drop(tx);
}

#[tokio::test]
async fn finished_download_ends_stream_cleanly() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let (tx, source) = channel_source();
    tx.send(chunk(5_000)).await.unwrap();
    drop(tx);

    let stream = h.service.transcode(request("whole", 5_000), source).await.unwrap();
    let completion = stream.completion();
    // read_all fails the test on any error item.
    let out = read_all(stream).await;
    assert_eq!(String::from_utf8_lossy(&out).trim(), "5000");
    assert!(completion.wait().await.unwrap().download_error.is_none());
}

#[tokio::test]
async fn non_zero_exit_still_cleans_up() {
    let h = harness(ScriptInvoker::new(
        r#"echo "corrupt input" >&2; exit 3"#,
    ));
    let (tx, source) = channel_source();
    tx.send(chunk(5_000)).await.unwrap();
    drop(tx);

    let stream = h.service.transcode(request("broken", 5_000), source).await.unwrap();
    let completion = stream.completion();
    assert!(read_all(stream).await.is_empty());

    let outcome = completion.wait().await.unwrap();
    let process = outcome.process.unwrap();
    assert_eq!(process.kind, ExitKind::Failed { code: Some(3) });
    assert_eq!(process.stderr_tail, vec!["corrupt input"]);
    assert!(outcome.file_removed);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn spawn_failure_is_delivered_on_the_stream() {
    let h = harness(ScriptInvoker::missing());
    let (tx, source) = channel_source();
    tx.send(chunk(5_000)).await.unwrap();
    drop(tx);

    let mut stream = h.service.transcode(request("nobin", 5_000), source).await.unwrap();
    let completion = stream.completion();
    let first = stream.next().await.unwrap();
    assert!(first.unwrap_err().to_string().contains("seedcast-transcoder"));
    assert!(stream.next().await.is_none());

    let outcome = completion.wait().await.unwrap();
    assert!(outcome.process.is_none());
    assert!(outcome.file_removed);
    assert!(h.temp_files().is_empty());
    assert!(h.service.active_processes().is_empty());
}

#[tokio::test]
async fn second_transcode_for_same_key_is_rejected() {
    let h = harness(ScriptInvoker::new(LONG_RUNNING));
    let (tx, source) = channel_source();
    tx.send(chunk(12_000)).await.unwrap();
    let stream = h.service.transcode(request("dup", 100_000), source).await.unwrap();

    // Joins the running download, which already has its process.
    let (_tx2, again) = channel_source();
    let err = h
        .service
        .transcode(request("dup", 100_000), again)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyStreaming(_)));
    assert_eq!(err.http_status(), 409);

    // Once the download is done, the file still belongs to the process.
    drop(tx);
    let service = &h.service;
    assert!(eventually(Duration::from_secs(5), || service.active_downloads().is_empty()).await);
    let (_tx3, third) = channel_source();
    let err = h
        .service
        .transcode(request("dup", 100_000), third)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyStreaming(_)));
    assert_eq!(h.start_count(), 1);

    drop(stream);
}

#[tokio::test]
async fn variants_run_side_by_side() {
    let h = harness(ScriptInvoker::new(LONG_RUNNING));
    let (tx_full, full_source) = channel_source();
    let (tx_remux, remux_source) = channel_source();
    tx_full.send(chunk(12_000)).await.unwrap();
    tx_remux.send(chunk(12_000)).await.unwrap();

    let full = h.service.transcode(request("movie", 100_000), full_source).await.unwrap();
    let remux = h
        .service
        .remux_audio(request("movie", 100_000), remux_source)
        .await
        .unwrap();
    assert_eq!(full.key().variant, Variant::Full);
    assert_eq!(remux.key().variant, Variant::AudioRemux);
    assert_eq!(h.service.active_processes().len(), 2);
    assert_eq!(h.temp_files().len(), 2);

    let (a, b) = (full.completion(), remux.completion());
    drop(full);
    drop(remux);
    a.wait().await.unwrap();
    b.wait().await.unwrap();
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn capacity_limit_rejects_then_recovers() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    let mut senders = Vec::new();
    for id in ["a", "b", "c"] {
        let (tx, source) = channel_source();
        tx.send(chunk(12_000)).await.unwrap();
        h.service
            .download_until_threshold(request(id, 100_000), source)
            .await
            .unwrap();
        senders.push(tx);
    }
    assert_eq!(h.service.active_downloads().len(), 3);

    let (_tx, source) = channel_source();
    let err = h
        .service
        .download(request("d", 100_000), source)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Capacity { limit: 3 }));
    assert!(!err.is_retryable());
    assert_eq!(h.service.active_downloads().len(), 3);

    // Finish "a".
    drop(senders.remove(0));
    let service = &h.service;
    assert!(eventually(Duration::from_secs(5), || service.active_downloads().len() == 2).await);

    let (tx, source) = channel_source();
    tx.send(chunk(2_000)).await.unwrap();
    drop(tx);
    let path = h.service.download(request("d", 2_000), source).await.unwrap();
    assert_eq!(std::fs::metadata(path).unwrap().len(), 2_000);
}

#[tokio::test]
async fn keep_file_leaves_it_for_the_sweeper() {
    let h = harness(ScriptInvoker::new("exit 0"));
    let (tx, source) = channel_source();
    tx.send(chunk(5_000)).await.unwrap();
    drop(tx);

    let stream = h
        .service
        .transcode_with(
            request("kept", 5_000),
            Variant::Full,
            TranscodeOptions { keep_file: true },
            source,
        )
        .await
        .unwrap();
    let completion = stream.completion();
    drop(stream);
    let outcome = completion.wait().await.unwrap();
    assert!(!outcome.file_removed);

    let files = h.temp_files();
    assert_eq!(files.len(), 1);
    let file = std::fs::File::options().write(true).open(&files[0]).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(7 * 3600))
        .unwrap();

    let report = h.service.sweep_now().await;
    assert_eq!(report.removed, 1);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn sweep_removes_unreferenced_orphans() {
    let h = harness(ScriptInvoker::new(SIZE_SCRIPT));
    std::fs::create_dir_all(h.temp_dir()).unwrap();
    let orphan = h.temp_dir().join("crashed-0-abcdef.mkv");
    std::fs::write(&orphan, b"left behind").unwrap();
    let file = std::fs::File::options().write(true).open(&orphan).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(7 * 3600))
        .unwrap();

    let report = h.service.sweep_now().await;
    assert_eq!(report.removed, 1);
    assert!(!orphan.exists());

    // Nothing to do, and no error, once it is gone.
    let report = h.service.sweep_now().await;
    assert_eq!(report.removed, 0);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn destroy_tears_everything_down() {
    let h = harness(ScriptInvoker::new(LONG_RUNNING));
    let (tx_a, source_a) = channel_source();
    tx_a.send(chunk(12_000)).await.unwrap();
    let stream = h.service.transcode(request("a", 100_000), source_a).await.unwrap();
    let completion = stream.completion();

    let (tx_b, source_b) = channel_source();
    tx_b.send(chunk(12_000)).await.unwrap();
    h.service
        .download_until_threshold(request("b", 100_000), source_b)
        .await
        .unwrap();
    assert_eq!(h.temp_files().len(), 2);

    tokio::time::timeout(Duration::from_secs(10), h.service.destroy())
        .await
        .expect("destroy did not finish");

    assert!(h.temp_files().is_empty());
    assert!(h.service.active_downloads().is_empty());
    assert!(h.service.active_processes().is_empty());
    let outcome = completion.get().unwrap();
    assert_eq!(outcome.process.unwrap().kind, ExitKind::Terminated);

    let (_tx, source) = channel_source();
    let err = h.service.transcode(request("c", 10), source).await.unwrap_err();
    assert!(matches!(err, Error::Aborted));

    // Idempotent.
    h.service.destroy().await;
    drop((stream, tx_a, tx_b));
}
