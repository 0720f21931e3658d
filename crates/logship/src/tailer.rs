// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File following with live-only semantics, plus a bounded backfill.
//!
//! # Lifecycle
//!
//! ```text
//!        ┌──────────── open failed: wait REOPEN_DELAY ───────────┐
//!        v                                                       │
//!   ┌─────────┐  ok   ┌──────────────┐  EOF   ┌───────────────┐  │
//!   │  open   │ ────> │ read lines   │ ─────> │ same file?    │ ─┘ (gone)
//!   │ by path │       │ emit events  │ <───── │ wait POLL     │
//!   └─────────┘       └──────────────┘  yes   └───────┬───────┘
//!        ^                                            │ rotated / truncated
//!        └───────────── reopen, read from start ──────┘
//! ```
//!
//! The first open seeks to the end of the file so only lines appended after
//! startup are shipped. A missing or unreadable file is expected transient
//! state and is retried forever. When the same file shows up again at the
//! path, reading resumes after the last complete line it already emitted.
//!
//! Events go to an [`EventSink`] through a non-blocking put. A rejected put
//! is a drop: it is logged and counted, never retried and never surfaced to
//! the read loop.
//!
//! Cancellation is checked between reads and while waiting, so a cancelled
//! tailer returns within one poll interval.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::EventSink;
use crate::constants::{POLL_DELAY, REOPEN_DELAY};
use crate::event::LogEvent;
use crate::host::SystemInfo;

/// Errors from the bounded backfill. The continuous tailer never fails.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Why a follow pass over one open file ended.
#[derive(Debug, PartialEq, Eq)]
enum FollowOutcome {
    Cancelled,
    /// The path now refers to another file or the file shrank.
    Replaced,
    /// The path disappeared or reading failed. The same file may return.
    Lost,
}

/// Where to position a freshly opened file.
#[derive(Debug, Clone, Copy)]
enum StartAt {
    /// Only lines appended from now on.
    End,
    Beginning,
    /// Continue after the last complete line if the path still refers to
    /// the same file and it has not shrunk; otherwise read from the start.
    Resume(FileIdentity, u64),
}

/// Identifies the file behind a path so a rotated replacement can be told
/// apart from the file already being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        FileIdentity {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(_metadata: &std::fs::Metadata) -> Self {
        FileIdentity {}
    }
}

/// Follows one file and emits each appended line as a [`LogEvent`].
pub struct FileTailer<S> {
    path: PathBuf,
    source_type: String,
    system_info: Arc<SystemInfo>,
    sink: S,
    cancel_token: CancellationToken,
    reopen_delay: Duration,
    poll_delay: Duration,
    dropped: u64,
}

impl<S: EventSink> FileTailer<S> {
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        source_type: impl Into<String>,
        system_info: Arc<SystemInfo>,
        sink: S,
        cancel_token: CancellationToken,
    ) -> Self {
        FileTailer {
            path: absolute(path.into()),
            source_type: source_type.into(),
            system_info,
            sink,
            cancel_token,
            reopen_delay: REOPEN_DELAY,
            poll_delay: POLL_DELAY,
            dropped: 0,
        }
    }

    /// Overrides the reopen and poll delays.
    #[must_use]
    pub fn with_delays(mut self, reopen_delay: Duration, poll_delay: Duration) -> Self {
        self.reopen_delay = reopen_delay;
        self.poll_delay = poll_delay;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tails until the cancellation token fires.
    pub async fn run(mut self) {
        info!("TAILER | Tailing {} (type: {})", self.path.display(), self.source_type);
        let mut start = StartAt::End;
        // Kept open while waiting to reopen so its inode cannot be reused by
        // a new file at the same path.
        let mut _held: Option<File> = None;

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            let (file, identity, offset) = match self.open(start).await {
                Ok(opened) => {
                    _held = None;
                    opened
                }
                Err(e) => {
                    warn!(
                        "TAILER | Cannot open {}: {}, retrying in {:?}",
                        self.path.display(),
                        e,
                        self.reopen_delay
                    );
                    if !self.pause(self.reopen_delay).await {
                        break;
                    }
                    continue;
                }
            };

            let (outcome, committed, file) = self.follow(file, identity, offset).await;
            match outcome {
                FollowOutcome::Cancelled => break,
                FollowOutcome::Replaced => {
                    info!(
                        "TAILER | {} was rotated or truncated, reopening",
                        self.path.display()
                    );
                    start = StartAt::Beginning;
                }
                FollowOutcome::Lost => {
                    start = StartAt::Resume(identity, committed);
                    _held = Some(file);
                    if !self.pause(self.reopen_delay).await {
                        break;
                    }
                }
            }
        }

        debug!(
            "TAILER | Stopped tailing {} ({} lines dropped)",
            self.path.display(),
            self.dropped
        );
    }

    async fn open(&self, start: StartAt) -> std::io::Result<(File, FileIdentity, u64)> {
        let mut file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        let identity = FileIdentity::of(&metadata);
        let offset = match start {
            StartAt::End => file.seek(SeekFrom::End(0)).await?,
            StartAt::Beginning => 0,
            StartAt::Resume(previous, committed)
                if previous == identity && metadata.len() >= committed =>
            {
                debug!(
                    "TAILER | {} is back, resuming at byte {}",
                    self.path.display(),
                    committed
                );
                file.seek(SeekFrom::Start(committed)).await?
            }
            StartAt::Resume(..) => 0,
        };
        Ok((file, identity, offset))
    }

    /// Reads lines until cancelled or the file goes away. Also returns the
    /// offset just past the last complete line, and the file itself.
    async fn follow(
        &mut self,
        file: File,
        identity: FileIdentity,
        mut offset: u64,
    ) -> (FollowOutcome, u64, File) {
        let mut reader = BufReader::new(file);
        let mut pending: Vec<u8> = Vec::new();

        let outcome = loop {
            if self.cancel_token.is_cancelled() {
                break FollowOutcome::Cancelled;
            }

            match reader.read_until(b'\n', &mut pending).await {
                Ok(0) => {
                    if let Some(outcome) = self.check_replaced(identity, offset).await {
                        break outcome;
                    }
                    if !self.pause(self.poll_delay).await {
                        break FollowOutcome::Cancelled;
                    }
                }
                Ok(n) => {
                    offset += n as u64;
                    if pending.last() == Some(&b'\n') {
                        let line = decode_line(&pending);
                        pending.clear();
                        self.emit(line);
                    }
                }
                Err(e) => {
                    warn!("TAILER | Error reading {}: {}", self.path.display(), e);
                    break FollowOutcome::Lost;
                }
            }
        };

        if !pending.is_empty() && outcome == FollowOutcome::Replaced {
            debug!(
                "TAILER | Discarding {} bytes of unterminated line from {}",
                pending.len(),
                self.path.display()
            );
        }
        (outcome, offset - pending.len() as u64, reader.into_inner())
    }

    async fn check_replaced(&self, identity: FileIdentity, offset: u64) -> Option<FollowOutcome> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => {
                if FileIdentity::of(&metadata) != identity || metadata.len() < offset {
                    Some(FollowOutcome::Replaced)
                } else {
                    None
                }
            }
            Err(e) => {
                debug!("TAILER | {} is gone: {}", self.path.display(), e);
                Some(FollowOutcome::Lost)
            }
        }
    }

    fn emit(&mut self, line: String) {
        let event = LogEvent::new(line, self.source_type.as_str(), &self.path, &self.system_info);
        if !self.sink.try_put(event) {
            self.dropped += 1;
            warn!(
                "BUFFER | Buffer full, dropping line from {} ({} dropped so far)",
                self.path.display(),
                self.dropped
            );
        }
    }

    /// Sleeps for `delay`; returns `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel_token.cancelled() => false,
        }
    }
}

/// Reads up to `max_lines` lines from the start of `path` (0 = no limit).
///
/// Stops early, without error, the first time the sink rejects an event.
/// Returns the number of events accepted.
pub async fn read_existing<S: EventSink>(
    path: &Path,
    source_type: &str,
    system_info: &SystemInfo,
    sink: &S,
    max_lines: usize,
) -> Result<usize, TailError> {
    let path = absolute(path.to_path_buf());
    let file = File::open(&path).await.map_err(|source| TailError::Open {
        path: path.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut count = 0;

    while max_lines == 0 || count < max_lines {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|source| TailError::Read {
                path: path.clone(),
                source,
            })?;
        if n == 0 {
            break;
        }

        let event = LogEvent::new(decode_line(&raw), source_type, &path, system_info);
        if !sink.try_put(event) {
            warn!("BUFFER | Buffer full during initial load of {}", path.display());
            break;
        }
        count += 1;
    }

    info!("TAILER | Read {} existing lines from {}", count, path.display());
    Ok(count)
}

/// Strips the line terminator (`\n` or `\r\n`) and decodes lossily.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};
    use tracing::Instrument;
    use tracing_test::traced_test;

    const FAST_REOPEN: Duration = Duration::from_millis(20);
    const FAST_POLL: Duration = Duration::from_millis(10);
    const SETTLE: Duration = Duration::from_millis(150);

    fn system_info() -> Arc<SystemInfo> {
        Arc::new(SystemInfo {
            hostname: "tail-host".to_string(),
            os_family: "linux".to_string(),
            os_version: "x86_64".to_string(),
            agent_version: "0.1.0".to_string(),
            tags: vec!["t".to_string()],
        })
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn spawn_tailer(
        path: &Path,
        buffer: &EventBuffer,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let tailer = FileTailer::new(path, "app", system_info(), buffer.clone(), token.clone())
            .with_delays(FAST_REOPEN, FAST_POLL);
        (token, tokio::spawn(tailer.run()))
    }

    async fn drain(buffer: &EventBuffer, expected: usize) -> Vec<String> {
        let mut lines = Vec::new();
        timeout(Duration::from_secs(5), async {
            while lines.len() < expected {
                if let Some(event) = buffer.take().await {
                    lines.push(event.raw_log().to_string());
                }
            }
        })
        .await
        .expect("timed out waiting for tailed lines");
        lines
    }

    #[tokio::test]
    async fn test_only_appended_lines_are_emitted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");

        let buffer = EventBuffer::new(16);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "a\nb\nc\n");

        assert_eq!(drain(&buffer, 3).await, vec!["a", "b", "c"]);
        token.cancel();
        handle.await.unwrap();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_events_carry_source_and_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.log");
        append(&path, "");

        let buffer = EventBuffer::new(4);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;
        append(&path, "hello\n");

        let event = timeout(Duration::from_secs(5), buffer.take())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.raw_log(), "hello");
        assert_eq!(event.source_type(), "app");
        assert_eq!(event.metadata().hostname, "tail-host");
        assert_eq!(event.metadata().tags, vec!["t"]);
        assert_eq!(
            PathBuf::from(&event.metadata().source_file),
            std::path::absolute(&path).unwrap()
        );

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.log");
        append(&path, "");

        let buffer = EventBuffer::new(4);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "par");
        sleep(SETTLE).await;
        assert!(buffer.is_empty());

        append(&path, "tial\r\nnext\n");
        assert_eq!(drain(&buffer, 2).await, vec!["partial", "next"]);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_picked_up_when_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.log");

        let buffer = EventBuffer::new(4);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "");
        sleep(SETTLE).await;
        append(&path, "created\n");

        assert_eq!(drain(&buffer, 1).await, vec!["created"]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_file_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunc.log");
        append(&path, "");

        let buffer = EventBuffer::new(8);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "one\ntwo\n");
        assert_eq!(drain(&buffer, 2).await, vec!["one", "two"]);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        sleep(SETTLE).await;
        append(&path, "fresh\n");

        assert_eq!(drain(&buffer, 1).await, vec!["fresh"]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unterminated_line_dropped_on_truncation_is_logged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.log");
        append(&path, "");

        let buffer = EventBuffer::new(8);
        let token = CancellationToken::new();
        let tailer = FileTailer::new(&path, "app", system_info(), buffer.clone(), token.clone())
            .with_delays(FAST_REOPEN, FAST_POLL);
        let handle = tokio::spawn(tailer.run().in_current_span());
        sleep(SETTLE).await;

        append(&path, "whole\nhalf");
        assert_eq!(drain(&buffer, 1).await, vec!["whole"]);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        sleep(SETTLE).await;
        append(&path, "next\n");

        assert_eq!(drain(&buffer, 1).await, vec!["next"]);
        token.cancel();
        handle.await.unwrap();
        assert!(logs_contain("Discarding 4 bytes of unterminated line"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotated_file_is_followed_by_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rotate.log");
        append(&path, "");

        let buffer = EventBuffer::new(8);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "before\n");
        assert_eq!(drain(&buffer, 1).await, vec!["before"]);

        std::fs::rename(&path, dir.path().join("rotate.log.1")).unwrap();
        append(&path, "after rotation\n");

        assert_eq!(drain(&buffer, 1).await, vec!["after rotation"]);
        token.cancel();
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_moved_away_and_back_is_not_reread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let aside = dir.path().join("app.log.tmp");
        append(&path, "");

        let buffer = EventBuffer::new(8);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "one\ntwo\nthr");
        assert_eq!(drain(&buffer, 2).await, vec!["one", "two"]);

        std::fs::rename(&path, &aside).unwrap();
        sleep(Duration::from_millis(30)).await;
        std::fs::rename(&aside, &path).unwrap();
        sleep(SETTLE).await;

        append(&path, "ee\nfour\n");
        assert_eq!(drain(&buffer, 2).await, vec!["three", "four"]);
        token.cancel();
        handle.await.unwrap();
        assert!(buffer.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_different_file_after_gap_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let buffer = EventBuffer::new(8);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "old\n");
        assert_eq!(drain(&buffer, 1).await, vec!["old"]);

        std::fs::remove_file(&path).unwrap();
        sleep(SETTLE).await;
        append(&path, "new one\nnew two\n");

        assert_eq!(drain(&buffer, 2).await, vec!["new one", "new two"]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_sink_drops_without_blocking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("burst.log");
        append(&path, "");

        let buffer = EventBuffer::new(1);
        let (token, handle) = spawn_tailer(&path, &buffer);
        sleep(SETTLE).await;

        append(&path, "1\n2\n3\n");
        timeout(Duration::from_secs(5), async {
            while buffer.dropped() < 2 {
                sleep(FAST_POLL).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.take().await.unwrap().raw_log(), "1");
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_tailer_waiting_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let buffer = EventBuffer::new(1);
        let token = CancellationToken::new();
        // Default delays: cancellation must not wait out the 5s reopen delay.
        let tailer = FileTailer::new(
            dir.path().join("never.log"),
            "app",
            system_info(),
            buffer,
            token.clone(),
        );
        let handle = tokio::spawn(tailer.run());

        sleep(Duration::from_millis(50)).await;
        token.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("tailer did not stop after cancellation")
            .unwrap();
    }

    #[derive(Default)]
    struct LimitedSink {
        limit: usize,
        accepted: Mutex<Vec<LogEvent>>,
    }

    impl EventSink for LimitedSink {
        fn try_put(&self, event: LogEvent) -> bool {
            let mut accepted = self.accepted.lock().unwrap();
            if accepted.len() >= self.limit {
                return false;
            }
            accepted.push(event);
            true
        }
    }

    #[tokio::test]
    async fn test_read_existing_respects_max_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.log");
        append(&path, "l1\nl2\nl3\nl4\nl5\n");
        let sink = LimitedSink {
            limit: 100,
            ..Default::default()
        };

        let count = read_existing(&path, "app", &system_info(), &sink, 2)
            .await
            .unwrap();

        assert_eq!(count, 2);
        let lines: Vec<String> = sink
            .accepted
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.raw_log().to_string())
            .collect();
        assert_eq!(lines, vec!["l1", "l2"]);
    }

    #[tokio::test]
    async fn test_read_existing_without_limit_reads_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.log");
        append(&path, "l1\nl2\nno newline at end");
        let sink = LimitedSink {
            limit: 100,
            ..Default::default()
        };

        let count = read_existing(&path, "app", &system_info(), &sink, 0)
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            sink.accepted.lock().unwrap()[2].raw_log(),
            "no newline at end"
        );
    }

    #[tokio::test]
    async fn test_read_existing_stops_when_sink_is_full() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("existing.log");
        append(&path, "l1\nl2\nl3\nl4\n");
        let sink = LimitedSink {
            limit: 3,
            ..Default::default()
        };

        let count = read_existing(&path, "app", &system_info(), &sink, 10)
            .await
            .unwrap();

        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_read_existing_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sink = LimitedSink::default();

        let result = read_existing(&dir.path().join("nope.log"), "app", &system_info(), &sink, 0).await;

        assert!(matches!(result, Err(TailError::Open { .. })));
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"windows\r\n"), "windows");
        assert_eq!(decode_line(b"no terminator"), "no terminator");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }
}
