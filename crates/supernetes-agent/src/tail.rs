//! `tail -F` emulation for job output files
//!
//! Lustre and friends don't support inotify, and `tail` itself reverts to
//! polling once per second when it encounters a non-local filesystem. This
//! does the same: poll the file every second, detect inode changes and
//! reopen, and rebuild the reader after every pass because reads stop at the
//! first EOF.

use std::collections::VecDeque;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use supernetes_common::{Error, Result};

/// Follow the file at `path`, sending complete lines (without the trailing
/// newline) into `lines`.
///
/// If `tail` is positive, only the latest `tail` lines of the initial
/// contents are sent before switching to streaming. If `follow` is false,
/// the call returns after the first complete scan. A missing file is
/// tolerated and polled for. Cancellation returns without error.
pub async fn tail_file(
    token: CancellationToken,
    path: &Path,
    lines: mpsc::Sender<Vec<u8>>,
    tail: usize,
    follow: bool,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut file: Option<TailedFile> = None;
    let mut tail_n = tail > 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {} // First tick fires immediately
        }

        if let Some(open) = &file {
            // From tail(1) for `-F`: "The file is closed and reopened when
            // tail detects that the filename being read from has a new inode
            // number."
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| Error::internal("tail", format!("failed to stat file: {e}")))?;

            if metadata.ino() != open.inode {
                file = None;
            }
        }

        // Truncation doesn't matter here: the writing application (Slurm)
        // always continues where it left off.
        if file.is_none() {
            match File::open(path).await {
                Ok(opened) => {
                    let inode = opened
                        .metadata()
                        .await
                        .map_err(|e| Error::internal("tail", format!("failed to stat file: {e}")))?
                        .ino();
                    file = Some(TailedFile {
                        reader: BufReader::new(opened),
                        inode,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue, // Wait again
                Err(e) => {
                    return Err(Error::internal("tail", format!("failed to open file: {e}")))
                }
            }
        }

        let Some(open) = &mut file else { continue };

        let mut buffer = if tail_n {
            Some(VecDeque::with_capacity(tail))
        } else {
            None
        };

        let mut line = Vec::new();
        loop {
            line.clear();
            let n = open
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| Error::internal("tail", format!("failed to scan file: {e}")))?;
            if n == 0 {
                break; // EOF
            }

            if line.last() == Some(&b'\n') {
                line.pop();
            } else {
                // Incomplete line at EOF, the writer isn't done with it yet.
                // Rewind so the next pass re-reads it in full.
                open.reader
                    .seek(std::io::SeekFrom::Current(-(n as i64)))
                    .await
                    .map_err(|e| Error::internal("tail", format!("failed to rewind file: {e}")))?;
                break;
            }

            match &mut buffer {
                Some(buffer) => {
                    // Track the n latest lines only
                    if buffer.len() == tail {
                        buffer.pop_front();
                    }
                    buffer.push_back(line.clone());
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        sent = lines.send(line.clone()) => {
                            if sent.is_err() {
                                return Ok(()); // Receiver is gone
                            }
                        }
                    }
                }
            }
        }

        if let Some(buffer) = buffer {
            // Send the latest lines of the initial pass
            for line in buffer {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    sent = lines.send(line) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        // If following is not requested, we're done
        if !follow {
            return Ok(());
        }

        // Tailing n lines is no longer relevant when following
        tail_n = false;
    }
}

struct TailedFile {
    reader: BufReader<File>,
    inode: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    async fn collect(
        mut rx: mpsc::Receiver<Vec<u8>>,
        count: usize,
        timeout: Duration,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        let deadline = Instant::now() + timeout;
        while lines.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(line)) => lines.push(String::from_utf8(line).unwrap()),
                _ => break,
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_single_pass_without_follow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.out");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        tail_file(token, &path, tx, 0, false).await.unwrap();

        let lines = collect(rx, 3, Duration::from_secs(1)).await;
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_tail_limits_initial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.out");
        std::fs::write(&path, "one\ntwo\nthree\nfour\nfive\n").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        tail_file(token, &path, tx, 2, false).await.unwrap();

        // Exactly the last two lines
        let lines = collect(rx, 5, Duration::from_millis(200)).await;
        assert_eq!(lines, vec!["four", "five"]);
    }

    #[tokio::test]
    async fn test_waits_for_file_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("42.out");

        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let tail_token = token.clone();
        let tail_path = path.clone();
        let handle =
            tokio::spawn(async move { tail_file(tail_token, &tail_path, tx, 0, true).await });

        // The file appears after the first poll cycle
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "2024-01-01T00:00:00Z hello world").unwrap();
        drop(f);

        let lines = collect(rx, 1, Duration::from_secs(3)).await;
        assert_eq!(lines, vec!["2024-01-01T00:00:00Z hello world"]);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_returns_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.out");

        let (tx, _rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        token.cancel();

        tail_file(token, &path, tx, 0, true).await.unwrap();
    }
}
