//! Per-file tailing state: an open file, a read cursor, and the bytes of
//! the trailing incomplete line.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::LogLine;

/// Errors from reading a tailed file.
#[derive(Debug, Error)]
pub enum HandleError {
    /// IO error on the underlying file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The downstream line sink was closed while lines were pending.
    #[error("line sink closed")]
    SinkClosed,
}

/// Result type for handle operations.
pub type Result<T> = std::result::Result<T, HandleError>;

/// A stable identity for a file, used to tell "same file re-opened" from
/// "new file at the same path" across rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn from_metadata(metadata: &Metadata) -> Option<FileId> {
        use std::os::unix::fs::MetadataExt;
        Some(FileId {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn from_metadata(_metadata: &Metadata) -> Option<FileId> {
        None
    }
}

/// The tailer's per-file state.
pub(super) struct LogFile {
    /// Registration path; stable across rotations of the underlying file.
    pub(super) pathname: PathBuf,
    /// Open file, or `None` while the path is absent or believed deleted.
    pub(super) file: Option<File>,
    /// Identity of the open (or last open) file, where the platform
    /// provides one.
    pub(super) file_id: Option<FileId>,
    /// Bytes of the trailing incomplete line; never contains a newline.
    pub(super) partial: Vec<u8>,
    /// Time of the last read that consumed at least one byte.
    pub(super) last_read: SystemTime,
    /// Whether the current incarnation of the path was opened because a
    /// Create event was observed for it. Cleared on delete.
    pub(super) seen_create: bool,
}

impl LogFile {
    /// Opens `pathname` for tailing. With `seek_to_end` the cursor starts
    /// at EOF (the initial open on first registration, skipping history);
    /// otherwise at byte 0, for reading a truncated or re-created file from
    /// the start.
    pub(super) fn open(pathname: impl Into<PathBuf>, seek_to_end: bool) -> io::Result<LogFile> {
        let pathname = pathname.into();
        let mut file = File::open(&pathname)?;
        if seek_to_end {
            file.seek(SeekFrom::End(0))?;
        }
        let file_id = file.metadata().ok().and_then(|m| FileId::from_metadata(&m));
        Ok(LogFile {
            pathname,
            file: Some(file),
            file_id,
            partial: Vec::new(),
            last_read: SystemTime::now(),
            seen_create: false,
        })
    }

    /// Opens whatever now sits at the handle's path, cursor at byte 0, and
    /// swaps it in. Returns whether the newly opened file is distinct from
    /// the one the handle previously had open; unknown identity counts as
    /// distinct, so platforms without stable file identifiers always treat
    /// a re-creation as a new file.
    pub(super) fn reopen(&mut self) -> io::Result<bool> {
        let file = File::open(&self.pathname)?;
        let new_id = file.metadata().ok().and_then(|m| FileId::from_metadata(&m));
        let distinct = match (self.file_id, new_id) {
            (Some(old), Some(new)) => old != new,
            _ => true,
        };
        self.file = Some(file);
        self.file_id = new_id;
        Ok(distinct)
    }

    /// Identity of whatever currently sits at the handle's path, if
    /// anything.
    pub(super) fn path_id(&self) -> Option<FileId> {
        std::fs::metadata(&self.pathname)
            .ok()
            .and_then(|m| FileId::from_metadata(&m))
    }

    /// Reads everything currently available, emits complete lines to
    /// `lines`, and carries the remainder in the partial buffer. Returns
    /// the number of bytes consumed.
    ///
    /// Truncation is detected here rather than from an event, because
    /// notifiers do not reliably distinguish truncation from an ordinary
    /// write: when the file is now smaller than the cursor, the cursor
    /// moves back to byte 0 and the partial buffer is discarded, so no
    /// emitted line ever mixes bytes from before and after the truncate.
    pub(super) async fn read(&mut self, lines: &mpsc::Sender<LogLine>) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let size = file.metadata()?.len();
        let position = file.stream_position()?;
        if size < position {
            debug!(
                path = %self.pathname.display(),
                size,
                position,
                "file shrank, reading from the start"
            );
            file.seek(SeekFrom::Start(0))?;
            self.partial.clear();
        }

        let mut buf = Vec::new();
        let consumed = file.read_to_end(&mut buf)?;
        if consumed == 0 {
            return Ok(0);
        }
        self.last_read = SystemTime::now();

        for text in split_lines(&mut self.partial, &buf) {
            send_line(lines, &self.pathname, text).await?;
        }
        trace!(path = %self.pathname.display(), consumed, "read");
        Ok(consumed)
    }

    /// Emits the partial buffer as a complete line and clears it. Called
    /// when a rotation or re-creation means no newline will ever arrive for
    /// the dangling bytes of the old file.
    pub(super) async fn flush_partial(&mut self, lines: &mpsc::Sender<LogLine>) -> Result<()> {
        if self.partial.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.partial);
        send_line(lines, &self.pathname, text).await
    }

    /// Releases the OS handle. The partial buffer and the last file
    /// identity are kept, so a reopen on the same path can still finish a
    /// dangling line and recognise whether the same file came back.
    pub(super) fn close(&mut self) {
        self.file = None;
    }
}

/// Splits `buf` into complete lines, carrying the trailing incomplete line
/// in `partial` across calls. A terminating `\r\n` loses both bytes.
fn split_lines(partial: &mut Vec<u8>, buf: &[u8]) -> Vec<Vec<u8>> {
    let mut complete = Vec::new();
    for &byte in buf {
        if byte == b'\n' {
            let mut text = std::mem::take(partial);
            if text.last() == Some(&b'\r') {
                text.pop();
            }
            complete.push(text);
        } else {
            partial.push(byte);
        }
    }
    complete
}

async fn send_line(lines: &mpsc::Sender<LogLine>, pathname: &Path, text: Vec<u8>) -> Result<()> {
    let text = String::from_utf8_lossy(&text).into_owned();
    lines
        .send(LogLine::new(pathname, text))
        .await
        .map_err(|_| HandleError::SinkClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn channel() -> (mpsc::Sender<LogLine>, mpsc::Receiver<LogLine>) {
        // Large enough that unit-test reads never block on the sink.
        mpsc::channel(256)
    }

    fn drain(rx: &mut mpsc::Receiver<LogLine>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(line) = rx.try_recv() {
            texts.push(line.text);
        }
        texts
    }

    // ─── Line splitting ───

    #[test]
    fn split_lines_carries_partial_across_calls() {
        let mut partial = Vec::new();
        assert!(split_lines(&mut partial, b"a").is_empty());
        assert!(split_lines(&mut partial, b"b").is_empty());
        let complete = split_lines(&mut partial, b"\n");
        assert_eq!(complete, vec![b"ab".to_vec()]);
        assert!(partial.is_empty());
    }

    #[test]
    fn split_lines_strips_single_carriage_return() {
        let mut partial = Vec::new();
        let complete = split_lines(&mut partial, b"x\r\ny\r\r\n");
        assert_eq!(complete, vec![b"x".to_vec(), b"y\r".to_vec()]);
    }

    proptest! {
        /// Re-inserting the newlines into the emitted lines and appending
        /// the surviving partial reconstructs the input, however the input
        /// was chunked.
        #[test]
        fn split_lines_loses_no_bytes(
            content in "[a-z\\n]{0,200}",
            cuts in prop::collection::vec(0usize..200, 0..8),
        ) {
            let bytes = content.as_bytes();
            let mut boundaries: Vec<usize> =
                cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            boundaries.push(0);
            boundaries.push(bytes.len());
            boundaries.sort_unstable();

            let mut partial = Vec::new();
            let mut emitted: Vec<Vec<u8>> = Vec::new();
            for pair in boundaries.windows(2) {
                emitted.extend(split_lines(&mut partial, &bytes[pair[0]..pair[1]]));
            }

            let mut reconstructed = Vec::new();
            for line in &emitted {
                reconstructed.extend_from_slice(line);
                reconstructed.push(b'\n');
            }
            reconstructed.extend_from_slice(&partial);
            prop_assert_eq!(reconstructed, bytes.to_vec());
            prop_assert!(!partial.contains(&b'\n'));
        }
    }

    // ─── Reading ───

    #[tokio::test]
    async fn open_at_end_skips_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "old\n").unwrap();

        let mut handle = LogFile::open(&path, true).unwrap();
        let (tx, mut rx) = channel();
        assert_eq!(handle.read(&tx).await.unwrap(), 0);

        let mut writer = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writer.write_all(b"new\n").unwrap();
        handle.read(&tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["new"]);
    }

    #[tokio::test]
    async fn open_at_start_reads_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "a\nb\n").unwrap();

        let mut handle = LogFile::open(&path, false).unwrap();
        let (tx, mut rx) = channel();
        handle.read(&tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn truncation_discards_partial_and_restarts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut writer = fs::File::create(&path).unwrap();

        let mut handle = LogFile::open(&path, true).unwrap();
        let (tx, mut rx) = channel();

        writer.write_all(b"a\ndangling").unwrap();
        handle.read(&tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["a"]);
        assert_eq!(handle.partial, b"dangling");

        writer.set_len(0).unwrap();
        writer.seek(SeekFrom::Start(0)).unwrap();
        writer.write_all(b"b\n").unwrap();
        handle.read(&tx).await.unwrap();

        // Nothing combines bytes from before and after the truncate.
        assert_eq!(drain(&mut rx), vec!["b"]);
        assert!(handle.partial.is_empty());
    }

    #[tokio::test]
    async fn last_read_updates_only_when_bytes_flow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut writer = fs::File::create(&path).unwrap();

        let mut handle = LogFile::open(&path, true).unwrap();
        let (tx, _rx) = channel();

        let initial = handle.last_read;
        assert_eq!(handle.read(&tx).await.unwrap(), 0);
        assert_eq!(handle.last_read, initial);

        writer.write_all(b"x\n").unwrap();
        assert_eq!(handle.read(&tx).await.unwrap(), 2);
        assert!(handle.last_read >= initial);
    }

    #[tokio::test]
    async fn flush_partial_emits_once_and_clears() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let mut writer = fs::File::create(&path).unwrap();
        writer.write_all(b"dangling").unwrap();

        let mut handle = LogFile::open(&path, false).unwrap();
        let (tx, mut rx) = channel();
        handle.read(&tx).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        handle.flush_partial(&tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["dangling"]);

        // A second flush has nothing left to emit.
        handle.flush_partial(&tx).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn reopen_distinguishes_same_file_from_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "").unwrap();

        let mut handle = LogFile::open(&path, true).unwrap();

        // Same inode still at the path.
        assert!(!handle.reopen().unwrap());

        // Rotate: move the file aside and create a fresh one.
        fs::rename(&path, dir.path().join("log.1")).unwrap();
        fs::write(&path, "").unwrap();
        assert!(handle.reopen().unwrap());
    }

    #[tokio::test]
    async fn close_keeps_partial_for_later_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "dangling").unwrap();

        let mut handle = LogFile::open(&path, false).unwrap();
        let (tx, mut rx) = channel();
        handle.read(&tx).await.unwrap();

        handle.close();
        assert!(handle.file.is_none());
        assert_eq!(handle.partial, b"dangling");

        handle.flush_partial(&tx).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["dangling"]);
    }
}
