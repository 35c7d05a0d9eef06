//! Append-only raw output logs, one file per session.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Directory holding `<session_id>.jsonl` raw logs.
#[derive(Debug, Clone)]
pub struct SessionLogs {
    dir: PathBuf,
}

impl SessionLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }

    /// Create (or append to) the log at `path`.
    pub async fn open_writer(&self, path: &Path) -> Result<SessionLogWriter, DatabaseError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(SessionLogWriter {
            file,
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    /// Read every raw line back. A missing file is an empty log.
    pub async fn read_lines(path: &Path) -> Result<Vec<String>, DatabaseError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            out.push(line);
        }
        Ok(out)
    }
}

/// Writer for one session's raw log.
#[derive(Debug)]
pub struct SessionLogWriter {
    file: File,
    path: PathBuf,
    lines: u64,
}

impl SessionLogWriter {
    /// Append one raw line and flush it to the OS before returning.
    pub async fn append(&mut self, line: &str) -> Result<(), DatabaseError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf).await?;
        self.file.flush().await?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and sync to disk.
    pub async fn close(&mut self) -> Result<(), DatabaseError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tracing::debug!(path = %self.path.display(), lines = self.lines, "Session log closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines
    }
}
