//! Append-only disk spool for batches the store would not take.
//!
//! One JSON row per line. Appends are synced before returning. Replay reads
//! a bounded prefix, hands it to the store and streams the remainder into a
//! temp file that is renamed over the spool, so a crash leaves either the
//! old or the new spool. Lines that no longer decode are dropped and counted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::warn;

use super::rows::TelemetryRow;
use super::store::{StoreError, TelemetryStore};

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub corrupt: usize,
    /// Lines still spooled afterwards
    pub remaining: usize,
}

pub struct Spool {
    path: PathBuf,
    /// Serializes appends against replay rewrites
    lock: Mutex<()>,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append rows and fsync.
    pub async fn append(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Number of spooled lines.
    pub async fn pending(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let Some(mut reader) = self.open().await? else {
            return Ok(0);
        };
        let mut count = 0;
        let mut line = Vec::new();
        while next_line(&mut reader, &mut line).await? {
            count += 1;
        }
        Ok(count)
    }

    /// Move up to `limit` spooled lines into `store`.
    ///
    /// Only the prefix is held in memory; the rest is streamed into the
    /// replacement file. If the store rejects the batch the spool is left
    /// untouched.
    pub async fn replay(
        &self,
        store: &dyn TelemetryStore,
        limit: usize,
    ) -> Result<ReplayOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        let Some(mut reader) = self.open().await? else {
            return Ok(ReplayOutcome::default());
        };

        let mut rows = Vec::new();
        let mut corrupt = 0;
        let mut taken = 0;
        let mut line = Vec::new();
        while taken < limit && next_line(&mut reader, &mut line).await? {
            taken += 1;
            match serde_json::from_slice::<TelemetryRow>(&line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(path = %self.path.display(), line = taken, error = %e, "Dropping corrupt spool line");
                    corrupt += 1;
                }
            }
        }
        if taken == 0 {
            return Ok(ReplayOutcome::default());
        }

        if !rows.is_empty() {
            store.insert_batch(&rows).await?;
        }
        let remaining = self.rewrite_rest(&mut reader).await?;

        Ok(ReplayOutcome {
            replayed: rows.len(),
            corrupt,
            remaining,
        })
    }

    async fn open(&self) -> Result<Option<BufReader<fs::File>>, StoreError> {
        match fs::File::open(&self.path).await {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the spool with what `reader` has not consumed yet. Returns
    /// the number of lines kept.
    async fn rewrite_rest(&self, reader: &mut BufReader<fs::File>) -> Result<usize, StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut writer = BufWriter::new(fs::File::create(&tmp).await?);
        let mut remaining = 0;
        let mut line = Vec::new();
        while next_line(reader, &mut line).await? {
            writer.write_all(&line).await?;
            writer.write_all(b"\n").await?;
            remaining += 1;
        }
        writer.flush().await?;

        if remaining == 0 {
            drop(writer);
            fs::remove_file(&tmp).await?;
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(0),
            };
        }

        writer.get_ref().sync_data().await?;
        drop(writer);
        fs::rename(&tmp, &self.path).await?;
        Ok(remaining)
    }
}

/// Read the next non-blank line into `line`, without its terminator.
/// Returns false at end of file.
async fn next_line(reader: &mut BufReader<fs::File>, line: &mut Vec<u8>) -> std::io::Result<bool> {
    loop {
        line.clear();
        if reader.read_until(b'\n', line).await? == 0 {
            return Ok(false);
        }
        while line.last().is_some_and(u8::is_ascii_whitespace) {
            line.pop();
        }
        if !line.is_empty() {
            return Ok(true);
        }
    }
}
