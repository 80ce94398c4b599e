use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::entry::LedgerEntry;

/// Errors that can occur during ledger I/O.
#[derive(Debug, thiserror::Error)]
pub enum LedgerWriteError {
    #[error("failed to create ledger directory: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open ledger file: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to append to ledger: {0}")]
    Write(std::io::Error),

    #[error("failed to sync ledger: {0}")]
    Sync(std::io::Error),
}

/// Append-only file writer producing one JSON object per line.
pub struct LedgerWriter {
    file: tokio::fs::File,
    written: u64,
}

impl LedgerWriter {
    /// Open (or create) the ledger at `path` in append mode, creating parent
    /// directories as needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(LedgerWriteError::CreateDir)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(LedgerWriteError::OpenFile)?;

        Ok(Self { file, written: 0 })
    }

    pub async fn append(&mut self, entry: &LedgerEntry) -> Result<(), LedgerWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(LedgerWriteError::Write)?;
        self.written += 1;

        Ok(())
    }

    /// Flush buffered bytes and sync file data to disk. Payout records must
    /// survive a crash right after the DM went out.
    pub async fn sync(&mut self) -> Result<(), LedgerWriteError> {
        self.file.flush().await.map_err(LedgerWriteError::Write)?;
        self.file.sync_data().await.map_err(LedgerWriteError::Sync)
    }

    /// Number of entries appended through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LedgerEvent;

    #[tokio::test]
    async fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.jsonl");

        let mut writer = LedgerWriter::open(&path).await.unwrap();
        writer
            .append(&LedgerEntry::new(LedgerEvent::ProcessStarted, serde_json::json!({})))
            .await
            .unwrap();
        writer
            .append(
                &LedgerEntry::new(LedgerEvent::PaymentCollected, serde_json::json!({}))
                    .with_amount(7),
            )
            .await
            .unwrap();
        writer.sync().await.unwrap();
        assert_eq!(writer.written(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: LedgerEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event, LedgerEvent::PaymentCollected);
        assert_eq!(second.amount, Some(7));
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        for _ in 0..2 {
            let mut writer = LedgerWriter::open(&path).await.unwrap();
            writer
                .append(&LedgerEntry::new(LedgerEvent::PayoutSent, serde_json::json!({})))
                .await
                .unwrap();
            writer.sync().await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
