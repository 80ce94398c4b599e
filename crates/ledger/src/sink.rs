use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::entry::LedgerEntry;
use crate::writer::LedgerWriter;

/// Channel buffer between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Sync the writer at most every this many seconds when the channel is idle.
const SYNC_INTERVAL_SECS: u64 = 1;

/// Cloneable handle for submitting [`LedgerEntry`] values to the background
/// writer. A disabled sink accepts entries and drops them.
#[derive(Clone)]
pub struct LedgerSink {
    tx: Option<mpsc::Sender<LedgerEntry>>,
}

/// Owner of the background writer task.
///
/// Sink clones can outlive the code that wants the ledger closed (a
/// connection task still winding down, for example), so the writer is not
/// tied to the last clone going away. [`LedgerHandle::shutdown`] closes the
/// channel, writes whatever is already queued and waits for the final sync.
pub struct LedgerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl LedgerSink {
    /// Spawn the background writer and return a `(sink, handle)` pair.
    ///
    /// The task appends every received entry and syncs after a second of
    /// inactivity. It exits after a final sync, either on
    /// [`LedgerHandle::shutdown`] or once every sink clone is dropped.
    /// I/O errors are logged and the entry is skipped; the task never panics.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, LedgerHandle), crate::writer::LedgerWriteError> {
        let (tx, rx) = mpsc::channel::<LedgerEntry>(CHANNEL_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();

        let writer = LedgerWriter::open(path).await?;
        let task = tokio::spawn(run_writer_loop(writer, rx, stop_rx));

        Ok((
            Self { tx: Some(tx) },
            LedgerHandle {
                stop: Some(stop_tx),
                task,
            },
        ))
    }

    /// A sink that discards everything. Used by components built without a
    /// ledger and in tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Submit an entry, waiting for channel capacity if needed. After
    /// shutdown the entry is dropped with a warning.
    pub async fn log(&self, entry: LedgerEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event = ?err.0.event,
                "ledger channel closed, entry dropped"
            );
        }
    }
}

impl LedgerHandle {
    /// Stop accepting entries, drain the queue to disk and wait for the
    /// writer to finish. Returns the number of entries it wrote.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            // The writer may already be gone if every sink was dropped.
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(written) => written,
            Err(err) => {
                tracing::error!(%err, "ledger writer task failed");
                0
            }
        }
    }
}

async fn run_writer_loop(
    mut writer: LedgerWriter,
    mut rx: mpsc::Receiver<LedgerEntry>,
    mut stop: oneshot::Receiver<()>,
) -> u64 {
    let sync_interval = tokio::time::Duration::from_secs(SYNC_INTERVAL_SECS);
    let mut dirty = false;
    let mut stop_seen = false;

    loop {
        tokio::select! {
            requested = &mut stop, if !stop_seen => {
                stop_seen = true;
                // A dropped handle is not a shutdown request.
                if requested.is_ok() {
                    // Queued entries are still delivered; new sends fail.
                    rx.close();
                }
            }
            next = tokio::time::timeout(sync_interval, rx.recv()) => match next {
                Ok(Some(entry)) => {
                    if let Err(err) = writer.append(&entry).await {
                        tracing::error!(%err, event = ?entry.event, "failed to append ledger entry");
                    } else {
                        dirty = true;
                    }
                }
                Ok(None) => {
                    if dirty {
                        if let Err(err) = writer.sync().await {
                            tracing::error!(%err, "failed to sync ledger on shutdown");
                        }
                    }
                    tracing::debug!(entries = writer.written(), "ledger writer shutting down");
                    return writer.written();
                }
                Err(_) => {
                    if dirty {
                        if let Err(err) = writer.sync().await {
                            tracing::error!(%err, "periodic ledger sync failed");
                        } else {
                            dirty = false;
                        }
                    }
                }
            }
        }
    }
}
