//! Background checkpoint saver: one task per job, draining a FIFO queue of
//! document snapshots so routine saves never block the fetch loop.
//!
//! Each request carries everything the save needs (a cloned document and the
//! destination path); the scheduler never reads the live document, so it can
//! never observe one mid-mutation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::blob::BlobStore;
use crate::book::BookDocument;
use crate::error::DownloadError;

struct SaveRequest {
    snapshot: BookDocument,
    path: PathBuf,
    /// Present for error-path flushes that must observe the save result.
    ack: Option<oneshot::Sender<Result<(), DownloadError>>>,
}

pub struct CheckpointScheduler {
    tx: mpsc::UnboundedSender<SaveRequest>,
    handle: JoinHandle<()>,
}

impl CheckpointScheduler {
    /// Spawn the consumer task. When a blob store is configured, each
    /// successful local checkpoint is also mirrored to
    /// `<remote_dir>/Temp/<file name>` (warn-only).
    pub fn spawn(blob: Option<Arc<dyn BlobStore>>, remote_dir: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SaveRequest>();

        let handle = tokio::spawn(async move {
            // Single consumer: requests complete strictly in submission
            // order, at most one save in flight.
            while let Some(request) = rx.recv().await {
                let SaveRequest {
                    snapshot,
                    path,
                    ack,
                } = request;
                let chapters = snapshot.chapter_count();
                let save_path = path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    crate::epub::save(&snapshot, &save_path)
                })
                .await
                .map_err(|err| DownloadError::Persistence(anyhow::anyhow!("save task: {err}")))
                .and_then(|r| r);

                match &result {
                    Ok(()) => {
                        tracing::info!(chapters, path = %path.display(), "checkpoint saved");
                        if let Some(blob) = &blob {
                            mirror_checkpoint(blob.as_ref(), &path, &remote_dir).await;
                        }
                    }
                    Err(err) => {
                        tracing::error!(chapters, path = %path.display(), ?err, "checkpoint save failed");
                    }
                }

                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
        });

        Self { tx, handle }
    }

    /// Queue a checkpoint without waiting for it.
    pub fn enqueue(&self, snapshot: BookDocument, path: PathBuf) {
        let request = SaveRequest {
            snapshot,
            path,
            ack: None,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!("checkpoint scheduler is gone; dropping checkpoint");
        }
    }

    /// Queue a checkpoint and block until it (and everything queued before
    /// it) has been processed. Used on the error path so no fetched work is
    /// lost before the job aborts.
    pub async fn flush(
        &self,
        snapshot: BookDocument,
        path: PathBuf,
    ) -> Result<(), DownloadError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = SaveRequest {
            snapshot,
            path,
            ack: Some(ack_tx),
        };
        self.tx
            .send(request)
            .map_err(|_| DownloadError::Persistence(anyhow::anyhow!("checkpoint scheduler is gone")))?;
        ack_rx
            .await
            .map_err(|_| DownloadError::Persistence(anyhow::anyhow!("checkpoint scheduler dropped the request")))?
    }

    /// Stop accepting work and give any queued saves a bounded grace period
    /// to finish.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.tx);
        if tokio::time::timeout(grace, self.handle).await.is_err() {
            tracing::warn!(?grace, "checkpoint scheduler did not drain within grace period");
        }
    }
}

async fn mirror_checkpoint(blob: &dyn BlobStore, path: &std::path::Path, remote_dir: &str) {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let remote_path = format!("{}/Temp/{file_name}", remote_dir.trim_end_matches('/'));
    match blob.upload(path, &remote_path).await {
        Ok(url) => tracing::info!(%url, "checkpoint mirrored to remote store"),
        Err(err) => tracing::warn!(?err, remote = %remote_path, "checkpoint mirror failed"),
    }
}
