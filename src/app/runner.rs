use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::app::job_store::JobStore;
use crate::app::model::{JobStatus, StartJobRequest};
use crate::blob::BlobStore;
use crate::download::{DownloadOptions, Downloader, Phase, Progress};
use crate::source::SiteSource;

/// Runs download jobs, bounding how many are in flight at once. Each job
/// gets its own `Downloader` (and with it its own checkpoint scheduler and
/// snapshot discipline); the runner only shares the job store and the blob
/// store handle.
pub struct JobRunner {
    job_store: Arc<dyn JobStore>,
    blob: Option<Arc<dyn BlobStore>>,
    options: DownloadOptions,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        blob: Option<Arc<dyn BlobStore>>,
        options: DownloadOptions,
        max_concurrency: usize,
    ) -> Self {
        Self {
            job_store,
            blob,
            options,
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the whole runner is asked to stop; every job's
    /// own token is a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue a job. Returns immediately; the job runs when a slot frees up.
    pub fn spawn_job(self: &Arc<Self>, job_id: String, request: StartJobRequest) {
        let runner = Arc::clone(self);
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            runner.run_job(&job_id, request).await;
        });
    }

    pub async fn run_job(&self, job_id: &str, request: StartJobRequest) {
        if let Err(err) = self.try_run_job(job_id, &request).await {
            tracing::error!(job_id, ?err, "job failed");
            let _ = self.mark_failed(job_id, format!("{err:#}")).await;
        }
    }

    async fn try_run_job(&self, job_id: &str, request: &StartJobRequest) -> anyhow::Result<()> {
        let mut job = self
            .job_store
            .get(job_id)
            .await
            .context("load job")?
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;

        job.status = JobStatus::InProgress;
        job.started_at = Some(Utc::now());
        job.message = "starting".to_string();
        self.job_store.put(&job).await.context("save job")?;

        let novel_url = Url::parse(&request.url).context("parse novel url")?;
        let source = Arc::new(SiteSource::new(request.cookie.clone()).context("build source")?);

        let progress_store = Arc::clone(&self.job_store);
        let progress_job = job.clone();
        let last_percent = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let downloader = Downloader::new(source, self.blob.clone(), self.options.clone())
            .with_progress(Arc::new(move |progress| {
                let (percent, message) = describe_progress(&progress);
                // Persist only when the coarse percent moves.
                if last_percent.swap(percent, std::sync::atomic::Ordering::Relaxed) == percent {
                    return;
                }
                let store = Arc::clone(&progress_store);
                let mut job = progress_job.clone();
                job.progress_percent = percent;
                job.message = message;
                tokio::spawn(async move {
                    if let Err(err) = store.put(&job).await {
                        tracing::warn!(?err, "failed to persist progress update");
                    }
                });
            }));

        let cancel = self.shutdown.child_token();
        let outcome = downloader.run(&novel_url, &cancel).await?;

        job.status = JobStatus::Completed;
        job.progress_percent = 100;
        job.message = if outcome.cancelled {
            "cancelled; partial artifact saved".to_string()
        } else {
            "done".to_string()
        };
        job.finished_at = Some(Utc::now());
        job.file_path = Some(outcome.file_path);
        job.remote_url = outcome.remote_url;
        job.chapter_count = Some(outcome.chapter_count);
        self.job_store.put(&job).await.context("save job")?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, message: String) -> anyhow::Result<()> {
        let Some(mut job) = self.job_store.get(job_id).await? else {
            return Ok(());
        };
        job.status = JobStatus::Failed;
        job.message = "failed".to_string();
        job.error = Some(message);
        job.finished_at = Some(Utc::now());
        self.job_store.put(&job).await?;
        Ok(())
    }
}

/// Map pipeline progress onto the coarse percent scale the status surface
/// exposes. Fetching spans 10–90%.
fn describe_progress(progress: &Progress) -> (u32, String) {
    match progress.phase {
        Phase::ResolveExisting => (2, "resolving existing artifact".to_string()),
        Phase::CreateOrLoad => (5, "preparing document".to_string()),
        Phase::ComputeDelta => (8, "computing missing chapters".to_string()),
        Phase::Fetching => {
            let span = 80u32;
            let done = if progress.worklist == 0 {
                span
            } else {
                (progress.fetched * span as usize / progress.worklist) as u32
            };
            (
                10 + done.min(span),
                format!(
                    "fetching chapters ({}/{})",
                    progress.fetched, progress.worklist
                ),
            )
        }
        Phase::Finalizing => (92, "writing final artifact".to_string()),
        Phase::Uploading => (96, "uploading artifact".to_string()),
        Phase::Done => (100, "done".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(phase: Phase, fetched: usize, worklist: usize) -> Progress {
        Progress {
            phase,
            fetched,
            worklist,
            chapter_count: fetched,
        }
    }

    #[test]
    fn fetch_progress_spans_ten_to_ninety() {
        assert_eq!(describe_progress(&progress(Phase::Fetching, 0, 100)).0, 10);
        assert_eq!(describe_progress(&progress(Phase::Fetching, 50, 100)).0, 50);
        assert_eq!(describe_progress(&progress(Phase::Fetching, 100, 100)).0, 90);
    }

    #[test]
    fn empty_worklist_reports_fetch_complete() {
        assert_eq!(describe_progress(&progress(Phase::Fetching, 0, 0)).0, 90);
    }

    #[test]
    fn done_is_one_hundred() {
        assert_eq!(describe_progress(&progress(Phase::Done, 3, 3)).0, 100);
    }
}
