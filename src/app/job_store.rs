use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::app::model::Job;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>>;
    async fn put(&self, job: &Job) -> anyhow::Result<()>;
}

/// Jobs as JSON files under `<base>/jobs/<id>/job.json`, written with a
/// tmp-then-rename so a crash never leaves a torn record.
#[derive(Debug, Clone)]
pub struct LocalFsJobStore {
    base_dir: PathBuf,
}

impl LocalFsJobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn job_json_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("jobs").join(job_id).join("job.json")
    }
}

#[async_trait]
impl JobStore for LocalFsJobStore {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let path = self.job_json_path(job_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read job: {}", path.display()));
            }
        };
        let job = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse job: {}", path.display()))?;
        Ok(Some(job))
    }

    async fn put(&self, job: &Job) -> anyhow::Result<()> {
        let path = self.job_json_path(&job.job_id);
        write_json_atomic(&path, job).await
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create job dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize job json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::model::{Job, JobStatus};

    #[tokio::test]
    async fn put_then_get_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalFsJobStore::new(dir.path());

        let mut job = Job::queued("job-1", "https://tangthuvien.net/doc-truyen/x");
        store.put(&job).await?;

        job.status = JobStatus::InProgress;
        job.progress_percent = 40;
        store.put(&job).await?;

        let loaded = store.get("job-1").await?.expect("job present");
        assert_eq!(loaded.status, JobStatus::InProgress);
        assert_eq!(loaded.progress_percent, 40);
        Ok(())
    }

    #[tokio::test]
    async fn missing_job_is_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalFsJobStore::new(dir.path());
        assert!(store.get("nope").await?.is_none());
        Ok(())
    }
}
