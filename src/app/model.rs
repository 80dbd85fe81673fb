use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// Persisted job record. The reader access token from the request is held
/// in memory only; it never lands in `job.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: u32,
    pub message: String,
    pub novel_url: String,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub file_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub chapter_count: Option<usize>,
    pub error: Option<String>,
}

impl Job {
    pub fn queued(job_id: impl Into<String>, novel_url: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress_percent: 0,
            message: "queued".to_string(),
            novel_url: novel_url.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            file_path: None,
            remote_url: None,
            chapter_count: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub url: String,
    /// metruyencv reader access token for restricted chapters.
    #[serde(default)]
    pub cookie: Option<String>,
}
