/// Error taxonomy for one download job.
///
/// `Load` and `Upload` never abort a job on their own; the orchestrator
/// degrades them. `Source`, `Fetch` and `Persistence` are fatal to the
/// run that raised them.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The chapter listing could not be retrieved or parsed.
    #[error("chapter listing failed")]
    Source(#[source] anyhow::Error),

    /// One chapter fetch failed after the request layer's own retries.
    /// Raised only after an emergency checkpoint has been flushed.
    #[error("chapter {index} fetch failed")]
    Fetch {
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    /// An existing artifact could not be read back into a document.
    #[error("existing artifact unreadable")]
    Load(#[source] anyhow::Error),

    /// Writing the artifact failed. Not retried here; retry policy belongs
    /// to the caller.
    #[error("artifact write failed")]
    Persistence(#[source] anyhow::Error),

    /// Remote store failure. The job still succeeds with a local-only result.
    #[error("remote upload failed")]
    Upload(#[source] anyhow::Error),
}

impl DownloadError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Load(_) | Self::Upload(_))
    }
}

#[cfg(test)]
mod tests {
    use super::DownloadError;

    #[test]
    fn load_and_upload_are_non_fatal() {
        assert!(!DownloadError::Load(anyhow::anyhow!("bad zip")).is_fatal());
        assert!(!DownloadError::Upload(anyhow::anyhow!("offline")).is_fatal());
        assert!(DownloadError::Persistence(anyhow::anyhow!("disk full")).is_fatal());
        assert!(
            DownloadError::Fetch {
                index: 4,
                source: anyhow::anyhow!("timeout"),
            }
            .is_fatal()
        );
    }
}
