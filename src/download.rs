//! Download orchestrator: drives one job end to end.
//!
//! `ResolveExisting → CreateOrLoad → ComputeDelta → Fetching → Finalizing →
//! Uploading → Done`, aborting from the fetch or finalize phases on
//! unrecoverable errors. Every instance owns its own checkpoint scheduler
//! and cancellation token; nothing is shared across jobs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::blob::BlobStore;
use crate::book::{BookDocument, CoverImage, artifact_file_name};
use crate::checkpoint::CheckpointScheduler;
use crate::error::DownloadError;
use crate::source::{ChapterEntry, ChapterSource, NovelListing};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Where finished artifacts land.
    pub output_dir: PathBuf,
    /// Where checkpoints (and remote-resolved copies) land.
    pub temp_dir: PathBuf,
    /// Enqueue a checkpoint after this many newly fetched chapters.
    pub checkpoint_interval: usize,
    /// Politeness pause between chapter fetches, min/max milliseconds.
    pub delay_range_ms: (u64, u64),
    /// Remote directory for finished artifacts; checkpoints mirror into its
    /// `Temp/` child.
    pub remote_dir: String,
    /// How long the checkpoint scheduler gets to drain on shutdown.
    pub scheduler_grace: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("novel_output"),
            temp_dir: PathBuf::from("novel_temp"),
            checkpoint_interval: 50,
            delay_range_ms: (500, 1_000),
            remote_dir: "/Novel".to_string(),
            scheduler_grace: Duration::from_secs(30),
        }
    }
}

/// Progress notification delivered between phases and per fetched chapter.
#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: Phase,
    /// Chapters fetched so far in this run.
    pub fetched: usize,
    /// Size of this run's worklist.
    pub worklist: usize,
    /// Total chapters currently in the document.
    pub chapter_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ResolveExisting,
    CreateOrLoad,
    ComputeDelta,
    Fetching,
    Finalizing,
    Uploading,
    Done,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub title: String,
    pub author: String,
    pub file_path: PathBuf,
    /// Set when the artifact was uploaded; `None` for local-only results.
    pub remote_url: Option<String>,
    pub chapter_count: usize,
    /// True when the run stopped early on a cancellation signal.
    pub cancelled: bool,
}

pub struct Downloader {
    source: Arc<dyn ChapterSource>,
    blob: Option<Arc<dyn BlobStore>>,
    options: DownloadOptions,
    progress: Option<ProgressFn>,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn ChapterSource>,
        blob: Option<Arc<dyn BlobStore>>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            source,
            blob,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, phase: Phase, fetched: usize, worklist: usize, chapter_count: usize) {
        if let Some(progress) = &self.progress {
            progress(Progress {
                phase,
                fetched,
                worklist,
                chapter_count,
            });
        }
    }

    /// Run one job to completion. Cancellation granularity is per chapter:
    /// the current fetch finishes, no new worklist entries start, and the
    /// run proceeds to a normal finalize with everything fetched so far.
    pub async fn run(
        &self,
        novel_url: &Url,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        let listing = self
            .source
            .list_chapters(novel_url)
            .await
            .map_err(DownloadError::Source)?;
        if listing.entries.is_empty() {
            return Err(DownloadError::Source(anyhow::anyhow!(
                "chapter listing is empty"
            )));
        }
        tracing::info!(
            title = %listing.metadata.title,
            chapters = listing.entries.len(),
            "starting download"
        );

        let file_name = artifact_file_name(&listing.metadata.title);
        let final_path = self.options.output_dir.join(&file_name);
        let temp_path = self.options.temp_dir.join(&file_name);

        self.report(Phase::ResolveExisting, 0, 0, 0);
        let existing = self.resolve_existing(&file_name, &final_path, &temp_path).await;

        self.report(Phase::CreateOrLoad, 0, 0, 0);
        let mut document = self.create_or_load(existing.as_deref(), &listing).await;

        self.report(Phase::ComputeDelta, 0, 0, document.chapter_count());
        let worklist = compute_delta(&listing, &document.chapter_indices());
        tracing::info!(
            existing = document.chapter_count(),
            missing = worklist.len(),
            watermark = document.max_index(),
            "computed fetch worklist"
        );

        let scheduler =
            CheckpointScheduler::spawn(self.blob.clone(), self.options.remote_dir.clone());

        let fetch_result = self
            .fetch_worklist(&mut document, &worklist, &temp_path, &scheduler, cancel)
            .await;

        // The final save must never run concurrently with queued checkpoint
        // saves; drain the scheduler first, success or abort.
        scheduler.shutdown(self.options.scheduler_grace).await;

        let fetched = match fetch_result {
            Ok(fetched) => fetched,
            Err(err) => return Err(err),
        };

        self.report(
            Phase::Finalizing,
            fetched,
            worklist.len(),
            document.chapter_count(),
        );
        let save_doc = document.clone();
        let save_path = final_path.clone();
        tokio::task::spawn_blocking(move || crate::epub::save(&save_doc, &save_path))
            .await
            .map_err(|err| DownloadError::Persistence(anyhow::anyhow!("save task: {err}")))??;
        tracing::info!(path = %final_path.display(), "final artifact saved");

        self.report(
            Phase::Uploading,
            fetched,
            worklist.len(),
            document.chapter_count(),
        );
        let remote_url = self.upload_final(&file_name, &final_path, &temp_path).await;

        self.report(
            Phase::Done,
            fetched,
            worklist.len(),
            document.chapter_count(),
        );
        Ok(DownloadOutcome {
            title: document.metadata.title.clone(),
            author: document.metadata.author.clone(),
            file_path: final_path,
            remote_url,
            chapter_count: document.chapter_count(),
            cancelled: cancel.is_cancelled(),
        })
    }

    /// Probe for an artifact to resume from: local final, local temp, then
    /// the remote store's final and checkpoint areas. Remote hits download
    /// into the temp path. Remote probing is best-effort.
    async fn resolve_existing(
        &self,
        file_name: &str,
        final_path: &Path,
        temp_path: &Path,
    ) -> Option<PathBuf> {
        if final_path.exists() {
            tracing::info!(path = %final_path.display(), "found existing local artifact");
            return Some(final_path.to_path_buf());
        }
        if temp_path.exists() {
            tracing::info!(path = %temp_path.display(), "found existing local checkpoint");
            return Some(temp_path.to_path_buf());
        }

        let blob = self.blob.as_ref()?;
        let remote_dir = self.options.remote_dir.trim_end_matches('/');

        // Finished artifact first.
        let remote_path = format!("{remote_dir}/{file_name}");
        match blob.exists(&remote_path).await {
            Ok(true) => {
                tracing::info!(remote = %remote_path, "found remote artifact; downloading");
                match blob.download(&remote_path, temp_path).await {
                    Ok(()) => return Some(temp_path.to_path_buf()),
                    Err(err) => {
                        tracing::warn!(?err, remote = %remote_path, "remote artifact download failed");
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(?err, remote = %remote_path, "remote artifact probe failed");
            }
        }

        // Then the checkpoint area, matched by listing so stale checkpoints
        // with odd metadata still resolve.
        let temp_dir = format!("{remote_dir}/Temp");
        match blob.list_directory(&temp_dir).await {
            Ok(entries) => {
                if entries
                    .iter()
                    .any(|e| e.kind == crate::blob::EntryKind::File && e.name == file_name)
                {
                    let remote_path = format!("{temp_dir}/{file_name}");
                    tracing::info!(remote = %remote_path, "found remote checkpoint; downloading");
                    match blob.download(&remote_path, temp_path).await {
                        Ok(()) => return Some(temp_path.to_path_buf()),
                        Err(err) => {
                            tracing::warn!(?err, remote = %remote_path, "remote checkpoint download failed");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(?err, remote = %temp_dir, "remote checkpoint listing failed");
            }
        }
        None
    }

    /// Resume from the resolved artifact, or build a fresh document. A
    /// load failure falls back to fresh; it never aborts the job.
    async fn create_or_load(&self, existing: Option<&Path>, listing: &NovelListing) -> BookDocument {
        if let Some(path) = existing {
            let load_path = path.to_path_buf();
            let loaded = tokio::task::spawn_blocking(move || crate::resume::load(&load_path)).await;
            match loaded {
                Ok(Ok(loaded)) => return loaded.document,
                Ok(Err(err)) => {
                    let err = DownloadError::Load(err);
                    tracing::warn!(path = %path.display(), ?err, "resume failed; starting fresh");
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), ?err, "resume task failed; starting fresh");
                }
            }
        }

        let mut document = BookDocument::new(listing.metadata.clone());
        if let Some(cover_url) = &listing.metadata.cover_url {
            match self.source.fetch_cover(cover_url).await {
                Ok(bytes) => {
                    document.cover = Some(CoverImage {
                        extension: cover_extension(cover_url),
                        bytes,
                    });
                    tracing::info!(url = %cover_url, "cover image downloaded");
                }
                Err(err) => {
                    tracing::warn!(?err, url = %cover_url, "cover download failed; continuing without cover");
                }
            }
        }
        document
    }

    /// Fetch every worklist entry in ascending order. Returns the number of
    /// chapters fetched; a chapter failure flushes an emergency checkpoint
    /// and aborts the run.
    async fn fetch_worklist(
        &self,
        document: &mut BookDocument,
        worklist: &[ChapterEntry],
        temp_path: &Path,
        scheduler: &CheckpointScheduler,
        cancel: &CancellationToken,
    ) -> Result<usize, DownloadError> {
        let mut fetched = 0usize;
        let interval = self.options.checkpoint_interval.max(1);
        self.report(Phase::Fetching, 0, worklist.len(), document.chapter_count());

        for entry in worklist {
            if cancel.is_cancelled() {
                tracing::info!(fetched, "cancellation requested; stopping fetch loop");
                break;
            }

            tracing::info!(index = entry.index, title = entry.title.as_deref(), "fetching chapter");
            let chapter = match self.source.fetch_chapter(entry).await {
                Ok(chapter) => chapter,
                Err(err) => {
                    tracing::error!(index = entry.index, ?err, "chapter fetch failed; flushing emergency checkpoint");
                    if let Err(save_err) =
                        scheduler.flush(document.clone(), temp_path.to_path_buf()).await
                    {
                        tracing::error!(?save_err, "emergency checkpoint failed");
                    }
                    return Err(DownloadError::Fetch {
                        index: entry.index,
                        source: err,
                    });
                }
            };

            let site_title = chapter.title.as_deref().or(entry.title.as_deref());
            let html = crate::sanitize::sanitize_fragment(&chapter.html);
            document.add_or_replace_chapter(entry.index, site_title, chapter.text, html);
            fetched += 1;

            self.report(
                Phase::Fetching,
                fetched,
                worklist.len(),
                document.chapter_count(),
            );

            if fetched % interval == 0 {
                scheduler.enqueue(document.clone(), temp_path.to_path_buf());
                tracing::info!(fetched, "interval checkpoint queued");
            }

            if fetched < worklist.len() {
                self.politeness_delay().await;
            }
        }

        Ok(fetched)
    }

    async fn politeness_delay(&self) {
        let (min_ms, max_ms) = self.options.delay_range_ms;
        if max_ms == 0 {
            return;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min_ms..=max_ms.max(min_ms))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Upload the final artifact when a store is configured. On success the
    /// local final and temp copies are removed; on failure both stay and the
    /// job still counts as successful.
    async fn upload_final(
        &self,
        file_name: &str,
        final_path: &Path,
        temp_path: &Path,
    ) -> Option<String> {
        let blob = self.blob.as_ref()?;
        let remote_path = format!(
            "{}/{file_name}",
            self.options.remote_dir.trim_end_matches('/')
        );
        match blob.upload(final_path, &remote_path).await {
            Ok(url) => {
                tracing::info!(%url, "artifact uploaded");
                for path in [final_path, temp_path] {
                    if path.exists()
                        && let Err(err) = std::fs::remove_file(path)
                    {
                        tracing::warn!(?err, path = %path.display(), "failed to remove local copy after upload");
                    }
                }
                Some(url)
            }
            Err(err) => {
                let err = DownloadError::Upload(err);
                tracing::warn!(?err, "upload failed; keeping local artifact");
                None
            }
        }
    }
}

/// CLI entry: run one download in the foreground, cancelling on Ctrl-C.
pub async fn run(args: crate::cli::DownloadArgs) -> anyhow::Result<()> {
    let novel_url = Url::parse(&args.url).context("parse --url")?;
    let source = Arc::new(crate::source::SiteSource::new(args.cookie).context("build source")?);
    let blob = crate::server::dropbox_from_env_or_arg(args.dropbox_token.as_deref());

    let options = DownloadOptions {
        output_dir: PathBuf::from(args.out_dir),
        temp_dir: PathBuf::from(args.temp_dir),
        checkpoint_interval: args.checkpoint_interval.max(1),
        remote_dir: args.remote_dir,
        ..DownloadOptions::default()
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing current chapter then saving");
            signal_token.cancel();
        }
    });

    let downloader = Downloader::new(source, blob, options);
    let outcome = downloader.run(&novel_url, &cancel).await?;

    tracing::info!(
        title = %outcome.title,
        chapters = outcome.chapter_count,
        path = %outcome.file_path.display(),
        remote = outcome.remote_url.as_deref(),
        cancelled = outcome.cancelled,
        "download finished"
    );
    println!("{}", outcome.file_path.display());
    if let Some(url) = &outcome.remote_url {
        println!("{url}");
    }
    Ok(())
}

/// Missing chapters: listing indices not yet in the document, ascending.
pub fn compute_delta(listing: &NovelListing, present: &BTreeSet<u32>) -> Vec<ChapterEntry> {
    let mut missing: Vec<ChapterEntry> = listing
        .entries
        .iter()
        .filter(|entry| !present.contains(&entry.index))
        .cloned()
        .collect();
    missing.sort_by_key(|entry| entry.index);
    missing
}

fn cover_extension(cover_url: &str) -> String {
    let path = cover_url.split(['?', '#']).next().unwrap_or(cover_url);
    match path.rsplit_once('.') {
        Some((_, ext))
            if ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => ".jpg".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::NovelMetadata;

    fn listing(range: std::ops::RangeInclusive<u32>) -> NovelListing {
        NovelListing {
            metadata: NovelMetadata::new("T", "A", "", None),
            entries: range
                .map(|index| ChapterEntry {
                    index,
                    title: None,
                    locator: format!("https://example.com/c/{index}"),
                })
                .collect(),
        }
    }

    #[test]
    fn delta_is_exactly_the_missing_suffix() {
        let listing = listing(1..=100);
        let present: BTreeSet<u32> = (1..=50).collect();
        let delta = compute_delta(&listing, &present);
        let indices: Vec<u32> = delta.iter().map(|e| e.index).collect();
        assert_eq!(indices, (51..=100).collect::<Vec<_>>());
    }

    #[test]
    fn delta_handles_gaps_and_stays_ascending() {
        let listing = listing(1..=10);
        let present: BTreeSet<u32> = [1, 3, 5, 7, 9].into_iter().collect();
        let delta = compute_delta(&listing, &present);
        let indices: Vec<u32> = delta.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn delta_is_empty_when_document_is_complete() {
        let listing = listing(1..=5);
        let present: BTreeSet<u32> = (1..=5).collect();
        assert!(compute_delta(&listing, &present).is_empty());
    }

    #[test]
    fn cover_extension_from_url() {
        assert_eq!(cover_extension("https://cdn/x/cover.PNG?w=600"), ".png");
        assert_eq!(cover_extension("https://cdn/x/cover"), ".jpg");
        assert_eq!(cover_extension("https://cdn/x.y/no-ext/"), ".jpg");
    }
}
