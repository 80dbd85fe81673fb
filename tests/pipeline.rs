//! End-to-end pipeline scenarios driven through a scripted chapter source
//! and an in-memory blob store; no network involved.

use std::collections::{BTreeMap, HashMap};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use novel2epub::blob::{BlobStore, EntryKind, RemoteEntry};
use novel2epub::book::NovelMetadata;
use novel2epub::download::{DownloadOptions, Downloader};
use novel2epub::error::DownloadError;
use novel2epub::source::{ChapterEntry, ChapterSource, FetchedChapter, NovelListing};

const NOVEL_URL: &str = "https://metruyencv.com/truyen/de-ba";

struct ScriptedSource {
    metadata: NovelMetadata,
    /// index -> (title, html)
    chapters: BTreeMap<u32, (String, String)>,
    /// Fetching this index fails.
    fail_at: Option<u32>,
    fetch_log: Mutex<Vec<u32>>,
}

impl ScriptedSource {
    fn new(indices: std::ops::RangeInclusive<u32>) -> Self {
        let chapters = indices
            .map(|i| {
                (
                    i,
                    (
                        format!("Chương {i}: Tiêu đề {i}"),
                        format!("<p>Nội dung chương {i}.</p>"),
                    ),
                )
            })
            .collect();
        Self {
            metadata: NovelMetadata::new("Đế Bá", "Yếm Bút Tiêu Sinh", "Một truyện.", None),
            chapters,
            fail_at: None,
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    fn failing_at(mut self, index: u32) -> Self {
        self.fail_at = Some(index);
        self
    }

    fn fetched(&self) -> Vec<u32> {
        self.fetch_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChapterSource for ScriptedSource {
    async fn list_chapters(&self, _novel_url: &Url) -> anyhow::Result<NovelListing> {
        Ok(NovelListing {
            metadata: self.metadata.clone(),
            entries: self
                .chapters
                .iter()
                .map(|(&index, (title, _))| ChapterEntry {
                    index,
                    title: Some(title.clone()),
                    locator: format!("{NOVEL_URL}/chuong-{index}"),
                })
                .collect(),
        })
    }

    async fn fetch_chapter(&self, entry: &ChapterEntry) -> anyhow::Result<FetchedChapter> {
        if self.fail_at == Some(entry.index) {
            anyhow::bail!("simulated network failure for chapter {}", entry.index);
        }
        self.fetch_log.lock().unwrap().push(entry.index);
        let (title, html) = self
            .chapters
            .get(&entry.index)
            .ok_or_else(|| anyhow::anyhow!("no such chapter: {}", entry.index))?;
        Ok(FetchedChapter {
            title: Some(title.clone()),
            text: format!("Nội dung chương {}.", entry.index),
            html: html.clone(),
        })
    }

    async fn fetch_cover(&self, _cover_url: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no cover in test source")
    }
}

/// Blob store backed by a shared map of remote path -> bytes.
#[derive(Clone, Default)]
struct MemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    fn put_object(&self, remote_path: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), bytes);
    }

    fn object(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(remote_path).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, remote_path: &str) -> anyhow::Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(remote_path))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> anyhow::Result<String> {
        let bytes = std::fs::read(local_path)?;
        self.put_object(remote_path, bytes);
        Ok(format!("memory://{remote_path}"))
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()> {
        let bytes = self
            .object(remote_path)
            .ok_or_else(|| anyhow::anyhow!("not found: {remote_path}"))?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, bytes)?;
        Ok(())
    }

    async fn list_directory(&self, remote_path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        let prefix = format!("{}/", remote_path.trim_end_matches('/'));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, bytes)| RemoteEntry {
                name: path[prefix.len()..].to_string(),
                kind: EntryKind::File,
                size: bytes.len() as u64,
            })
            .collect())
    }
}

fn options(dir: &Path) -> DownloadOptions {
    DownloadOptions {
        output_dir: dir.join("out"),
        temp_dir: dir.join("tmp"),
        checkpoint_interval: 50,
        delay_range_ms: (0, 0),
        remote_dir: "/Novel".to_string(),
        scheduler_grace: Duration::from_secs(10),
    }
}

fn zip_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).expect("open artifact");
    let archive = zip::ZipArchive::new(file).expect("read artifact zip");
    archive.file_names().map(str::to_string).collect()
}

fn zip_entry(path: &Path, name: &str) -> String {
    let file = std::fs::File::open(path).expect("open artifact");
    let mut archive = zip::ZipArchive::new(file).expect("read artifact zip");
    let mut out = String::new();
    archive
        .by_name(name)
        .expect("entry present")
        .read_to_string(&mut out)
        .expect("read entry");
    out
}

fn spine_refs(opf: &str) -> Vec<String> {
    opf.split("<spine toc=\"ncx\">")
        .nth(1)
        .and_then(|s| s.split("</spine>").next())
        .unwrap_or("")
        .lines()
        .filter_map(|l| l.trim().strip_prefix("<itemref idref=\""))
        .filter_map(|l| l.split('"').next())
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_download_builds_full_artifact() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = Arc::new(ScriptedSource::new(1..=3));
    let downloader = Downloader::new(source.clone(), None, options(dir.path()));

    let outcome = downloader
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    assert_eq!(outcome.chapter_count, 3);
    assert!(outcome.remote_url.is_none());
    assert!(outcome.file_path.exists());
    assert_eq!(source.fetched(), vec![1, 2, 3]);

    let opf = zip_entry(&outcome.file_path, "OEBPS/content.opf");
    assert_eq!(
        spine_refs(&opf),
        vec!["nav", "intro", "chapter_1", "chapter_2", "chapter_3"]
    );

    // TOC: intro plus three chapters.
    let nav = zip_entry(&outcome.file_path, "OEBPS/nav.xhtml");
    assert_eq!(nav.matches("<li>").count(), 4);
    assert!(nav.contains("Chương 2: Tiêu đề 2"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_fetches_only_missing_chapters() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = Arc::new(ScriptedSource::new(1..=3));
    Downloader::new(first, None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    // The source now lists five chapters; only 4 and 5 are fetched.
    let second = Arc::new(ScriptedSource::new(1..=5));
    let outcome = Downloader::new(second.clone(), None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    assert_eq!(second.fetched(), vec![4, 5]);
    assert_eq!(outcome.chapter_count, 5);

    let loaded = novel2epub::resume::load(&outcome.file_path)?;
    assert_eq!(loaded.watermark, 5);
    for index in 1..=5u32 {
        let chapter = loaded.document.chapter(index).expect("chapter present");
        assert_eq!(chapter.title, format!("Chương {index}: Tiêu đề {index}"));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_keeps_the_original_identifier() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = Arc::new(ScriptedSource::new(1..=2));
    let outcome = Downloader::new(first, None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;
    let original_id = novel2epub::resume::load(&outcome.file_path)?
        .document
        .metadata
        .identifier;

    // A later run carries fresh listing metadata (new identifier) but the
    // resumed document must keep the persisted one.
    let second = Arc::new(ScriptedSource::new(1..=4));
    let outcome = Downloader::new(second, None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    let resumed_id = novel2epub::resume::load(&outcome.file_path)?
        .document
        .metadata
        .identifier;
    assert_eq!(resumed_id, original_id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_error_persists_checkpoint_before_failing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = Arc::new(ScriptedSource::new(1..=5).failing_at(4));
    let downloader = Downloader::new(source.clone(), None, options(dir.path()));

    let err = downloader
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .expect_err("chapter 4 failure must abort the run");
    match err {
        DownloadError::Fetch { index, .. } => assert_eq!(index, 4),
        other => panic!("expected fetch error, got {other:?}"),
    }

    // Everything fetched before the failure survives in the checkpoint.
    assert_eq!(source.fetched(), vec![1, 2, 3]);
    let checkpoint: PathBuf = dir.path().join("tmp").join("Đế Bá.epub");
    assert!(checkpoint.exists(), "emergency checkpoint missing");
    let loaded = novel2epub::resume::load(&checkpoint)?;
    assert_eq!(loaded.document.chapter_count(), 3);
    assert_eq!(loaded.watermark, 3);

    // No final artifact was produced.
    assert!(!dir.path().join("out").join("Đế Bá.epub").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_fetching_but_still_finalizes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = Arc::new(ScriptedSource::new(1..=3));
    let downloader = Downloader::new(source.clone(), None, options(dir.path()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = downloader
        .run(&Url::parse(NOVEL_URL)?, &cancel)
        .await
        .map_err(anyhow::Error::from)?;

    assert!(outcome.cancelled);
    assert!(source.fetched().is_empty());
    // A (possibly empty) artifact is still written so nothing is lost.
    assert!(outcome.file_path.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_success_moves_artifact_remote() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let blob = MemoryBlobStore::default();
    let source = Arc::new(ScriptedSource::new(1..=3));
    let downloader = Downloader::new(
        source,
        Some(Arc::new(blob.clone())),
        options(dir.path()),
    );

    let outcome = downloader
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    assert_eq!(
        outcome.remote_url.as_deref(),
        Some("memory:///Novel/Đế Bá.epub")
    );
    // Local copies are removed after a successful upload.
    assert!(!outcome.file_path.exists());
    assert!(blob.object("/Novel/Đế Bá.epub").is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_artifact_is_resolved_for_resume() -> anyhow::Result<()> {
    let seed_dir = tempfile::tempdir()?;
    let blob = MemoryBlobStore::default();

    // First run uploads chapters 1..=3 and deletes the local copies.
    let first = Arc::new(ScriptedSource::new(1..=3));
    Downloader::new(first, Some(Arc::new(blob.clone())), options(seed_dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    // Second run in a clean directory resolves the remote artifact.
    let work_dir = tempfile::tempdir()?;
    let second = Arc::new(ScriptedSource::new(1..=5));
    let outcome = Downloader::new(
        second.clone(),
        Some(Arc::new(blob.clone())),
        options(work_dir.path()),
    )
    .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
    .await
    .map_err(anyhow::Error::from)?;

    assert_eq!(second.fetched(), vec![4, 5]);
    assert_eq!(outcome.chapter_count, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_checkpoint_is_resolved_when_no_final_exists() -> anyhow::Result<()> {
    let seed_dir = tempfile::tempdir()?;
    let blob = MemoryBlobStore::default();

    // Build a 3-chapter artifact by hand and park it in the remote
    // checkpoint area only.
    let mut doc = novel2epub::book::BookDocument::new(NovelMetadata::new(
        "Đế Bá",
        "Yếm Bút Tiêu Sinh",
        "",
        None,
    ));
    for index in 1..=3u32 {
        doc.add_or_replace_chapter(
            index,
            Some(&format!("Chương {index}: Tiêu đề {index}")),
            format!("Nội dung chương {index}."),
            format!("<p>Nội dung chương {index}.</p>"),
        );
    }
    let seed_path = seed_dir.path().join("Đế Bá.epub");
    novel2epub::epub::save(&doc, &seed_path).map_err(anyhow::Error::from)?;
    blob.put_object("/Novel/Temp/Đế Bá.epub", std::fs::read(&seed_path)?);

    let work_dir = tempfile::tempdir()?;
    let source = Arc::new(ScriptedSource::new(1..=5));
    let outcome = Downloader::new(
        source.clone(),
        Some(Arc::new(blob.clone())),
        options(work_dir.path()),
    )
    .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
    .await
    .map_err(anyhow::Error::from)?;

    assert_eq!(source.fetched(), vec![4, 5]);
    assert_eq!(outcome.chapter_count, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_worklist_still_refreshes_artifact() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let source = Arc::new(ScriptedSource::new(1..=3));
    Downloader::new(source, None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    let repeat = Arc::new(ScriptedSource::new(1..=3));
    let outcome = Downloader::new(repeat.clone(), None, options(dir.path()))
        .run(&Url::parse(NOVEL_URL)?, &CancellationToken::new())
        .await
        .map_err(anyhow::Error::from)?;

    assert!(repeat.fetched().is_empty());
    assert_eq!(outcome.chapter_count, 3);
    assert!(outcome.file_path.exists());

    let names = zip_names(&outcome.file_path);
    assert!(names.iter().any(|n| n == "OEBPS/nav.xhtml"));
    Ok(())
}
