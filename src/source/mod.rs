//! Chapter acquisition behind one narrow interface. The orchestrator only
//! sees [`ChapterSource`]; the site-specific clients live in the submodules
//! and make no correctness promises beyond the trait contract.

mod http;
mod metruyenchu;
mod scrape;
mod tangthuvien;

use async_trait::async_trait;
use url::Url;

use crate::book::NovelMetadata;

pub use http::HttpClient;
pub use scrape::{strip_tags, text_with_breaks};

/// Body used when a site explicitly serves restricted content; delivered as
/// chapter content rather than an error so the pipeline keeps its position.
pub const LOCKED_CONTENT_NOTICE: &str =
    "Không có nội dung. Chương này có thể bị khóa hoặc không tồn tại.";

#[derive(Debug, Clone)]
pub struct NovelListing {
    pub metadata: NovelMetadata,
    /// Ordered ascending by index.
    pub entries: Vec<ChapterEntry>,
}

#[derive(Debug, Clone)]
pub struct ChapterEntry {
    pub index: u32,
    /// Site-provided title, if the listing had one.
    pub title: Option<String>,
    /// Opaque locator understood by the source that produced the entry.
    pub locator: String,
}

#[derive(Debug, Clone)]
pub struct FetchedChapter {
    pub title: Option<String>,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait ChapterSource: Send + Sync {
    /// Fetch novel metadata and the full ordered chapter listing.
    async fn list_chapters(&self, novel_url: &Url) -> anyhow::Result<NovelListing>;

    /// Fetch one chapter's content. Restricted content yields the sentinel
    /// notice body, not an error.
    async fn fetch_chapter(&self, entry: &ChapterEntry) -> anyhow::Result<FetchedChapter>;

    /// Fetch the cover image bytes. Best-effort; callers degrade on failure.
    async fn fetch_cover(&self, cover_url: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Metruyenchu,
    Tangthuvien,
}

impl SiteKind {
    pub fn detect(url: &Url) -> anyhow::Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("novel url must have a host: {url}"))?
            .to_ascii_lowercase();
        if host == "metruyencv.com" || host.ends_with(".metruyencv.com") {
            Ok(Self::Metruyenchu)
        } else if host == "tangthuvien.net" || host.ends_with(".tangthuvien.net") {
            Ok(Self::Tangthuvien)
        } else {
            anyhow::bail!(
                "unsupported novel url: {url}. supported sites: metruyencv.com, tangthuvien.net"
            )
        }
    }

    fn referer(self) -> &'static str {
        match self {
            Self::Metruyenchu => "https://metruyencv.com/",
            Self::Tangthuvien => "https://tangthuvien.net/",
        }
    }
}

/// Production source covering both supported sites; dispatches per URL.
pub struct SiteSource {
    http: HttpClient,
}

impl SiteSource {
    pub fn new(access_token: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpClient::new(access_token)?,
        })
    }
}

#[async_trait]
impl ChapterSource for SiteSource {
    async fn list_chapters(&self, novel_url: &Url) -> anyhow::Result<NovelListing> {
        match SiteKind::detect(novel_url)? {
            SiteKind::Metruyenchu => metruyenchu::list_chapters(&self.http, novel_url).await,
            SiteKind::Tangthuvien => tangthuvien::list_chapters(&self.http, novel_url).await,
        }
    }

    async fn fetch_chapter(&self, entry: &ChapterEntry) -> anyhow::Result<FetchedChapter> {
        let url = Url::parse(&entry.locator)
            .map_err(|err| anyhow::anyhow!("invalid chapter locator {:?}: {err}", entry.locator))?;
        match SiteKind::detect(&url)? {
            SiteKind::Metruyenchu => metruyenchu::fetch_chapter(&self.http, entry, &url).await,
            SiteKind::Tangthuvien => tangthuvien::fetch_chapter(&self.http, entry, &url).await,
        }
    }

    async fn fetch_cover(&self, cover_url: &str) -> anyhow::Result<Vec<u8>> {
        let url = Url::parse(cover_url)
            .map_err(|err| anyhow::anyhow!("invalid cover url {cover_url:?}: {err}"))?;
        let site = SiteKind::detect(&url).unwrap_or(SiteKind::Metruyenchu);
        self.http.get_bytes(&url, site).await
    }
}
