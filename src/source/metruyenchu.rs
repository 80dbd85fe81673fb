//! metruyencv.com client: novel page for metadata, backend API for the
//! chapter listing, `…/chuong-<n>` pages for content.

use std::sync::OnceLock;

use anyhow::Context as _;
use regex::Regex;
use url::Url;

use super::scrape::{attr_value, first_tag_text, strip_tags, tag_block_inner, text_with_breaks};
use super::{ChapterEntry, FetchedChapter, HttpClient, NovelListing, SiteKind};
use crate::book::NovelMetadata;

const API_BASE: &str = "https://backend.metruyencv.com/api/chapters";

/// Book id as embedded in the reader button: `readings(12345)`.
fn book_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"readings\((\d+)\)").expect("book id regex"))
}

pub async fn list_chapters(http: &HttpClient, novel_url: &Url) -> anyhow::Result<NovelListing> {
    let html = http
        .get_text(novel_url, SiteKind::Metruyenchu)
        .await
        .context("fetch novel page")?;

    let title = first_tag_text(&html, "h1").unwrap_or_else(|| "Unknown".to_string());
    let author = author_from_page(&html).unwrap_or_else(|| "Unknown".to_string());
    let cover_url = cover_from_page(&html);
    let synopsis = tag_block_inner(&html, "div", "synopsis")
        .map(text_with_breaks)
        .unwrap_or_default();

    tracing::info!(%title, author = %author, cover = cover_url.is_some(), "novel page parsed");

    let book_id = book_id_pattern()
        .captures(&html)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| anyhow::anyhow!("book id not found on novel page: {novel_url}"))?;

    let api_url = Url::parse(&format!("{API_BASE}?filter[book_id]={book_id}"))
        .context("build chapter api url")?;
    let listing = http
        .get_json(&api_url, SiteKind::Metruyenchu)
        .await
        .context("fetch chapter listing api")?;

    let base = novel_url.as_str().trim_end_matches('/');
    let mut entries = Vec::new();
    for item in listing
        .get("data")
        .and_then(|data| data.as_array())
        .ok_or_else(|| anyhow::anyhow!("chapter api returned no data array"))?
    {
        let Some(index) = item
            .get("index")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
        else {
            continue;
        };
        let title = item
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        entries.push(ChapterEntry {
            index,
            title,
            locator: format!("{base}/chuong-{index}"),
        });
    }
    entries.sort_by_key(|entry| entry.index);

    if entries.is_empty() {
        anyhow::bail!("chapter listing is empty for {novel_url}");
    }
    tracing::info!(chapters = entries.len(), "chapter listing retrieved");

    Ok(NovelListing {
        metadata: NovelMetadata::new(title, author, synopsis, cover_url),
        entries,
    })
}

pub async fn fetch_chapter(
    http: &HttpClient,
    entry: &ChapterEntry,
    url: &Url,
) -> anyhow::Result<FetchedChapter> {
    let html = http
        .get_text(url, SiteKind::Metruyenchu)
        .await
        .with_context(|| format!("fetch chapter {}", entry.index))?;

    let page_title = first_tag_text(&html, "h2");
    let content_html = tag_block_inner(&html, "div", "ChapterContent")
        .map(str::trim)
        .filter(|inner| !inner.is_empty());

    let (text, html) = match content_html {
        Some(inner) => {
            let text = text_with_breaks(inner);
            if text.trim().is_empty() {
                locked_body()
            } else {
                (text, inner.to_string())
            }
        }
        None => {
            tracing::warn!(index = entry.index, "chapter content not found; site may have locked it");
            locked_body()
        }
    };

    Ok(FetchedChapter {
        title: entry.title.clone().or(page_title),
        text,
        html,
    })
}

fn locked_body() -> (String, String) {
    (
        super::LOCKED_CONTENT_NOTICE.to_string(),
        format!("<p>{}</p>", super::LOCKED_CONTENT_NOTICE),
    )
}

fn author_from_page(html: &str) -> Option<String> {
    // The author link points at the author index.
    let lower = html.to_ascii_lowercase();
    let at = lower.find("/tac-gia")?;
    let tag_start = html[..at].rfind("<a")?;
    let inner = tag_block_inner(&html[tag_start..], "a", "")?;
    let author = strip_tags(inner);
    let author = author.trim();
    if author.is_empty() {
        return None;
    }
    Some(author.to_string())
}

fn cover_from_page(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut pos = 0usize;
    while let Some(rel) = lower[pos..].find("<img") {
        let start = pos + rel;
        let end = start + lower[start..].find('>')?;
        let tag = &html[start..=end];
        if tag.contains("h-60") {
            return attr_value(tag, "src");
        }
        pos = end + 1;
    }
    None
}
