//! tangthuvien.net client: catalog page for metadata, the paged chapter
//! list endpoint for the listing, per-chapter pages for content.

use std::sync::OnceLock;

use anyhow::Context as _;
use regex::Regex;
use url::Url;

use super::scrape::{attr_value, first_tag_text, tag_block_inner, text_with_breaks};
use super::{ChapterEntry, FetchedChapter, HttpClient, NovelListing, SiteKind};
use crate::book::NovelMetadata;

/// Chapter count as printed in the catalog header:
/// `Danh sách chương (1234 chương)`.
fn chapter_count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Danh sách chương \((\d+) chương\)").expect("chapter count regex")
    })
}

pub async fn list_chapters(http: &HttpClient, novel_url: &Url) -> anyhow::Result<NovelListing> {
    let html = http
        .get_text(novel_url, SiteKind::Tangthuvien)
        .await
        .context("fetch novel page")?;

    let title = first_tag_text(&html, "h1").unwrap_or_else(|| "Unknown".to_string());
    let cover_url = tag_block_inner(&html, "div", "book-img")
        .and_then(|block| image_src(block));
    let synopsis = tag_block_inner(&html, "div", "book-intro")
        .map(text_with_breaks)
        .unwrap_or_default();

    let book_id = story_id(&html)
        .ok_or_else(|| anyhow::anyhow!("story id not found on novel page: {novel_url}"))?;
    let total_chapters = chapter_count_pattern()
        .captures(&html)
        .and_then(|captures| captures[1].parse::<usize>().ok())
        .unwrap_or(0);
    if total_chapters == 0 {
        anyhow::bail!("chapter count not found on novel page: {novel_url}");
    }
    tracing::info!(%title, book_id = %book_id, total_chapters, "novel page parsed");

    let listing_url = Url::parse(&format!(
        "https://tangthuvien.net/doc-truyen/page/{book_id}?page=0&limit={total_chapters}&web=1"
    ))
    .context("build chapter listing url")?;
    let listing_html = http
        .get_text(&listing_url, SiteKind::Tangthuvien)
        .await
        .context("fetch chapter listing page")?;

    let entries = chapter_links(&listing_html);
    if entries.is_empty() {
        anyhow::bail!("chapter listing is empty for {novel_url}");
    }
    tracing::info!(chapters = entries.len(), "chapter listing retrieved");

    Ok(NovelListing {
        // The catalog page does not name the author.
        metadata: NovelMetadata::new(title, "Unknown", synopsis, cover_url),
        entries,
    })
}

pub async fn fetch_chapter(
    http: &HttpClient,
    entry: &ChapterEntry,
    url: &Url,
) -> anyhow::Result<FetchedChapter> {
    let html = http
        .get_text(url, SiteKind::Tangthuvien)
        .await
        .with_context(|| format!("fetch chapter {}", entry.index))?;

    // Primary selector, then the per-paragraph fallback markup.
    let text = tag_block_inner(&html, "div", "box-chap")
        .map(text_with_breaks)
        .filter(|text| !text.trim().is_empty())
        .or_else(|| content_block_text(&html));

    let (text, html) = match text {
        Some(text) => {
            let html = paragraphs_to_html(&text);
            (text, html)
        }
        None => {
            tracing::warn!(index = entry.index, "chapter content not found; site may have locked it");
            (
                super::LOCKED_CONTENT_NOTICE.to_string(),
                format!("<p>{}</p>", super::LOCKED_CONTENT_NOTICE),
            )
        }
    };

    Ok(FetchedChapter {
        title: entry.title.clone(),
        text,
        html,
    })
}

fn image_src(block: &str) -> Option<String> {
    let lower = block.to_ascii_lowercase();
    let start = lower.find("<img")?;
    let end = start + lower[start..].find('>')?;
    attr_value(&block[start..=end], "src")
}

fn story_id(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let at = lower.find("story_id_hidden")?;
    let tag_start = html[..at].rfind('<')?;
    let tag_end = tag_start + html[tag_start..].find('>')?;
    attr_value(&html[tag_start..=tag_end], "value")
}

/// `<a href=… title=…>` rows of the catalog list, indexed in page order.
fn chapter_links(html: &str) -> Vec<ChapterEntry> {
    let scope = tag_block_inner(html, "ul", "cf").unwrap_or(html);
    let lower = scope.to_ascii_lowercase();

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while let Some(rel) = lower[pos..].find("<a") {
        let start = pos + rel;
        let Some(end_rel) = lower[start..].find('>') else {
            break;
        };
        let end = start + end_rel;
        let tag = &scope[start..=end];
        pos = end + 1;

        let Some(href) = attr_value(tag, "href") else {
            continue;
        };
        if !href.contains("/doc-truyen/") {
            continue;
        }
        let index = (entries.len() + 1) as u32;
        let title = attr_value(tag, "title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        entries.push(ChapterEntry {
            index,
            title,
            locator: href,
        });
    }
    entries
}

fn content_block_text(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut paragraphs = Vec::new();
    let mut pos = 0usize;
    while let Some(rel) = lower[pos..].find("content-block") {
        let at = pos + rel;
        let Some(tag_start) = html[..at].rfind("<p") else {
            pos = at + 1;
            continue;
        };
        match tag_block_inner(&html[tag_start..], "p", "content-block") {
            Some(inner) => {
                let text = super::strip_tags(inner);
                if !text.trim().is_empty() {
                    paragraphs.push(text.trim().to_string());
                }
            }
            None => {}
        }
        pos = at + "content-block".len();
    }
    if paragraphs.is_empty() {
        return None;
    }
    Some(paragraphs.join("\n"))
}

/// Rebuild simple paragraph markup from newline-separated text.
fn paragraphs_to_html(text: &str) -> String {
    let mut out = String::from("<div class=\"chapter-content\">\n");
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        out.push_str(&format!("<p>{}</p>\n", crate::epub::xml_escape(line)));
    }
    out.push_str("</div>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_id_comes_from_hidden_input() {
        let html = r#"<input type="hidden" id="story_id_hidden" value="38183"/>"#;
        assert_eq!(story_id(html).as_deref(), Some("38183"));
    }

    #[test]
    fn chapter_count_is_parsed_from_catalog_header() {
        let html = r#"<div id="j-bookCatalogPage">Danh sách chương (2153 chương)</div>"#;
        assert_eq!(&chapter_count_pattern().captures(html).unwrap()[1], "2153");
    }

    #[test]
    fn chapter_links_are_indexed_in_order() {
        let html = r#"<ul class="cf">
            <li><a href="https://tangthuvien.net/doc-truyen/tien-nghich/chuong-1" title="Chương 1: Khởi đầu">1</a></li>
            <li><a href="https://tangthuvien.net/doc-truyen/tien-nghich/chuong-2">2</a></li>
        </ul>"#;
        let entries = chapter_links(html);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].title.as_deref(), Some("Chương 1: Khởi đầu"));
        assert_eq!(entries[1].index, 2);
        assert_eq!(entries[1].title, None);
    }

    #[test]
    fn paragraph_markup_is_rebuilt_from_text() {
        let html = paragraphs_to_html("một\n\nhai & ba\n");
        assert_eq!(
            html,
            "<div class=\"chapter-content\">\n<p>một</p>\n<p>hai &amp; ba</p>\n</div>"
        );
    }
}
