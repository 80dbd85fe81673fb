//! Reconstructs a `BookDocument` from a previously written container so a
//! job can continue without re-fetching completed chapters. Relies on the
//! `chapter_<index>[_<part>]` naming contract of the persistence engine.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read as _;
use std::path::Path;

use anyhow::Context as _;

use crate::book::{BookDocument, ChapterRecord, CoverImage, NovelMetadata};
use crate::epub::xml_unescape;

#[derive(Debug)]
pub struct LoadedBook {
    pub document: BookDocument,
    /// Highest chapter index recovered; 0 for an empty artifact.
    pub watermark: u32,
}

/// Load an existing artifact. Any structural failure (unreadable zip,
/// missing package document) is an error; callers fall back to a fresh
/// document and never see a partially recovered one.
pub fn load(path: &Path) -> anyhow::Result<LoadedBook> {
    let file = File::open(path).with_context(|| format!("open artifact: {}", path.display()))?;
    let mut archive =
        zip::ZipArchive::new(file).with_context(|| format!("read zip: {}", path.display()))?;

    let opf = read_entry_string(&mut archive, "OEBPS/content.opf").context("read content.opf")?;
    let metadata = metadata_from_opf(&opf);

    let intro_html = match read_entry_string(&mut archive, "OEBPS/intro.xhtml") {
        Ok(xhtml) => document_body(&xhtml).unwrap_or_default(),
        Err(err) => {
            tracing::warn!(?err, "artifact has no intro page; using empty intro");
            String::new()
        }
    };

    let mut cover = None;
    // Keyed by (index, part) so part files merge back in order.
    let mut fragments: BTreeMap<(u32, u32), (Option<String>, String)> = BTreeMap::new();
    let mut unrecognized: Vec<String> = Vec::new();

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    for name in names {
        if let Some(stem) = name
            .strip_prefix("OEBPS/chapter_")
            .and_then(|rest| rest.strip_suffix(".xhtml"))
        {
            let xhtml = read_entry_string(&mut archive, &name)
                .with_context(|| format!("read chapter entry: {name}"))?;
            match parse_chapter_stem(stem) {
                Some((index, part)) => {
                    let title = crate::title::title_from_document(&xhtml);
                    let body = chapter_body(&xhtml);
                    fragments.insert((index, part), (title, body));
                }
                None => unrecognized.push(name),
            }
        } else if let Some(ext) = name
            .strip_prefix("OEBPS/cover")
            .filter(|rest| rest.starts_with('.'))
        {
            let mut bytes = Vec::new();
            archive
                .by_name(&name)
                .with_context(|| format!("read cover entry: {name}"))?
                .read_to_end(&mut bytes)
                .context("read cover bytes")?;
            cover = Some(CoverImage {
                extension: ext.to_string(),
                bytes,
            });
        }
    }

    let mut chapters: BTreeMap<u32, ChapterRecord> = BTreeMap::new();
    for ((index, _part), (doc_title, body)) in fragments {
        match chapters.get_mut(&index) {
            Some(existing) => {
                // Later part of an already-seen chapter.
                existing.html.push('\n');
                existing.html.push_str(&body);
                existing.text = crate::source::strip_tags(&existing.html);
            }
            None => {
                let text = crate::source::strip_tags(&body);
                let title = crate::title::infer_title(index, doc_title.as_deref(), &text);
                chapters.insert(
                    index,
                    ChapterRecord {
                        index,
                        title,
                        text,
                        html: body,
                    },
                );
            }
        }
    }

    // Chapter files whose stem carries no parseable index get synthetic
    // indices above everything recovered, in name order.
    let mut next_synthetic = chapters.keys().next_back().copied().unwrap_or(0);
    unrecognized.sort();
    for name in unrecognized {
        next_synthetic += 1;
        tracing::warn!(
            entry = %name,
            index = next_synthetic,
            "chapter entry has no parseable index; assigning synthetic index"
        );
        let xhtml = read_entry_string(&mut archive, &name)
            .with_context(|| format!("read chapter entry: {name}"))?;
        let body = chapter_body(&xhtml);
        let text = crate::source::strip_tags(&body);
        let title = crate::title::infer_title(
            next_synthetic,
            crate::title::title_from_document(&xhtml).as_deref(),
            &text,
        );
        chapters.insert(
            next_synthetic,
            ChapterRecord {
                index: next_synthetic,
                title,
                text,
                html: body,
            },
        );
    }

    let watermark = chapters.keys().next_back().copied().unwrap_or(0);
    let document =
        BookDocument::from_parts(metadata, intro_html, cover, chapters.into_values().collect());

    tracing::info!(
        chapters = document.chapter_count(),
        watermark,
        "recovered existing artifact"
    );
    Ok(LoadedBook {
        document,
        watermark,
    })
}

fn read_entry_string(archive: &mut zip::ZipArchive<File>, name: &str) -> anyhow::Result<String> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("missing entry: {name}"))?;
    let mut out = String::new();
    entry
        .read_to_string(&mut out)
        .with_context(|| format!("read entry: {name}"))?;
    Ok(out)
}

/// `chapter_<index>` or `chapter_<index>_<part>`; the prefix is already
/// stripped, so the input is `<index>[_<part>]`.
fn parse_chapter_stem(stem: &str) -> Option<(u32, u32)> {
    let mut pieces = stem.split('_');
    let index: u32 = pieces.next()?.parse().ok()?;
    match pieces.next() {
        None => Some((index, 1)),
        Some(part) => {
            let part: u32 = part.parse().ok()?;
            if pieces.next().is_some() {
                return None;
            }
            Some((index, part))
        }
    }
}

fn metadata_from_opf(opf: &str) -> NovelMetadata {
    let title = dc_value(opf, "dc:title").unwrap_or_else(|| "Unknown".to_string());
    let author = dc_value(opf, "dc:creator").unwrap_or_else(|| "Unknown".to_string());
    let language = dc_value(opf, "dc:language").unwrap_or_else(|| "vi".to_string());
    let identifier = dc_value(opf, "dc:identifier")
        .map(|id| id.trim_start_matches("urn:uuid:").to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut metadata = NovelMetadata::new(title, author, String::new(), None);
    metadata.language = language;
    metadata.identifier = identifier;
    metadata
}

/// Text content of `<tag …>…</tag>`, first occurrence.
fn dc_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let content_start = start + xml[start..].find('>')? + 1;
    let content_end = content_start + xml[content_start..].find(&close)?;
    let value = xml[content_start..content_end].trim();
    if value.is_empty() {
        return None;
    }
    Some(xml_unescape(value))
}

/// Body fragment of a stored XHTML document.
fn document_body(xhtml: &str) -> Option<String> {
    let lower = xhtml.to_ascii_lowercase();
    let open = lower.find("<body")?;
    let content_start = open + xhtml[open..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find("</body>")?;
    Some(xhtml[content_start..content_end].trim().to_string())
}

/// Chapter body with the headings the persistence engine prepends removed,
/// so a load-save cycle does not stack headings.
fn chapter_body(xhtml: &str) -> String {
    let mut body = document_body(xhtml).unwrap_or_default();
    body = strip_leading_heading(&body, "h2");
    if body.trim_start().starts_with("<h3>")
        && let Some(first_close) = body.find("</h3>")
        && body[..first_close].contains("(continued)")
    {
        body = body[first_close + "</h3>".len()..].trim_start().to_string();
    }
    body
}

fn strip_leading_heading(body: &str, tag: &str) -> String {
    let trimmed = body.trim_start();
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    if let Some(rest) = trimmed.strip_prefix(&open)
        && let Some(end) = rest.find(&close)
    {
        return rest[end + close.len()..].trim_start().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookDocument, NovelMetadata};

    fn saved_document(indices: &[u32]) -> (tempfile::TempDir, std::path::PathBuf, BookDocument) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("novel.epub");
        let mut doc = BookDocument::new(NovelMetadata::new(
            "Đế Bá",
            "Yếm Bút Tiêu Sinh",
            "Một truyện tiên hiệp.",
            None,
        ));
        for &index in indices {
            doc.add_or_replace_chapter(
                index,
                Some(&format!("Chương {index}: Tiêu đề {index}")),
                format!("nội dung {index}"),
                format!("<p>nội dung {index}</p>"),
            );
        }
        crate::epub::save(&doc, &path).expect("save");
        (dir, path, doc)
    }

    #[test]
    fn parse_stem_variants() {
        assert_eq!(parse_chapter_stem("12"), Some((12, 1)));
        assert_eq!(parse_chapter_stem("12_3"), Some((12, 3)));
        assert_eq!(parse_chapter_stem("abc"), None);
        assert_eq!(parse_chapter_stem("12_3_4"), None);
    }

    #[test]
    fn load_recovers_chapters_titles_and_identifier() -> anyhow::Result<()> {
        let (_dir, path, original) = saved_document(&[1, 2, 3]);

        let loaded = load(&path)?;
        assert_eq!(loaded.watermark, 3);
        assert_eq!(loaded.document.chapter_count(), 3);
        assert_eq!(
            loaded.document.metadata.identifier,
            original.metadata.identifier
        );
        for index in 1..=3u32 {
            let chapter = loaded.document.chapter(index).expect("chapter");
            assert_eq!(chapter.title, format!("Chương {index}: Tiêu đề {index}"));
            assert_eq!(chapter.html, format!("<p>nội dung {index}</p>"));
        }
        Ok(())
    }

    #[test]
    fn load_then_save_preserves_everything() -> anyhow::Result<()> {
        let (dir, path, _) = saved_document(&[1, 2, 3, 4, 5]);

        let loaded = load(&path)?;
        let resaved = dir.path().join("resaved.epub");
        crate::epub::save(&loaded.document, &resaved).map_err(anyhow::Error::from)?;

        let reloaded = load(&resaved)?;
        assert_eq!(reloaded.document.chapter_count(), 5);
        for index in 1..=5u32 {
            let a = loaded.document.chapter(index).unwrap();
            let b = reloaded.document.chapter(index).unwrap();
            assert_eq!(a.title, b.title);
            assert_eq!(a.html, b.html);
        }
        assert_eq!(
            loaded.document.metadata.identifier,
            reloaded.document.metadata.identifier
        );
        Ok(())
    }

    #[test]
    fn corrupt_artifact_is_an_error_not_a_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.epub");
        std::fs::write(&path, b"this is not a zip archive").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn split_parts_merge_back_into_one_chapter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.epub");
        let mut doc = BookDocument::new(NovelMetadata::new("T", "A", "", None));
        let big: String = (0..60)
            .map(|i| format!("<p>đoạn {i} {}</p>", "x".repeat(2_000)))
            .collect();
        doc.add_or_replace_chapter(7, Some("Chương 7: Dài"), "nội dung".into(), big);
        doc.add_or_replace_chapter(8, Some("Chương 8: Ngắn"), "nội dung".into(), "<p>n</p>".into());
        crate::epub::save(&doc, &path).map_err(anyhow::Error::from)?;

        let loaded = load(&path)?;
        assert_eq!(loaded.watermark, 8);
        assert_eq!(loaded.document.chapter_count(), 2);
        let merged = loaded.document.chapter(7).expect("merged chapter");
        assert_eq!(merged.title, "Chương 7: Dài");
        assert_eq!(merged.html.matches("<p>").count(), 60);
        Ok(())
    }
}
