//! Splits oversized chapters into multiple spine documents so no single
//! content file overwhelms an e-reader's renderer.

use crate::book::ChapterRecord;

/// Serialized-markup size above which a chapter is considered for splitting.
pub const SPLIT_THRESHOLD_BYTES: usize = 100_000;

/// Chapters with fewer paragraphs are never split, however large; splitting
/// them would produce degenerate one-paragraph parts.
const MIN_PARAGRAPHS_TO_SPLIT: usize = 20;

const MIN_PARAGRAPHS_PER_PART: usize = 10;
const MAX_PARTS: usize = 3;

/// One piece of a split chapter. Part numbers start at 1; part 1 keeps the
/// chapter's own title.
#[derive(Debug, Clone)]
pub struct ChapterPart {
    pub part: u32,
    pub title: String,
    pub html: String,
}

/// Split a chapter whose markup exceeds the size threshold into up to three
/// parts by paragraph count. Returns `None` when the chapter should stay
/// whole (small enough, too few paragraphs, or markup that does not separate
/// into paragraphs).
pub fn split_oversized(record: &ChapterRecord) -> Option<Vec<ChapterPart>> {
    if record.html.len() <= SPLIT_THRESHOLD_BYTES {
        return None;
    }

    let paragraphs = paragraph_blocks(&record.html);
    if paragraphs.len() < MIN_PARAGRAPHS_TO_SPLIT {
        return None;
    }

    let per_part = (paragraphs.len() / MAX_PARTS).max(MIN_PARAGRAPHS_PER_PART);
    let chunks: Vec<&[String]> = paragraphs.chunks(per_part).collect();
    if chunks.len() <= 1 {
        return None;
    }

    let parts = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let part = (i + 1) as u32;
            let title = if i == 0 {
                record.title.clone()
            } else {
                format!("{} (part {part})", record.title)
            };
            let mut html = String::new();
            if i > 0 {
                html.push_str(&format!(
                    "<h3>{} (continued)</h3>\n",
                    crate::epub::xml_escape(&record.title)
                ));
            }
            html.push_str(&chunk.join("\n"));
            ChapterPart { part, title, html }
        })
        .collect();

    Some(parts)
}

/// Top-level `<p>…</p>` blocks of a fragment, in document order. Markup
/// between paragraphs (headings, rules) is attached to the preceding block
/// so nothing is dropped by a split.
fn paragraph_blocks(html: &str) -> Vec<String> {
    let lower = html.to_ascii_lowercase();
    let mut blocks: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = lower[cursor..].find("<p") {
        let start = cursor + rel_start;
        // Require `<p>` or `<p …`, not `<pre`.
        let after = lower.as_bytes().get(start + 2).copied();
        if !matches!(after, Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n')) {
            cursor = start + 2;
            continue;
        }
        let Some(rel_end) = lower[start..].find("</p>") else {
            break;
        };
        let end = start + rel_end + "</p>".len();

        if start > cursor {
            let between = html[cursor..start].trim();
            if !between.is_empty() {
                match blocks.last_mut() {
                    Some(last) => {
                        last.push('\n');
                        last.push_str(between);
                    }
                    None => blocks.push(between.to_string()),
                }
            }
        }

        blocks.push(html[start..end].to_string());
        cursor = end;
    }

    if cursor < html.len() {
        let tail = html[cursor..].trim();
        if !tail.is_empty()
            && let Some(last) = blocks.last_mut()
        {
            last.push('\n');
            last.push_str(tail);
        }
    }

    blocks
}
