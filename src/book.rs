use std::collections::{BTreeMap, BTreeSet};

use crate::epub::xml_escape;

/// Novel-level metadata. The identifier is minted once when a fresh document
/// is created and recovered from the package document on resume; it is never
/// regenerated for the same artifact.
#[derive(Debug, Clone)]
pub struct NovelMetadata {
    pub title: String,
    pub author: String,
    pub synopsis: String,
    pub cover_url: Option<String>,
    pub language: String,
    pub identifier: String,
}

impl NovelMetadata {
    pub fn new(
        title: impl Into<String>,
        author: impl Into<String>,
        synopsis: impl Into<String>,
        cover_url: Option<String>,
    ) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            synopsis: synopsis.into(),
            cover_url,
            language: "vi".to_string(),
            identifier: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverImage {
    /// File extension including the dot, e.g. `.jpg`.
    pub extension: String,
    pub bytes: Vec<u8>,
}

/// One fetched chapter. The index is the sole identity key.
#[derive(Debug, Clone)]
pub struct ChapterRecord {
    pub index: u32,
    pub title: String,
    pub text: String,
    pub html: String,
}

/// In-memory EPUB state for one novel.
///
/// Chapters are keyed by index in a `BTreeMap`, so iteration order is the
/// ascending spine order by construction. The document is `Clone`; clones
/// are the stable snapshots handed to the checkpoint scheduler.
#[derive(Debug, Clone)]
pub struct BookDocument {
    pub metadata: NovelMetadata,
    /// Body fragment of the intro page (no XHTML envelope).
    pub intro_html: String,
    pub cover: Option<CoverImage>,
    chapters: BTreeMap<u32, ChapterRecord>,
}

impl BookDocument {
    pub fn new(metadata: NovelMetadata) -> Self {
        let intro_html = render_intro_body(&metadata);
        Self {
            metadata,
            intro_html,
            cover: None,
            chapters: BTreeMap::new(),
        }
    }

    /// Reassemble a document from recovered pieces (resume path).
    pub fn from_parts(
        metadata: NovelMetadata,
        intro_html: String,
        cover: Option<CoverImage>,
        chapters: Vec<ChapterRecord>,
    ) -> Self {
        Self {
            metadata,
            intro_html,
            cover,
            chapters: chapters.into_iter().map(|c| (c.index, c)).collect(),
        }
    }

    /// Insert a chapter, replacing any previous record with the same index.
    /// The display title is always derived through the title-inference
    /// policy; there is no removal operation.
    pub fn add_or_replace_chapter(
        &mut self,
        index: u32,
        site_title: Option<&str>,
        text: String,
        html: String,
    ) {
        let title = crate::title::infer_title(index, site_title, &text);
        self.chapters.insert(
            index,
            ChapterRecord {
                index,
                title,
                text,
                html,
            },
        );
    }

    pub fn chapter_indices(&self) -> BTreeSet<u32> {
        self.chapters.keys().copied().collect()
    }

    pub fn chapters(&self) -> impl Iterator<Item = &ChapterRecord> {
        self.chapters.values()
    }

    pub fn chapter(&self, index: u32) -> Option<&ChapterRecord> {
        self.chapters.get(&index)
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Resume watermark: the highest chapter index present, 0 when empty.
    pub fn max_index(&self) -> u32 {
        self.chapters.keys().next_back().copied().unwrap_or(0)
    }
}

/// Intro page body: title, author line, synopsis paragraphs.
pub fn render_intro_body(metadata: &NovelMetadata) -> String {
    let mut out = String::new();
    out.push_str(&format!("<h1>{}</h1>\n", xml_escape(&metadata.title)));
    out.push_str(&format!(
        "<p><strong>Tác giả:</strong> {}</p>\n",
        xml_escape(&metadata.author)
    ));
    out.push_str("<h2>Giới thiệu</h2>\n");

    let synopsis = metadata.synopsis.trim();
    if synopsis.is_empty() {
        out.push_str("<p>Không có giới thiệu</p>\n");
    } else {
        for paragraph in synopsis.lines().filter(|line| !line.trim().is_empty()) {
            out.push_str(&format!("<p>{}</p>\n", xml_escape(paragraph.trim())));
        }
    }
    out
}

/// Filesystem- and remote-safe artifact name derived from the novel title.
pub fn artifact_file_name(title: &str) -> String {
    let mut safe = String::with_capacity(title.len());
    for ch in title.trim().chars() {
        match ch {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => safe.push('_'),
            _ => safe.push(ch),
        }
    }
    format!("{}.epub", safe.trim())
}
