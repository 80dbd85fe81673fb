use std::sync::OnceLock;

use regex::Regex;

/// Chapter headings as the sites print them: `Chương 12: Tên chương` or
/// `Chương 12 - Tên chương`, anywhere near the top of the body text.
fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)Chương\s+\d+\s*[:\-]\s*(\S[^\r\n]*)").expect("chapter heading regex")
    })
}

/// Resolve a chapter's display title.
///
/// Precedence: site-provided title, then a heading scraped out of the body
/// text, then the bare `Chương N` label. Every path that names a chapter
/// (fetch, resume, navigation build) goes through here so the three agree.
pub fn infer_title(index: u32, site_title: Option<&str>, text: &str) -> String {
    if let Some(site_title) = site_title {
        let site_title = site_title.trim();
        if !site_title.is_empty() && !is_placeholder(site_title, index) {
            return site_title.to_string();
        }
    }

    if let Some(captures) = heading_pattern().captures(text) {
        let rest = captures[1].trim().trim_end_matches('.');
        if !rest.is_empty() {
            return format!("Chương {index}: {rest}");
        }
    }

    format!("Chương {index}")
}

/// Generic labels the sites emit when a chapter has no real name.
fn is_placeholder(title: &str, index: u32) -> bool {
    let title = title.trim();
    title.eq_ignore_ascii_case(&format!("Chương {index}"))
        || title.eq_ignore_ascii_case(&format!("Chapter {index}"))
}

/// Pull the `<title>` text out of a stored XHTML document. Used when the
/// embedded title is the only surviving evidence (resume, navigation).
pub fn title_from_document(xhtml: &str) -> Option<String> {
    let lower = xhtml.to_ascii_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = start + lower[start..].find("</title>")?;
    let title = xhtml[start..end].trim();
    if title.is_empty() {
        return None;
    }
    Some(crate::epub::xml_unescape(title))
}
