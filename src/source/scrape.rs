//! Small substring-based extraction helpers shared by the site clients.
//! These favor resilience over fidelity: a miss returns `None` and the
//! caller picks a fallback.

/// Inner HTML of the first `tag` element whose open tag contains `marker`
/// (e.g. a class or attribute fragment). Handles nesting of the same tag.
pub fn tag_block_inner<'a>(html: &'a str, tag: &str, marker: &str) -> Option<&'a str> {
    let lower = html.to_ascii_lowercase();
    let open_prefix = format!("<{tag}");
    let close_tag = format!("</{tag}>");

    let mut pos = 0usize;
    loop {
        let start = pos + lower[pos..].find(&open_prefix)?;
        let open_end = start + lower[start..].find('>')?;
        let open_tag = &html[start..=open_end];
        if !open_tag.contains(marker) {
            pos = open_end + 1;
            continue;
        }

        // Walk forward balancing nested openings of the same tag.
        let mut depth = 1usize;
        let mut cursor = open_end + 1;
        while depth > 0 {
            let next_open = lower[cursor..].find(&open_prefix);
            let next_close = lower[cursor..].find(&close_tag)?;
            match next_open {
                Some(rel_open) if rel_open < next_close => {
                    depth += 1;
                    cursor += rel_open + open_prefix.len();
                }
                _ => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&html[open_end + 1..cursor + next_close]);
                    }
                    cursor += next_close + close_tag.len();
                }
            }
        }
    }
}

/// Text of the first `<tag …>…</tag>` occurrence.
pub fn first_tag_text(html: &str, tag: &str) -> Option<String> {
    let inner = tag_block_inner(html, tag, "")?;
    let text = strip_tags(inner);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

/// Value of `attr="…"` / `attr='…'` inside one tag's markup.
pub fn attr_value(tag_html: &str, attr: &str) -> Option<String> {
    let lower = tag_html.to_ascii_lowercase();
    let needle = format!("{attr}=");
    let mut pos = 0usize;
    loop {
        let rel = lower[pos..].find(&needle)?;
        let at = pos + rel;
        // Require a word boundary before the attribute name.
        if at > 0
            && lower
                .as_bytes()
                .get(at - 1)
                .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'-')
        {
            pos = at + needle.len();
            continue;
        }
        let value_start = at + needle.len();
        let quote = tag_html.as_bytes().get(value_start).copied()?;
        if quote != b'"' && quote != b'\'' {
            pos = value_start;
            continue;
        }
        let inner = &tag_html[value_start + 1..];
        let end = inner.find(quote as char)?;
        return Some(inner[..end].to_string());
    }
}

/// Plain text of a fragment: tags dropped, common entities decoded,
/// whitespace collapsed per line.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let decoded = decode_entities(&out);
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Like [`strip_tags`] but paragraph and line-break tags become newlines
/// first, preserving the text's paragraph structure.
pub fn text_with_breaks(html: &str) -> String {
    let mut with_breaks = html.replace("</p>", "\n").replace("</P>", "\n");
    for br in ["<br>", "<br/>", "<br />", "<BR>"] {
        with_breaks = with_breaks.replace(br, "\n");
    }
    strip_tags(&with_breaks)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
