//! Navigation documents (EPUB 3 nav and NCX) rendered as pure functions of
//! the derived spine. Rebuilt in full before every save; the same input
//! always yields byte-identical output.

use crate::epub::{SpineDoc, xml_escape};

/// One table-of-contents row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavEntry {
    pub href: String,
    pub title: String,
}

/// TOC rows for a spine: the intro page first, then every chapter document
/// (split parts appear individually, in spine order).
pub fn toc_entries(spine: &[SpineDoc]) -> Vec<NavEntry> {
    let mut entries = vec![NavEntry {
        href: "intro.xhtml".to_string(),
        title: "Giới thiệu".to_string(),
    }];
    entries.extend(spine.iter().map(|doc| NavEntry {
        href: format!("{}.xhtml", doc.stem),
        title: doc.title.clone(),
    }));
    entries
}

pub fn render_nav_xhtml(book_title: &str, lang: &str, entries: &[NavEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(book_title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(book_title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\" role=\"doc-toc\">\n");
    out.push_str("    <ol>\n");
    for entry in entries {
        out.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            xml_escape(&entry.href),
            xml_escape(&entry.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

pub fn render_toc_ncx(book_title: &str, identifier: &str, entries: &[NavEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{}\" />\n",
        xml_escape(identifier)
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(book_title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");
    for (idx, entry) in entries.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&entry.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}\" />\n",
            xml_escape(&entry.href)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}
