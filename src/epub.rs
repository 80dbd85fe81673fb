//! Persistence engine: the single writer of the on-disk EPUB container.
//!
//! Every save derives the spine from the current chapter set (ascending
//! index, split parts contiguous), rebuilds both navigation documents from
//! that spine, and serializes the container to a temporary sibling path
//! before renaming it into place.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;
use zip::write::SimpleFileOptions;

use crate::book::BookDocument;
use crate::error::DownloadError;

/// One content document of the derived spine. `stem` follows the
/// `chapter_<index>[_<part>]` naming contract the resume loader depends on.
#[derive(Debug, Clone)]
pub struct SpineDoc {
    pub stem: String,
    pub title: String,
    pub body_html: String,
}

/// Derive the chapter spine: ascending by index, each oversized chapter
/// replaced by its contiguous split parts. Splitting failures degrade to
/// keeping the chapter whole.
pub fn build_spine(document: &BookDocument) -> Vec<SpineDoc> {
    let mut spine = Vec::with_capacity(document.chapter_count());
    for chapter in document.chapters() {
        match crate::split::split_oversized(chapter) {
            Some(parts) => {
                for part in parts {
                    spine.push(SpineDoc {
                        stem: format!("chapter_{}_{}", chapter.index, part.part),
                        title: part.title,
                        body_html: part.html,
                    });
                }
            }
            None => spine.push(SpineDoc {
                stem: format!("chapter_{}", chapter.index),
                title: chapter.title.clone(),
                body_html: chapter.html.clone(),
            }),
        }
    }
    spine
}

/// Serialize the document to `out_path`. Blocking; callers on the async side
/// run this under `spawn_blocking`. Failures are `PersistenceError` and are
/// not retried here.
pub fn save(document: &BookDocument, out_path: &Path) -> Result<(), DownloadError> {
    try_save(document, out_path).map_err(DownloadError::Persistence)
}

fn try_save(document: &BookDocument, out_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let tmp_path = out_path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let result = write_container(document, &tmp_path);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    fs::rename(&tmp_path, out_path)
        .with_context(|| format!("rename into place: {}", out_path.display()))?;
    Ok(())
}

fn write_container(document: &BookDocument, path: &Path) -> anyhow::Result<()> {
    let meta = &document.metadata;
    let spine = build_spine(document);
    let entries = crate::nav::toc_entries(&spine);

    let nav_xhtml = crate::nav::render_nav_xhtml(&meta.title, &meta.language, &entries);
    let toc_ncx = crate::nav::render_toc_ncx(&meta.title, &meta.identifier, &entries);
    let content_opf = render_content_opf(document, &spine);

    let out_file =
        File::create(path).with_context(|| format!("create epub: {}", path.display()))?;
    let mut zip = zip::ZipWriter::new(out_file);

    // Per EPUB spec, `mimetype` MUST be the first entry and MUST be stored
    // (no compression).
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let write_entry = |zip: &mut zip::ZipWriter<File>, name: &str, data: &[u8]| {
        zip.start_file(name, deflated)
            .with_context(|| format!("epub start_file: {name}"))?;
        zip.write_all(data)
            .with_context(|| format!("epub write: {name}"))?;
        anyhow::Ok(())
    };

    write_entry(
        &mut zip,
        "META-INF/container.xml",
        render_container_xml().as_bytes(),
    )?;
    write_entry(&mut zip, "OEBPS/content.opf", content_opf.as_bytes())?;
    write_entry(&mut zip, "OEBPS/nav.xhtml", nav_xhtml.as_bytes())?;
    write_entry(&mut zip, "OEBPS/toc.ncx", toc_ncx.as_bytes())?;
    write_entry(&mut zip, "OEBPS/style.css", reader_stylesheet().as_bytes())?;

    let intro = wrap_xhtml_document("Giới thiệu", &meta.language, &document.intro_html);
    write_entry(&mut zip, "OEBPS/intro.xhtml", intro.as_bytes())?;

    for doc in &spine {
        let body = format!("<h2>{}</h2>\n{}", xml_escape(&doc.title), doc.body_html);
        let xhtml = wrap_xhtml_document(&doc.title, &meta.language, &body);
        write_entry(
            &mut zip,
            &format!("OEBPS/{}.xhtml", doc.stem),
            xhtml.as_bytes(),
        )?;
    }

    if let Some(cover) = &document.cover {
        write_entry(
            &mut zip,
            &format!("OEBPS/cover{}", cover.extension),
            &cover.bytes,
        )?;
    }

    zip.finish().context("epub finish zip")?;
    Ok(())
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

/// Reading stylesheet tuned for e-ink readers: justified serif text,
/// indented paragraphs, headings kept with their content.
fn reader_stylesheet() -> String {
    r#"@charset "utf-8";

html, body {
  margin: 0;
  padding: 0;
  font-family: serif;
  line-height: 1.5;
  text-align: justify;
  hyphens: auto;
}

body { padding: 0 3%; font-size: 1em; }

h1, h2, h3, h4 {
  text-align: center;
  font-weight: bold;
  margin: 1em 0;
  page-break-after: avoid;
  page-break-inside: avoid;
}

h1 { font-size: 1.5em; }
h2 { font-size: 1.3em; }

p {
  margin: 0;
  padding: 0;
  text-indent: 1.5em;
  orphans: 2;
  widows: 2;
}

p + p { margin-top: 0.3em; }

img { max-width: 100%; height: auto; }
"#
    .to_string()
}

fn render_content_opf(document: &BookDocument, spine: &[SpineDoc]) -> String {
    let meta = &document.metadata;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(&meta.language)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">urn:uuid:{}</dc:identifier>\n",
        xml_escape(&meta.identifier)
    ));
    out.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        xml_escape(&meta.title)
    ));
    out.push_str(&format!(
        "    <dc:creator>{}</dc:creator>\n",
        xml_escape(&meta.author)
    ));
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(&meta.language)
    ));
    if document.cover.is_some() {
        out.push_str("    <meta name=\"cover\" content=\"cover-image\" />\n");
    }
    out.push_str("  </metadata>\n");

    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    out.push_str(
        "    <item id=\"intro\" href=\"intro.xhtml\" media-type=\"application/xhtml+xml\" />\n",
    );
    for doc in spine {
        out.push_str(&format!(
            "    <item id=\"{stem}\" href=\"{stem}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            stem = xml_escape(&doc.stem)
        ));
    }
    if let Some(cover) = &document.cover {
        out.push_str(&format!(
            "    <item id=\"cover-image\" href=\"cover{ext}\" media-type=\"{media}\" properties=\"cover-image\" />\n",
            ext = xml_escape(&cover.extension),
            media = cover_media_type(&cover.extension)
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine toc=\"ncx\">\n");
    out.push_str("    <itemref idref=\"nav\" />\n");
    out.push_str("    <itemref idref=\"intro\" />\n");
    for doc in spine {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&doc.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn cover_media_type(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

pub fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

pub fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
