//! Page-level text extraction for downloaded documents.
//!
//! Every supported format is reduced to a list of [`RawPage`]s carrying the
//! document's own (digital) text. Pages come out 1-based and in order:
//!
//! | Format | Page unit |
//! |--------|-----------|
//! | PDF | PDF page |
//! | PPTX | slide |
//! | XLSX | worksheet |
//! | DOCX, text, markdown, CSV | whole file as page 1 |
//! | PNG, JPEG, TIFF | page 1 with no digital text (OCR only) |
//!
//! Deciding which pages need OCR is the adapter's job; this module never
//! runs OCR itself.

use std::io::Read;
use std::path::Path;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_TIFF: &str = "image/tiff";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Decompressed bytes read from one ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("OCR failed: {0}")]
    Ocr(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("no page produced any text")]
    NoText,
}

/// Digital text of one page, before any OCR decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub page_number: u32,
    pub text: String,
}

pub fn is_image(mime_type: &str) -> bool {
    matches!(mime_type, MIME_PNG | MIME_JPEG | MIME_TIFF)
}

pub fn is_supported(mime_type: &str) -> bool {
    is_image(mime_type)
        || matches!(
            mime_type,
            MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX | MIME_TEXT | MIME_MARKDOWN | MIME_CSV
        )
}

/// Content type from a file extension. Unknown extensions map to
/// `application/octet-stream`, which extraction rejects.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        "md" | "markdown" => MIME_MARKDOWN,
        "txt" => MIME_TEXT,
        "csv" => MIME_CSV,
        "png" => MIME_PNG,
        "jpg" | "jpeg" => MIME_JPEG,
        "tif" | "tiff" => MIME_TIFF,
        _ => "application/octet-stream",
    }
}

/// Count of non-whitespace characters, the measure of text density.
pub fn text_density(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

pub fn extract_pages(bytes: &[u8], mime_type: &str) -> Result<Vec<RawPage>, ExtractionError> {
    match mime_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes).map(single_page),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_TEXT | MIME_MARKDOWN | MIME_CSV => {
            Ok(single_page(String::from_utf8_lossy(bytes).into_owned()))
        }
        m if is_image(m) => Ok(single_page(String::new())),
        _ => Err(ExtractionError::UnsupportedContentType(
            mime_type.to_string(),
        )),
    }
}

fn single_page(text: String) -> Vec<RawPage> {
    vec![RawPage {
        page_number: 1,
        text,
    }]
}

fn numbered(texts: Vec<String>) -> Vec<RawPage> {
    texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| RawPage {
            page_number: i as u32 + 1,
            text,
        })
        .collect()
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<RawPage>, ExtractionError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractionError::Pdf(e.to_string()))?;
    Ok(numbered(pages))
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractionError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractionError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractionError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractionError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractionError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `{prefix}{n}.xml`, ordered by `n`.
fn numbered_entries(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<*:t>` element. A newline is emitted at the end of each
/// `<*:{paragraph}>` element so paragraph structure survives chunking.
fn collect_text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == paragraph && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<RawPage>, ExtractionError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        slides.push(collect_text_runs(&xml, b"p")?);
    }
    Ok(numbered(slides))
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<RawPage>, ExtractionError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        sheets.push(sheet_rows(&xml, &shared_strings)?);
    }
    Ok(numbered(sheets))
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractionError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per row, cells separated by tabs. Shared strings are resolved;
/// numbers and inline strings are kept as written.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(v) = resolved {
                        row.push(v);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
