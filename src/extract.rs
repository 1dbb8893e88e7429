//! Document loader: bytes + declared format in, normalized text out.
//!
//! Each format yields ordered segments that become chunk sections:
//!
//! | Format | Segment |
//! |--------|---------|
//! | PDF | page |
//! | DOCX | paragraph |
//! | PPTX | slide |
//! | XLSX | sheet |
//! | text / markdown | paragraph (markdown: nearest heading) |
//!
//! Failures are [`LoadError`]s scoped to the document; nothing here panics
//! on malformed input or aborts a batch.

use std::io::{Cursor, Read};

use docqa_core::error::LoadError;
use docqa_core::models::{Document, NormalizedText, SourceFormat};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Upper bound on decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// Output of [`Loader::load`].
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub format: SourceFormat,
    pub text: NormalizedText,
}

/// Converts documents into [`NormalizedText`].
#[derive(Debug, Clone, Copy)]
pub struct Loader {
    max_bytes: usize,
}

impl Loader {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn load(&self, doc: &Document) -> Result<LoadedDocument, LoadError> {
        let format = doc
            .source_format
            .parse::<SourceFormat>()
            .map_err(|format| LoadError::Unsupported {
                document_id: doc.document_id.clone(),
                format,
            })?;
        if doc.content.len() > self.max_bytes {
            return Err(LoadError::TooLarge {
                document_id: doc.document_id.clone(),
                size: doc.content.len(),
                limit: self.max_bytes,
            });
        }

        let corrupt = |cause: String| LoadError::Corrupt {
            document_id: doc.document_id.clone(),
            format: format.to_string(),
            cause,
        };
        let text = match format {
            SourceFormat::Pdf => load_pdf(&doc.content),
            SourceFormat::Docx => load_docx(&doc.content),
            SourceFormat::Pptx => load_pptx(&doc.content),
            SourceFormat::Xlsx => load_xlsx(&doc.content),
            SourceFormat::Text => decode_utf8(&doc.content).map(|s| load_plain(&s)),
            SourceFormat::Markdown => decode_utf8(&doc.content).map(|s| load_markdown(&s)),
        }
        .map_err(corrupt)?;

        if text.text.trim().is_empty() {
            return Err(LoadError::Empty {
                document_id: doc.document_id.clone(),
            });
        }
        Ok(LoadedDocument { format, text })
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, String> {
    let s = std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {e}"))?;
    Ok(s.strip_prefix('\u{feff}').unwrap_or(s).replace("\r\n", "\n"))
}

fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").filter(|p| !p.trim().is_empty())
}

fn load_plain(text: &str) -> NormalizedText {
    NormalizedText::from_parts(
        paragraphs(text)
            .enumerate()
            .map(|(i, p)| (format!("paragraph {}", i + 1), p)),
    )
}

fn load_markdown(text: &str) -> NormalizedText {
    let mut heading: Option<String> = None;
    let mut parts = Vec::new();
    for (i, p) in paragraphs(text).enumerate() {
        let first = p.trim_start().lines().next().unwrap_or_default();
        if first.starts_with('#') {
            heading = Some(first.trim_start_matches('#').trim().to_string());
        }
        let label = heading
            .clone()
            .unwrap_or_else(|| format!("paragraph {}", i + 1));
        parts.push((label, p));
    }
    NormalizedText::from_parts(parts)
}

fn load_pdf(bytes: &[u8]) -> Result<NormalizedText, String> {
    // pdf-extract panics on some malformed fonts and streams.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| "PDF parser panicked".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(NormalizedText::from_parts(
        pages
            .iter()
            .enumerate()
            .map(|(i, page)| (format!("page {}", i + 1), page.as_str())),
    ))
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, String> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{name}: {e}"))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{name}: {e}"))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        ));
    }
    Ok(out)
}

/// Entries named `{prefix}{n}.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<(u32, String)> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|n| {
            let num = n.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
            Some((num, n.to_string()))
        })
        .collect();
    names.sort();
    names
}

/// Collect the text of `<*:t>` runs, one string per `<*:p>` paragraph.
fn xml_paragraphs(xml: &[u8]) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let p = current.trim();
                    if !p.is_empty() {
                        paragraphs.push(p.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if matches!(e.local_name().as_ref(), b"tab" | b"br") => {
                current.push(' ')
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs)
}

fn load_docx(bytes: &[u8]) -> Result<NormalizedText, String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    let paras = xml_paragraphs(&xml)?;
    Ok(NormalizedText::from_parts(
        paras
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("paragraph {}", i + 1), p.as_str())),
    ))
}

fn load_pptx(bytes: &[u8]) -> Result<NormalizedText, String> {
    let mut archive = open_archive(bytes)?;
    let mut parts = Vec::new();
    for (num, name) in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry(&mut archive, &name)?;
        parts.push((format!("slide {num}"), xml_paragraphs(&xml)?.join("\n")));
    }
    Ok(NormalizedText::from_parts(parts))
}

fn load_xlsx(bytes: &[u8]) -> Result<NormalizedText, String> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        let xml = read_entry(&mut archive, "xl/sharedStrings.xml")?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };
    let mut parts = Vec::new();
    for (num, name) in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        parts.push((format!("sheet {num}"), sheet_rows(&xml, &shared)?));
    }
    Ok(NormalizedText::from_parts(parts))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(|e| e.to_string())?)
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per row, cells separated by tabs.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    })
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| e.to_string())?;
                let raw = raw.trim();
                let value = if shared_cell {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                } else {
                    Some(raw.to_string())
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared_cell = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows
        .iter()
        .map(|r| r.join("\t"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(format: &str, bytes: &[u8]) -> Document {
        Document::new("doc-1", format, bytes.to_vec())
    }

    #[test]
    fn unsupported_format_is_load_error() {
        let err = Loader::new(1024).load(&doc("rtf", b"{\\rtf1}")).unwrap_err();
        assert_eq!(
            err,
            LoadError::Unsupported {
                document_id: "doc-1".into(),
                format: "rtf".into()
            }
        );
    }

    #[test]
    fn corrupt_inputs_are_load_errors() {
        let loader = Loader::new(1024);
        for format in ["pdf", "docx", "pptx", "xlsx"] {
            let err = loader.load(&doc(format, b"definitely not a document")).unwrap_err();
            assert!(
                matches!(err, LoadError::Corrupt { ref document_id, .. } if document_id == "doc-1"),
                "{format}: {err:?}"
            );
        }
        let err = loader.load(&doc("txt", &[0xff, 0xfe, 0x00])).unwrap_err();
        assert!(matches!(err, LoadError::Corrupt { .. }));
    }

    #[test]
    fn oversized_document_is_rejected() {
        let err = Loader::new(4).load(&doc("txt", b"hello world")).unwrap_err();
        assert!(matches!(err, LoadError::TooLarge { size: 11, limit: 4, .. }));
    }

    #[test]
    fn blank_document_is_empty() {
        let err = Loader::new(1024).load(&doc("txt", b" \n\n \n")).unwrap_err();
        assert!(matches!(err, LoadError::Empty { .. }));
    }

    #[test]
    fn plain_text_paragraphs_become_segments() {
        let loaded = Loader::new(1024)
            .load(&doc(
                "txt",
                b"The sky is blue.\r\n\r\nWater is wet.\n\n\n\nFire is hot.\n",
            ))
            .unwrap();
        assert_eq!(loaded.format, SourceFormat::Text);
        assert_eq!(
            loaded.text.text,
            "The sky is blue.\n\nWater is wet.\n\nFire is hot."
        );
        let labels: Vec<_> = loaded.text.segments.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["paragraph 1", "paragraph 2", "paragraph 3"]);
    }

    #[test]
    fn markdown_sections_follow_headings() {
        let md = b"Intro text.\n\n# Leave\n\nTwenty days.\n\n## Sick leave\n\nTen days.";
        let loaded = Loader::new(1024).load(&doc("md", md)).unwrap();
        let labels: Vec<_> = loaded.text.segments.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["paragraph 1", "Leave", "Leave", "Sick leave", "Sick leave"]
        );
    }

    #[test]
    fn xml_paragraphs_keep_run_spacing() {
        let xml = br#"<w:document xmlns:w="x"><w:body>
            <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
            <w:p><w:r><w:t>A &amp; B</w:t><w:tab/><w:t>C</w:t></w:r></w:p>
            <w:p></w:p>
        </w:body></w:document>"#;
        let paras = xml_paragraphs(xml).unwrap();
        assert_eq!(paras, vec!["Hello world", "A & B C"]);
    }

    #[test]
    fn sheet_rows_resolve_shared_strings() {
        let shared = vec!["Name".to_string(), "Days".to_string(), "Alice".to_string()];
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
            <row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>12</v></c></row>
        </sheetData></worksheet>"#;
        assert_eq!(sheet_rows(xml, &shared).unwrap(), "Name\tDays\nAlice\t12");
    }
}
