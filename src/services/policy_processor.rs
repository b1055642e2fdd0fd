use std::collections::VecDeque;
use std::io::{Cursor, Read};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use strum_macros::{AsRefStr, EnumString};

use super::embedding::embed;

#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FileType {
    Pdf,
    Docx,
    Doc,
    Txt,
}

impl FileType {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        ext.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedChunk {
    pub index: usize,
    pub content: String,
    pub section_title: Option<String>,
    pub page_number: Option<i32>,
    pub embedding: Vec<f32>,
}

/// Recursive character splitter: tries each separator in turn, keeps the separator at the
/// start of the following piece, and re-merges pieces into windows with a trailing overlap.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<&'static str>,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            separators: vec!["\n\n", "\n", ". ", " ", ""],
        }
    }
}

impl TextSplitter {
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[&'static str]) -> Vec<String> {
        let mut separator = separators.last().copied().unwrap_or("");
        let mut remaining: &[&'static str] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = candidate;
                break;
            }
            if text.contains(candidate) {
                separator = candidate;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut good = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if piece.chars().count() < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge(std::mem::take(&mut good)));
            }
            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_with(&piece, remaining));
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge(good));
        }
        chunks
    }

    fn merge(&self, pieces: Vec<String>) -> Vec<String> {
        let mut docs = Vec::new();
        let mut window: VecDeque<(String, usize)> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = piece.chars().count();
            if total + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut docs, &window);
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
            total += len;
            window.push_back((piece, len));
        }
        push_joined(&mut docs, &window);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, window: &VecDeque<(String, usize)>) {
    let joined: String = window.iter().map(|(s, _)| s.as_str()).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let mut parts = text.split(separator);
    let mut out = Vec::new();
    if let Some(first) = parts.next() {
        out.push(first.to_string());
    }
    out.extend(parts.map(|p| format!("{separator}{p}")));
    out.retain(|p| !p.is_empty());
    out
}

/// First of the first three lines that is all caps or ends with a colon.
pub fn section_title(chunk: &str) -> Option<String> {
    chunk
        .split('\n')
        .take(3)
        .find(|line| {
            let has_upper = line.chars().any(char::is_uppercase);
            let has_lower = line.chars().any(char::is_lowercase);
            !line.trim().is_empty() && ((has_upper && !has_lower) || line.ends_with(':'))
        })
        .map(|line| line.trim().to_string())
}

/// Offsets and numbers of `--- Page N ---` markers.
fn page_markers(text: &str) -> Vec<(usize, i32)> {
    const PREFIX: &str = "--- Page ";
    let mut markers = Vec::new();
    let mut from = 0;
    while let Some(pos) = text[from..].find(PREFIX) {
        let start = from + pos;
        let digits: String = text[start + PREFIX.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(n) = digits.parse() {
            markers.push((start, n));
        }
        from = start + PREFIX.len();
    }
    markers
}

fn page_for(markers: &[(usize, i32)], start: usize, end: usize) -> Option<i32> {
    markers
        .iter()
        .take_while(|(pos, _)| *pos <= start)
        .last()
        .or_else(|| markers.iter().find(|(pos, _)| *pos < end))
        .map(|(_, page)| *page)
}

#[derive(Debug, Default, Clone)]
pub struct PolicyProcessor {
    splitter: TextSplitter,
}

impl PolicyProcessor {
    pub fn extract_text(&self, content: &[u8], file_type: FileType) -> Result<String> {
        match file_type {
            FileType::Pdf => extract_pdf(content),
            FileType::Docx | FileType::Doc => extract_docx(content),
            FileType::Txt => {
                String::from_utf8(content.to_vec()).context("text file is not valid UTF-8")
            }
        }
        .context("Failed to extract text")
    }

    pub fn chunk(&self, text: &str) -> Vec<ProcessedChunk> {
        let markers = page_markers(text);
        let mut cursor = 0;

        self.splitter
            .split(text)
            .into_iter()
            .enumerate()
            .map(|(index, content)| {
                let page_number = text[cursor..].find(&content).and_then(|rel| {
                    let start = cursor + rel;
                    cursor = start + content.chars().next().map_or(1, char::len_utf8);
                    page_for(&markers, start, start + content.len())
                });
                ProcessedChunk {
                    index,
                    section_title: section_title(&content),
                    embedding: embed(&content),
                    page_number,
                    content,
                }
            })
            .collect()
    }
}

fn extract_pdf(content: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(content).map_err(|e| anyhow!("invalid PDF: {e}"))?;
    let mut text = String::new();
    for page in doc.get_pages().keys() {
        let page_text = doc.extract_text(&[*page]).unwrap_or_default();
        text.push_str(&format!("\n--- Page {page} ---\n{page_text}\n"));
    }
    Ok(text)
}

fn extract_docx(content: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(content)).context("document is not a DOCX archive")?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX has no word/document.xml")?
        .read_to_string(&mut xml)?;
    docx_xml_to_text(&xml)
}

/// Raw text of a WordprocessingML body; paragraphs are separated by a blank line.
fn docx_xml_to_text(xml: &str) -> Result<String> {
    let mut out = String::new();
    let mut in_text = false;
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        if in_text {
            out.push_str(&decode_entities(&rest[..open]));
        }
        let Some(close) = rest[open..].find('>') else {
            bail!("unterminated tag in document.xml");
        };
        let tag = &rest[open + 1..open + close];
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or("");

        match name {
            "w:t" if !self_closing => in_text = true,
            "/w:t" => in_text = false,
            "/w:p" => out.push_str("\n\n"),
            "w:tab" => out.push('\t'),
            "w:br" | "w:cr" => out.push('\n'),
            _ => {}
        }
        rest = &rest[open + close + 1..];
    }

    Ok(out.trim_end().to_string())
}

/// Resolves the predefined XML entities and numeric character references.
/// Anything unrecognised is kept as written.
fn decode_entities(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest
            .find(';')
            .and_then(|semi| entity(&rest[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = TextSplitter::default().split("  LEAVE POLICY\n\nAnnual leave is 20 days.  ");
        assert_eq!(chunks, vec!["LEAVE POLICY\n\nAnnual leave is 20 days."]);
    }

    #[test]
    fn long_text_overlaps_between_windows() {
        let text: String = (0..60)
            .map(|i| format!("Sentence number {i:02} is here. "))
            .collect();
        let chunks = TextSplitter::default().split(&text);

        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));

        let first = &chunks[0];
        let tail = &first[first.len() - 16..];
        assert!(chunks[1].contains(tail), "second chunk should repeat {tail:?}");
    }

    #[test]
    fn unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(2500);
        let chunks = TextSplitter::default().split(&text);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= 1000));
    }

    #[test]
    fn section_titles() {
        assert_eq!(
            section_title("SICK LEAVE\nEmployees may take..."),
            Some("SICK LEAVE".to_string())
        );
        assert_eq!(
            section_title("\nNotice period:\n14 days"),
            Some("Notice period:".to_string())
        );
        assert_eq!(section_title("a\nb\nc\nTITLE"), None);
        assert_eq!(section_title("12345\nplain"), None);
    }

    #[test]
    fn chunks_know_their_page() {
        let processor = PolicyProcessor::default();
        let text = "\n--- Page 1 ---\nANNUAL LEAVE\nTwenty days.\n\n--- Page 2 ---\nSICK LEAVE\nTen days.\n";
        let chunks = processor.chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_number, Some(1));
        assert_eq!(chunks[0].embedding.len(), crate::services::embedding::EMBEDDING_DIM);

        assert!(processor.chunk("no markers here")[0].page_number.is_none());
    }

    #[test]
    fn file_types_from_names() {
        assert_eq!(FileType::from_filename("Policy.PDF"), Some(FileType::Pdf));
        assert_eq!(FileType::from_filename("a.b.docx"), Some(FileType::Docx));
        assert_eq!(FileType::from_filename("notes.md"), None);
        assert_eq!(FileType::from_filename("README"), None);
    }

    #[test]
    fn txt_must_be_utf8() {
        let processor = PolicyProcessor::default();
        assert_eq!(
            processor.extract_text(b"Leave rules", FileType::Txt).unwrap(),
            "Leave rules"
        );
        assert!(processor.extract_text(&[0xff, 0xfe], FileType::Txt).is_err());
        assert!(processor.extract_text(b"%PDF-broken", FileType::Pdf).is_err());
    }

    #[test]
    fn docx_paragraphs_are_extracted() {
        let xml = r#"<?xml version="1.0"?><w:document><w:body>
            <w:p><w:r><w:t>LEAVE POLICY</w:t></w:r></w:p>
            <w:p><w:r><w:t xml:space="preserve">Annual &amp; sick </w:t></w:r><w:r><w:tab/><w:t>leave</w:t></w:r></w:p>
            <w:tbl><w:tc/></w:tbl>
        </w:body></w:document>"#;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let text = PolicyProcessor::default()
            .extract_text(&bytes, FileType::Docx)
            .unwrap();
        assert_eq!(text, "LEAVE POLICY\n\nAnnual & sick \tleave");
    }

    #[test]
    fn character_references_are_decoded() {
        let xml = "<w:p><w:r><w:t>Employee&#8217;s notice &#x2013; 14 days</w:t></w:r></w:p>";
        assert_eq!(docx_xml_to_text(xml).unwrap(), "Employee\u{2019}s notice \u{2013} 14 days");
        assert_eq!(decode_entities("a &amp;lt; b"), "a &lt; b");
        assert_eq!(decode_entities("R&D &#xZZ; &bogus; & done"), "R&D &#xZZ; &bogus; & done");
    }
}
