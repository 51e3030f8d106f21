//! Upload validation and multi-format text extraction.
//!
//! Dispatches on the file extension: PDF via `pdf-extract`, DOCX by pulling
//! `w:t` runs out of the OOXML archive, Markdown and plain text decoded as
//! UTF-8 (Markdown is indexed as plain text). Each parsed upload gets a
//! deterministic `document_id` derived from the filename and a SHA-256 of
//! the bytes, which makes re-uploading identical content idempotent.

use std::io::Read;

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{RagError, Result};

/// Decompressed-size cap for a single OOXML archive entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Validates and parses uploaded documents.
pub struct DocumentLoader {
    allowed_extensions: Vec<String>,
    max_file_size: u64,
}

impl DocumentLoader {
    pub fn new(config: &Config) -> Self {
        Self {
            allowed_extensions: config.allowed_extensions.clone(),
            max_file_size: config.max_file_size_bytes(),
        }
    }

    /// Reject uploads with a disallowed extension or an oversized body
    /// before any bytes are parsed.
    pub fn validate(&self, filename: &str, size: u64) -> Result<()> {
        let ext = extension_of(filename)
            .ok_or_else(|| RagError::UnsupportedFormat("(no extension)".to_string()))?;

        if !self.allowed_extensions.iter().any(|allowed| allowed == &ext) {
            return Err(RagError::UnsupportedFormat(ext));
        }

        if size > self.max_file_size {
            return Err(RagError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        Ok(())
    }

    /// Extract text from the upload and assign its document identity.
    ///
    /// Returns `(text, document_id)`. Parses that produce no text at all
    /// fail with [`RagError::ParseFailed`].
    pub fn parse(&self, filename: &str, bytes: &[u8]) -> Result<(String, String)> {
        let ext = extension_of(filename)
            .ok_or_else(|| RagError::UnsupportedFormat("(no extension)".to_string()))?;

        let text = match ext.as_str() {
            ".pdf" => parse_pdf(bytes)?,
            ".docx" => parse_docx(bytes)?,
            ".md" | ".txt" => parse_text(bytes),
            other => return Err(RagError::UnsupportedFormat(other.to_string())),
        };

        if text.trim().is_empty() {
            return Err(RagError::ParseFailed("no extractable text".to_string()));
        }

        Ok((text, document_id(filename, bytes)))
    }
}

/// Lowercased extension including the leading dot, e.g. `".pdf"`.
pub fn extension_of(filename: &str) -> Option<String> {
    let dot = filename.rfind('.')?;
    if dot + 1 == filename.len() {
        return None;
    }
    Some(filename[dot..].to_ascii_lowercase())
}

/// Deterministic document identity: `doc_` + the first 12 hex characters of
/// `sha256(filename || sha256(bytes))`. Identical bytes under the same name
/// always map to the same id; the content hash keeps different files that
/// share a name apart.
pub fn document_id(filename: &str, bytes: &[u8]) -> String {
    let content_hash = Sha256::digest(bytes);

    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(content_hash);
    let digest = format!("{:x}", hasher.finalize());

    format!("doc_{}", &digest[..12])
}

fn parse_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::ParseFailed(format!("pdf: {e}")))
}

fn parse_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Pull the text runs out of `word/document.xml`, joining paragraphs with
/// blank lines so the chunker sees paragraph boundaries.
fn parse_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| RagError::ParseFailed(format!("docx: {e}")))?;

    let mut document_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| RagError::ParseFailed("docx: word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut document_xml)
            .map_err(|e| RagError::ParseFailed(format!("docx: {e}")))?;
        if document_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(RagError::ParseFailed(
                "docx: word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(document_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(text)) =
                        reader.read_event_into(&mut buf)
                    {
                        current.push_str(text.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !current.trim().is_empty() {
                    paragraphs.push(std::mem::take(&mut current));
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(RagError::ParseFailed(format!("docx: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    if !current.trim().is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs.join("\n\n"))
}
