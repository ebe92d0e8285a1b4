use anyhow::{Context, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use std::fs;
use std::path::Path;

/// Plain text extracted from an uploaded file, ready for ingestion
#[derive(Debug, Clone)]
pub struct Document {
    /// Extracted text; may be empty, ingestion decides what to do with that
    pub content: String,
    /// The document's file name, recorded on every chunk
    pub source_file: String,
    pub mime_type: String,
}

impl Document {
    /// Read and extract a document from disk
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        let file_name = path
            .file_name()
            .context("Invalid file name")?
            .to_str()
            .context("Invalid file name encoding")?
            .to_string();

        let bytes =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_bytes(&file_name, &bytes)
    }

    /// Extract a document whose type is guessed from `file_name`
    pub fn from_bytes(file_name: &str, bytes: &[u8]) -> Result<Self> {
        let mime_type = from_path(file_name).first_or_octet_stream().to_string();
        debug!("Detected MIME type {} for {}", mime_type, file_name);

        let content = extract_text(bytes, &mime_type)
            .with_context(|| format!("Failed to extract text from {}", file_name))?;

        Ok(Document {
            content,
            source_file: file_name.to_string(),
            mime_type,
        })
    }
}

/// Turn raw bytes into plain text according to their MIME type
pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String> {
    match mime_type {
        mime if mime.starts_with("application/pdf") => {
            info!("Extracting text from PDF ({} bytes)", bytes.len());
            let raw = pdf_extract::extract_text_from_mem(bytes).context("Invalid PDF")?;
            let text = tidy_extracted_text(&raw);

            if text.is_empty() {
                warn!("Extracted PDF content is empty or contains only whitespace");
            }

            Ok(text)
        }

        mime if mime.starts_with("text/") => {
            String::from_utf8(bytes.to_vec()).context("Text file is not valid UTF-8")
        }

        _ => Err(anyhow::anyhow!(
            "Unsupported document format: {}. Only text and PDF files are supported.",
            mime_type
        )),
    }
}

/// Collapse runs of spaces and tabs within a line and keep at most one blank
/// line between paragraphs. PDF extraction tends to produce both.
fn tidy_extracted_text(text: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut blank_run = false;

    for line in text.lines() {
        let line = line
            .split([' ', '\t'])
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if line.is_empty() {
            if !blank_run && !paragraphs.is_empty() {
                paragraphs.push(String::new());
            }
            blank_run = true;
        } else {
            paragraphs.push(line);
            blank_run = false;
        }
    }

    paragraphs.join("\n").trim().to_string()
}
