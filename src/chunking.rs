use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default window size, in characters
pub const DEFAULT_WINDOW: usize = 500;
/// How far back from the window end to look for a boundary
pub const DEFAULT_LOOKBACK: usize = 100;

const BOUNDARY_CHARS: [char; 4] = ['.', '\n', '!', '?'];

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    /// Unique identifier of this chunk
    pub id: String,
    /// The trimmed text content of this chunk, never empty
    pub content: String,
    /// Name of the document this chunk was cut from
    pub source_file: String,
    /// Position of this chunk within its ingestion call, starting at 0
    pub chunk_index: usize,
    pub created_at: DateTime<Utc>,
}

impl TextChunk {
    fn new(content: &str, source_file: &str, chunk_index: usize) -> Self {
        TextChunk {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            source_file: source_file.to_string(),
            chunk_index,
            created_at: Utc::now(),
        }
    }
}

/// Window and lookback sizes used when cutting text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    pub window: usize,
    pub lookback: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig {
            window: DEFAULT_WINDOW,
            lookback: DEFAULT_LOOKBACK,
        }
    }
}

/// Splits document text into contiguous, non-overlapping chunks that
/// preferably end on a sentence or paragraph boundary.
#[derive(Debug, Clone, Default)]
pub struct ChunkSplitter {
    config: SplitterConfig,
}

impl ChunkSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        ChunkSplitter { config }
    }

    /// Split text into trimmed chunks numbered from 0
    pub fn split(&self, text: &str, source_file: &str) -> Vec<TextChunk> {
        let normalized = normalize_line_endings(text);
        let chars: Vec<char> = normalized.chars().collect();
        let window = self.config.window.max(1);

        let mut chunks = Vec::new();
        let mut position = 0;

        while position < chars.len() {
            let window_end = (position + window).min(chars.len());
            let mut cut = window_end;

            // Only windows that stop short of the end look for a boundary
            if window_end < chars.len() {
                let search_start = window_end
                    .saturating_sub(self.config.lookback)
                    .max(position);
                if let Some(offset) = chars[search_start..window_end]
                    .iter()
                    .rposition(|c| BOUNDARY_CHARS.contains(c))
                {
                    let boundary = search_start + offset;
                    if boundary > position {
                        // keep the boundary character with the chunk it closes
                        cut = boundary + 1;
                    }
                }
            }

            let slice: String = chars[position..cut].iter().collect();
            let content = slice.trim();
            if !content.is_empty() {
                chunks.push(TextChunk::new(content, source_file, chunks.len()));
            }

            // Guarantees strict forward progress
            position = if cut > position { cut } else { position + 1 };
        }

        chunks
    }
}

/// Split text using the default window and lookback
pub fn split_into_chunks(text: &str, source_file: &str) -> Vec<TextChunk> {
    ChunkSplitter::default().split(text, source_file)
}

/// Collapse `\r\n` and lone `\r` into `\n`
fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
