use crate::chunking::{ChunkSplitter, SplitterConfig, TextChunk, DEFAULT_LOOKBACK, DEFAULT_WINDOW};
use crate::database::{ChunkStore, MemoryChunkStore, SqliteChunkStore, CHUNK_DB_FILE};
use crate::embeddings::{Embedder, HashingEmbedder, EMBEDDING_DIM};
use crate::error::{RagError, Result};
use crate::index::{
    EmbeddingEntry, EmbeddingIndex, FileSnapshotStore, IndexState, LoadPolicy,
    MemorySnapshotStore, SNAPSHOT_FILE,
};
use anyhow::Context;
use log::{debug, info, warn};
use std::env;
use std::path::PathBuf;

/// Number of passages returned when the caller does not ask for a count
pub const DEFAULT_TOP_K: usize = 3;

const DEFAULT_DATA_DIR: &str = "./rag-data";

/// Configuration for the retrieval service
#[derive(Debug, Clone)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub top_k: usize,
    pub load_policy: LoadPolicy,
    pub splitter: SplitterConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            top_k: DEFAULT_TOP_K,
            load_policy: LoadPolicy::Recover,
            splitter: SplitterConfig::default(),
        }
    }
}

impl RagConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("RAG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let top_k = parse_or(&lookup, "RAG_TOP_K", DEFAULT_TOP_K)?;
        let window = parse_or(&lookup, "RAG_CHUNK_WINDOW", DEFAULT_WINDOW)?;
        let lookback = parse_or(&lookup, "RAG_CHUNK_LOOKBACK", DEFAULT_LOOKBACK)?;

        let strict = match lookup("RAG_STRICT_INDEX_LOAD") {
            Some(value) => parse_flag(&value)
                .with_context(|| format!("Invalid RAG_STRICT_INDEX_LOAD: {}", value))?,
            None => false,
        };

        Ok(RagConfig {
            data_dir,
            top_k,
            load_policy: if strict {
                LoadPolicy::Strict
            } else {
                LoadPolicy::Recover
            },
            splitter: SplitterConfig { window, lookback },
        })
    }
}

fn parse_or<F>(lookup: &F, key: &str, default: usize) -> anyhow::Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", key, value)),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got {}", other)),
    }
}

/// Outcome of a successful ingestion
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub source_file: String,
    pub chunk_ids: Vec<String>,
}

impl IngestReport {
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }
}

/// A chunk returned by a query together with its similarity score
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

/// Chunk and embedding counts, equal while every ingestion has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusStats {
    pub chunks: usize,
    pub embeddings: usize,
}

/// Ingests documents and answers top-k similarity queries over them
pub struct RetrievalService {
    splitter: ChunkSplitter,
    embedder: Box<dyn Embedder>,
    chunks: Box<dyn ChunkStore>,
    index: EmbeddingIndex,
}

impl RetrievalService {
    /// Assemble a service, loading the index first if needed
    pub fn new<E, C>(
        splitter: ChunkSplitter,
        embedder: E,
        chunks: C,
        mut index: EmbeddingIndex,
    ) -> Result<Self>
    where
        E: Embedder + 'static,
        C: ChunkStore + 'static,
    {
        if embedder.dimension() != index.dimension() {
            return Err(RagError::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimension(),
            });
        }

        if index.state() != IndexState::Ready {
            index.load()?;
        }

        Ok(RetrievalService {
            splitter,
            embedder: Box::new(embedder),
            chunks: Box::new(chunks),
            index,
        })
    }

    /// Open the on-disk corpus under `config.data_dir`
    pub fn open(config: &RagConfig) -> Result<Self> {
        let chunks = SqliteChunkStore::open(config.data_dir.join(CHUNK_DB_FILE))?;
        let index = EmbeddingIndex::new(
            FileSnapshotStore::new(config.data_dir.join(SNAPSHOT_FILE)),
            EMBEDDING_DIM,
            config.load_policy,
        );

        info!("Opening corpus at {}", config.data_dir.display());
        Self::new(ChunkSplitter::new(config.splitter), HashingEmbedder, chunks, index)
    }

    /// A service that keeps everything in memory
    pub fn in_memory() -> Result<Self> {
        let index = EmbeddingIndex::new(
            MemorySnapshotStore::new(),
            EMBEDDING_DIM,
            LoadPolicy::Recover,
        );
        Self::new(
            ChunkSplitter::default(),
            HashingEmbedder,
            MemoryChunkStore::new(),
            index,
        )
    }

    /// Split, embed, store and index a document, then persist the index once.
    ///
    /// Whitespace-only text fails with `EmptyDocument` before anything is
    /// written.
    pub fn ingest(&self, document_text: &str, source_file: &str) -> Result<IngestReport> {
        if document_text.trim().is_empty() {
            return Err(RagError::EmptyDocument);
        }

        let chunks = self.splitter.split(document_text, source_file);
        info!("Split {} into {} chunks", source_file, chunks.len());

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = self.embedder.embed(&chunk.content);

            // The chunk must exist before its entry does
            self.chunks.insert(&chunk)?;
            self.index.append(vec![EmbeddingEntry {
                chunk_id: chunk.id.clone(),
                vector,
            }])?;

            debug!("Stored chunk {} ({})", chunk.chunk_index, chunk.id);
            chunk_ids.push(chunk.id);
        }

        self.index.persist()?;
        info!("Ingested {} chunks from {}", chunk_ids.len(), source_file);

        Ok(IngestReport {
            source_file: source_file.to_string(),
            chunk_ids,
        })
    }

    /// The `top_k` most relevant chunks for `query`, best first
    pub fn search_chunks(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let query_vector = self.embedder.embed(query);
        let ranked = self.index.search_scored(&query_vector, top_k)?;

        let mut results = Vec::with_capacity(ranked.len());
        for (chunk_id, score) in ranked {
            match self.chunks.get_by_id(&chunk_id) {
                Ok(chunk) => results.push(RetrievedChunk { chunk, score }),
                Err(RagError::ChunkNotFound(_)) => {
                    warn!("Indexed chunk {} is missing from the chunk store", chunk_id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }

    /// Contents of the `top_k` most relevant chunks for `query`, best first
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .search_chunks(query, top_k)?
            .into_iter()
            .map(|retrieved| retrieved.chunk.content)
            .collect())
    }

    pub fn stats(&self) -> Result<CorpusStats> {
        Ok(CorpusStats {
            chunks: self.chunks.count()?,
            embeddings: self.index.len()?,
        })
    }
}
