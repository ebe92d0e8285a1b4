pub mod chunking;
pub mod context;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod index;
pub mod rag;

pub use error::{RagError, Result};
pub use rag::{RagConfig, RetrievalService};
