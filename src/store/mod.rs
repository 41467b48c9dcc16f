//! Document store and search index.
//!
//! The store is the only shared mutable state in the crate. Providers hand
//! it normalized documents, the crawl scheduler asks it for freshness
//! metadata, and the query engine reads from it.

pub mod embedding;
mod index;
mod memory;
mod persist;
pub mod rank;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document::{Document, DocumentMeta, FreshnessTag};
use crate::error::Result;

pub use embedding::{Embedder, HashingEmbedder};
pub use memory::{IndexedStore, StoreOptions};

/// What an upsert did to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same content hash as the stored copy; nothing was written.
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// One search request against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    /// Tools to search; empty means every tool.
    pub tools: Vec<String>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, tools: Vec<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            tools,
            limit,
        }
    }
}

/// A ranked view over one matching document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub meta: DocumentMeta,
    pub score: f32,
    pub lexical_score: f32,
    pub vector_score: f32,
    pub excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub per_tool: BTreeMap<String, usize>,
    pub terms: usize,
    /// Inserts, updates and deletes that changed stored state.
    pub writes: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub embeddings: bool,
    pub persist_dir: Option<PathBuf>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts or replaces the document under its natural key. Upserts of
    /// the same key are serialized; an unchanged content hash is a no-op.
    async fn upsert(&self, doc: Document) -> Result<UpsertOutcome>;

    /// Removes a document. Returns whether anything was removed.
    async fn delete(&self, tool: &str, url: &str) -> Result<bool>;

    /// Stores new freshness validators for a document whose content did
    /// not change. Returns whether the stored validators were replaced;
    /// never counts as a write.
    async fn refresh_freshness(
        &self,
        tool: &str,
        url: &str,
        freshness: Option<FreshnessTag>,
    ) -> Result<bool>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;

    /// The document of `tool` that `topic` names, or `NotFound`.
    async fn get(&self, tool: &str, topic: &str) -> Result<Document>;

    async fn document(&self, tool: &str, url: &str) -> Option<Document>;

    /// Freshness metadata without the body.
    async fn metadata(&self, tool: &str, url: &str) -> Option<DocumentMeta>;

    /// Metadata of every document of `tool`, ordered by url.
    async fn list_metadata(&self, tool: &str) -> Vec<DocumentMeta>;

    async fn document_count(&self, tool: &str) -> usize;

    async fn stats(&self) -> StoreStats;

    /// Persists the store to its configured directory, if any.
    async fn save(&self) -> Result<()>;

    /// Replaces the store contents with what is persisted. Returns the
    /// number of documents loaded.
    async fn load(&self) -> Result<usize>;
}
