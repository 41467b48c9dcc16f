//! Normalized documentation records and the text helpers shared by the
//! store and the providers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cheap upstream validators used to skip re-fetching unchanged pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FreshnessTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

impl FreshnessTag {
    /// A tag with no validators can never prove a page unchanged.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none() && self.content_length.is_none()
    }

    /// True when both tags carry at least one common validator and every
    /// common validator agrees.
    pub fn matches(&self, other: &FreshnessTag) -> bool {
        let mut compared = false;
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (self.content_length, other.content_length) {
            if a != b {
                return false;
            }
            compared = true;
        }
        compared
    }
}

/// Natural key of a document: owning tool plus canonical url.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub source_tool: String,
    pub url: String,
}

impl DocKey {
    pub fn new(source_tool: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_tool: source_tool.into(),
            url: url.into(),
        }
    }
}

/// One normalized page of crawled documentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub source_tool: String,
    pub url: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub section_path: Vec<String>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<FreshnessTag>,
    /// Set by the document store on upsert; anything a provider puts here
    /// is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    pub fn new(
        source_tool: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        section_path: Vec<String>,
    ) -> Self {
        let body = body.into();
        Self {
            source_tool: source_tool.into(),
            url: url.into(),
            title: title.into(),
            content_hash: content_hash(&body),
            body,
            section_path,
            fetched_at: Utc::now(),
            freshness: None,
            embedding: None,
        }
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(self.source_tool.clone(), self.url.clone())
    }

    pub fn with_freshness(mut self, freshness: Option<FreshnessTag>) -> Self {
        self.freshness = freshness.filter(|tag| !tag.is_empty());
        self
    }

    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            source_tool: self.source_tool.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            section_path: self.section_path.clone(),
            content_hash: self.content_hash.clone(),
            fetched_at: self.fetched_at,
            freshness: self.freshness.clone(),
            body_len: self.body.len(),
        }
    }
}

/// Everything about a document except its body and embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMeta {
    pub source_tool: String,
    pub url: String,
    pub title: String,
    pub section_path: Vec<String>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Option<FreshnessTag>,
    pub body_len: usize,
}

/// Hex-encoded SHA-256 of a document body.
pub fn content_hash(body: &str) -> String {
    format!("{:x}", Sha256::digest(body.as_bytes()))
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "with",
];

/// Lowercased alphanumeric tokens with stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

/// Collapses runs of whitespace inside lines and drops blank lines, keeping
/// single blank lines between paragraphs.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_pending = false;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push_str("\n\n");
            blank_pending = false;
        } else if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
    }
    out
}

/// Splits a body into paragraph-aligned chunks of at most `max_chars`
/// characters. A single paragraph longer than the limit is split on word
/// boundaries.
pub fn chunk_paragraphs(body: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.chars().count() <= max_chars {
            push_piece(paragraph, &mut current, &mut chunks, max_chars);
            continue;
        }
        for word in paragraph.split_whitespace() {
            push_piece(word, &mut current, &mut chunks, max_chars);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn push_piece(piece: &str, current: &mut String, chunks: &mut Vec<String>, max_chars: usize) {
    if !current.is_empty() && current.chars().count() + piece.chars().count() + 1 > max_chars {
        chunks.push(std::mem::take(current));
    }
    if !current.is_empty() {
        current.push(' ');
    }
    current.push_str(piece);
}
