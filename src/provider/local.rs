//! Documentation mirrored on the local filesystem.
//!
//! `base_url` is a directory (plain path or `file://` url) and sections are
//! subdirectories of it. Markdown, plain text and HTML files are indexed.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;
use walkdir::WalkDir;

use super::html::{SiteProfile, extract_html};
use super::{Provider, RawContent};
use crate::document::{Document, FreshnessTag, collapse_whitespace};
use crate::error::{DocsError, Result};

const EXTENSIONS: &[&str] = &["md", "markdown", "txt", "html", "htm"];

pub struct LocalDirProvider {
    name: String,
    root: PathBuf,
}

impl LocalDirProvider {
    pub fn new(name: &str, base_url: &str) -> Self {
        let raw = base_url.strip_prefix("file://").unwrap_or(base_url);
        let root = PathBuf::from(raw);
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir().map(|cwd| cwd.join(&root)).unwrap_or(root)
        };
        Self {
            name: name.to_string(),
            root,
        }
    }

    fn path_of(&self, location: &str) -> Result<PathBuf> {
        Url::parse(location)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .filter(|path| path.starts_with(&self.root))
            .ok_or_else(|| {
                DocsError::InvalidArgument(format!(
                    "{}: '{location}' is not a file under {}",
                    self.name,
                    self.root.display()
                ))
            })
    }

    fn location_of(&self, path: &Path) -> Result<String> {
        Url::from_file_path(path)
            .map(|url| url.to_string())
            .map_err(|_| DocsError::Config(format!("{}: cannot address {}", self.name, path.display())))
    }

    fn io_error(&self, path: &Path, err: io::Error) -> DocsError {
        if err.kind() == io::ErrorKind::NotFound {
            DocsError::not_found(&self.name, path.display())
        } else {
            DocsError::source_unavailable(&self.name, format!("{}: {err}", path.display()))
        }
    }

    /// Directories between the root and the file, in order.
    fn section_path(&self, path: &Path) -> Vec<String> {
        path.parent()
            .and_then(|parent| parent.strip_prefix(&self.root).ok())
            .map(|relative| {
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_html(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("html" | "htm")
    )
}

fn freshness_of(metadata: &std::fs::Metadata) -> FreshnessTag {
    FreshnessTag {
        etag: None,
        last_modified: metadata
            .modified()
            .ok()
            .map(|mtime| DateTime::<Utc>::from(mtime).to_rfc3339()),
        content_length: Some(metadata.len()),
    }
}

/// Title of a text document: its first `# ` heading, else the file stem.
fn text_title(text: &str, path: &Path) -> String {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}

#[async_trait]
impl Provider for LocalDirProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_locations(&self, section: &str) -> Result<Vec<String>> {
        let start = self.root.join(section.trim_matches('/'));
        let walk_root = start.clone();
        let walked = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&walk_root).follow_links(false).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && is_document(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Ok::<_, walkdir::Error>(files)
        })
        .await
        .map_err(|e| DocsError::source_unavailable(&self.name, format!("directory walk failed: {e}")))?;
        let mut files = walked.map_err(|e| {
            DocsError::source_unavailable(&self.name, format!("{}: {e}", start.display()))
        })?;

        files.sort();
        tracing::debug!("{}: {} files under {}", self.name, files.len(), start.display());
        files.iter().map(|path| self.location_of(path)).collect()
    }

    async fn fetch(&self, location: &str) -> Result<RawContent> {
        let path = self.path_of(location)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.io_error(&path, e))?;
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| self.io_error(&path, e))?;

        let mut raw = RawContent::new(location, body);
        raw.content_type = Some(if is_html(&path) { "text/html" } else { "text/plain" }.to_string());
        raw.freshness = Some(freshness_of(&metadata));
        Ok(raw)
    }

    async fn probe(&self, location: &str) -> Result<Option<FreshnessTag>> {
        let path = self.path_of(location)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.io_error(&path, e))?;
        Ok(Some(freshness_of(&metadata)))
    }

    fn normalize(&self, raw: &RawContent) -> Result<Document> {
        let path = self.path_of(&raw.location)?;
        let (title, body) = if is_html(&path) {
            let parts = extract_html(&raw.body, &SiteProfile::default())
                .map_err(|reason| DocsError::malformed(&self.name, &raw.location, reason))?;
            (parts.title, parts.body)
        } else {
            (text_title(&raw.body, &path), collapse_whitespace(&raw.body))
        };
        if body.is_empty() {
            return Err(DocsError::malformed(&self.name, &raw.location, "file is empty"));
        }

        let mut doc = Document::new(&self.name, &raw.location, title, body, self.section_path(&path))
            .with_freshness(raw.freshness.clone());
        doc.fetched_at = raw.fetched_at;
        Ok(doc)
    }
}
