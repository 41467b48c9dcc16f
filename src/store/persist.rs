//! One JSON file per tool under the store directory.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tokio::fs;

use crate::document::{Document, content_hash};
use crate::error::{DocsError, Result};

const SUFFIX: &str = ".docs.json";

/// File name holding a tool's documents. Bytes outside `[a-z0-9-]` are
/// written as `_xx`, so distinct tool names never share a file.
fn file_name(tool: &str) -> String {
    let mut name = String::with_capacity(tool.len() + SUFFIX.len());
    for byte in tool.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("_{byte:02x}"));
        }
    }
    name.push_str(SUFFIX);
    name
}

/// Inverse of [`file_name`]; `None` for files the store did not name.
fn tool_name(file: &str) -> Option<String> {
    let stem = file.strip_suffix(SUFFIX)?;
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'_' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(first);
            rest = tail;
        }
    }
    let tool = String::from_utf8(bytes).ok()?;
    (file_name(&tool) == file).then_some(tool)
}

fn is_store_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(tool_name)
        .is_some()
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> DocsError {
    DocsError::Store(format!("cannot {action} {}: {err}", path.display()))
}

/// Writes `docs` (sorted by tool) as one file per tool and removes files
/// of tools that no longer have documents. Embeddings are not persisted;
/// they are recomputed on load.
pub(crate) async fn save_documents(dir: &Path, docs: Vec<Document>) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| store_error("create", dir, e))?;

    let groups: Vec<(String, Vec<Document>)> = docs
        .into_iter()
        .chunk_by(|doc| doc.source_tool.clone())
        .into_iter()
        .map(|(tool, group)| {
            let records = group
                .map(|mut doc| {
                    doc.embedding = None;
                    doc
                })
                .collect();
            (tool, records)
        })
        .collect();

    let mut written: HashSet<PathBuf> = HashSet::new();
    for (tool, records) in groups {
        let path = dir.join(file_name(&tool));
        let serialized = serde_json::to_string_pretty(&records)
            .map_err(|e| store_error("serialize", &path, e))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)
            .await
            .map_err(|e| store_error("write", &tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_error("replace", &path, e))?;
        tracing::debug!("saved {} documents of '{}' to {}", records.len(), tool, path.display());
        written.insert(path);
    }

    let mut entries = fs::read_dir(dir).await.map_err(|e| store_error("list", dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| store_error("list", dir, e))? {
        let path = entry.path();
        if is_store_file(&path) && !written.contains(&path) {
            match fs::remove_file(&path).await {
                Ok(()) => tracing::info!("removed stale store file {}", path.display()),
                Err(e) => tracing::warn!("failed to remove stale store file {}: {e}", path.display()),
            }
        }
    }
    Ok(())
}

/// Reads every store file in `dir`. Unreadable or corrupt files, and
/// records whose hash does not match their body, are skipped with an error
/// log. A missing directory is an empty store.
pub(crate) async fn load_documents(dir: &Path) -> Result<Vec<Document>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("store directory {} not found, starting empty", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(store_error("list", dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| store_error("list", dir, e))? {
        let path = entry.path();
        if is_store_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut docs = Vec::new();
    for path in paths {
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("failed to read store file {}: {e}; skipping", path.display());
                continue;
            }
        };
        if content.trim().is_empty() {
            tracing::warn!("store file {} is empty, skipping", path.display());
            continue;
        }
        let records: Vec<Document> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("failed to parse store file {}: {e}; skipping", path.display());
                continue;
            }
        };
        for doc in records {
            if doc.content_hash != content_hash(&doc.body) {
                tracing::error!(
                    "{}: stored hash of {} does not match its body; skipping",
                    doc.source_tool,
                    doc.url
                );
                continue;
            }
            docs.push(doc);
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, IndexedStore, StoreOptions};
    use tempfile::tempdir;

    fn persistent(dir: &Path) -> IndexedStore {
        IndexedStore::new(StoreOptions {
            persist_dir: Some(dir.to_path_buf()),
            ..StoreOptions::default()
        })
    }

    fn doc(tool: &str, url: &str, body: &str) -> Document {
        Document::new(tool, url, url.trim_start_matches('/'), body, vec!["Guide".into()])
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = persistent(dir.path());
        store.upsert(doc("docker", "/install", "install the engine")).await.unwrap();
        store.upsert(doc("docker", "/compose", "compose files")).await.unwrap();
        store.upsert(doc("python", "/tutorial", "an informal introduction")).await.unwrap();
        store.save().await.unwrap();

        assert!(dir.path().join("docker.docs.json").exists());
        assert!(dir.path().join("python.docs.json").exists());
        let raw = std::fs::read_to_string(dir.path().join("docker.docs.json")).unwrap();
        assert!(!raw.contains("embedding"));

        let reloaded = persistent(dir.path());
        assert_eq!(reloaded.load().await.unwrap(), 3);
        assert_eq!(reloaded.document_count("docker").await, 2);
        let original = store.document("docker", "/install").await.unwrap();
        let restored = reloaded.document("docker", "/install").await.unwrap();
        assert_eq!(restored, original);
        assert_eq!(reloaded.stats().await.writes, 0);
    }

    #[tokio::test]
    async fn test_save_removes_stale_tool_files() {
        let dir = tempdir().unwrap();
        let store = persistent(dir.path());
        store.upsert(doc("docker", "/install", "install")).await.unwrap();
        store.upsert(doc("python", "/tutorial", "tutorial")).await.unwrap();
        store.save().await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::write(dir.path().join("settings.json"), "{}").unwrap();

        store.delete("python", "/tutorial").await.unwrap();
        store.save().await.unwrap();
        assert!(dir.path().join("docker.docs.json").exists());
        assert!(!dir.path().join("python.docs.json").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("settings.json").exists());
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_files_and_records() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.docs.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("empty.docs.json"), "").unwrap();
        let good = doc("docker", "/install", "install the engine");
        let mut tampered = doc("docker", "/compose", "compose files");
        tampered.body.push_str(" edited");
        std::fs::write(
            dir.path().join("docker.docs.json"),
            serde_json::to_string(&vec![good.clone(), tampered]).unwrap(),
        )
        .unwrap();

        let docs = load_documents(dir.path()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].url, "/install");
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let docs = load_documents(&dir.path().join("absent")).await.unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_file_names_are_distinct_and_reversible() {
        assert_eq!(file_name("docker"), "docker.docs.json");
        assert_eq!(file_name("../etc/x"), "_2e_2e_2fetc_2fx.docs.json");
        assert_ne!(file_name("a.b"), file_name("a_b"));
        assert_ne!(file_name("Docs"), file_name("docs"));
        for tool in ["docker", "a.b", "a_b", "Docs", "ünïcode tool"] {
            assert_eq!(tool_name(&file_name(tool)).as_deref(), Some(tool));
        }
        assert_eq!(tool_name("settings.json"), None);
        assert_eq!(tool_name("a_zz.docs.json"), None);
        assert_eq!(tool_name("a_4.docs.json"), None);
        assert_eq!(tool_name("UPPER.docs.json"), None);
    }

    #[tokio::test]
    async fn test_similar_tool_names_keep_separate_files() {
        let dir = tempdir().unwrap();
        let store = persistent(dir.path());
        store.upsert(doc("a.b", "/one", "first tool")).await.unwrap();
        store.upsert(doc("a_b", "/two", "second tool")).await.unwrap();
        store.save().await.unwrap();

        let reloaded = persistent(dir.path());
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.document_count("a.b").await, 1);
        assert_eq!(reloaded.document_count("a_b").await, 1);
    }
}
