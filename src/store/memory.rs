use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::embedding::{Embedder, HashingEmbedder, cosine_similarity};
use super::index::{DocId, InvertedIndex, TermStats, TopicIndex};
use super::rank::{TopicKeys, excerpt, match_topic, normalize_topic};
use super::{DocumentStore, SearchHit, SearchQuery, StoreStats, UpsertOutcome, persist};
use crate::config::ServerConfig;
use crate::document::{DocKey, Document, DocumentMeta, FreshnessTag, content_hash, tokenize};
use crate::error::{DocsError, Result};

#[derive(Clone)]
pub struct StoreOptions {
    /// Vector half of the ranking; lexical only when `None`.
    pub embedder: Option<Arc<dyn Embedder>>,
    pub lexical_weight: f32,
    pub topic_threshold: f32,
    pub persist_dir: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            embedder: Some(Arc::new(HashingEmbedder::new(256))),
            lexical_weight: 0.7,
            topic_threshold: 0.5,
            persist_dir: None,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        let embedder: Option<Arc<dyn Embedder>> = config
            .storage
            .embeddings
            .then(|| Arc::new(HashingEmbedder::new(config.storage.embedding_dims)) as Arc<dyn Embedder>);
        Self {
            embedder,
            lexical_weight: config.search.lexical_weight,
            topic_threshold: config.search.topic_threshold,
            persist_dir: config.storage.dir.clone(),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("embedding_dims", &self.embedder.as_ref().map(|e| e.dims()))
            .field("lexical_weight", &self.lexical_weight)
            .field("topic_threshold", &self.topic_threshold)
            .field("persist_dir", &self.persist_dir)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    doc: Document,
    terms: TermStats,
    topic: TopicKeys,
}

#[derive(Debug, Default)]
struct IndexState {
    next_id: DocId,
    docs: HashMap<DocId, Arc<StoredDoc>>,
    by_tool: HashMap<String, BTreeMap<String, DocId>>,
    index: InvertedIndex,
    topics: HashMap<String, TopicIndex>,
    writes: u64,
    last_write: Option<DateTime<Utc>>,
}

impl IndexState {
    fn lookup(&self, tool: &str, url: &str) -> Option<&Arc<StoredDoc>> {
        let id = self.by_tool.get(tool)?.get(url)?;
        self.docs.get(id)
    }

    fn put(&mut self, stored: StoredDoc) -> UpsertOutcome {
        let urls = self.by_tool.entry(stored.doc.source_tool.clone()).or_default();
        let (id, outcome) = match urls.get(&stored.doc.url) {
            Some(id) => (*id, UpsertOutcome::Updated),
            None => {
                let id = self.next_id;
                self.next_id += 1;
                urls.insert(stored.doc.url.clone(), id);
                (id, UpsertOutcome::Inserted)
            }
        };
        let topics = self.topics.entry(stored.doc.source_tool.clone()).or_default();
        if let Some(previous) = self.docs.get(&id) {
            self.index.remove(id, &previous.terms);
            topics.remove(id, &previous.topic);
        }
        self.index.insert(id, &stored.terms);
        topics.insert(id, &stored.topic);
        self.docs.insert(id, Arc::new(stored));
        self.record_write();
        outcome
    }

    fn remove(&mut self, tool: &str, url: &str) -> bool {
        let Some(urls) = self.by_tool.get_mut(tool) else {
            return false;
        };
        let Some(id) = urls.remove(url) else {
            return false;
        };
        if urls.is_empty() {
            self.by_tool.remove(tool);
        }
        if let Some(stored) = self.docs.remove(&id) {
            self.index.remove(id, &stored.terms);
            if let Some(topics) = self.topics.get_mut(tool) {
                topics.remove(id, &stored.topic);
                if topics.is_empty() {
                    self.topics.remove(tool);
                }
            }
        }
        self.record_write();
        true
    }

    /// Replaces the freshness validators of a stored document. Not a
    /// content write.
    fn set_freshness(&mut self, tool: &str, url: &str, freshness: Option<FreshnessTag>) -> bool {
        let Some(id) = self.by_tool.get(tool).and_then(|urls| urls.get(url)).copied() else {
            return false;
        };
        let Some(stored) = self.docs.get_mut(&id) else {
            return false;
        };
        if stored.doc.freshness == freshness {
            return false;
        }
        Arc::make_mut(stored).doc.freshness = freshness;
        true
    }

    fn record_write(&mut self) {
        self.writes += 1;
        self.last_write = Some(Utc::now());
    }
}

/// Exclusive access to one document key. The lock entry is dropped with
/// its last holder.
struct KeyGuard<'a> {
    locks: &'a DashMap<DocKey, Arc<Mutex<()>>>,
    key: DocKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// In-memory document store with an inverted index, optional embeddings
/// and JSON persistence.
///
/// Reads take a shared lock only long enough to snapshot candidates;
/// tokenizing, embedding and scoring run outside it. Writers for the same
/// key queue on a per-key mutex so concurrent upserts of one document
/// never interleave.
pub struct IndexedStore {
    state: RwLock<IndexState>,
    key_locks: DashMap<DocKey, Arc<Mutex<()>>>,
    options: StoreOptions,
}

impl IndexedStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            key_locks: DashMap::new(),
            options,
        }
    }

    async fn lock_key(&self, key: DocKey) -> KeyGuard<'_> {
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: &self.key_locks,
            key,
            guard: Some(guard),
        }
    }

    /// Index structures and embedding for a document, computed without
    /// touching shared state.
    fn prepare(&self, mut doc: Document) -> StoredDoc {
        doc.content_hash = content_hash(&doc.body);
        doc.embedding = self
            .options
            .embedder
            .as_ref()
            .map(|embedder| embedder.embed(&format!("{}\n{}", doc.title, doc.body)));
        let terms = TermStats::of(&doc.title, &doc.body);
        let topic = TopicKeys::of(&doc);
        StoredDoc { doc, terms, topic }
    }
}

fn query_terms(text: &str) -> Vec<String> {
    let mut terms = tokenize(text);
    let mut seen = std::collections::HashSet::new();
    terms.retain(|term| seen.insert(term.clone()));
    terms
}

#[async_trait]
impl DocumentStore for IndexedStore {
    async fn upsert(&self, doc: Document) -> Result<UpsertOutcome> {
        let key = doc.key();
        let _key = self.lock_key(key.clone()).await;

        let hash = content_hash(&doc.body);
        let unchanged = {
            let state = self.state.read().await;
            state
                .lookup(&key.source_tool, &key.url)
                .is_some_and(|stored| stored.doc.content_hash == hash)
        };
        if unchanged {
            tracing::debug!("{}: {} unchanged", key.source_tool, key.url);
            return Ok(UpsertOutcome::Unchanged);
        }

        let stored = self.prepare(doc);
        let outcome = self.state.write().await.put(stored);
        tracing::debug!("{}: {} {:?}", key.source_tool, key.url, outcome);
        Ok(outcome)
    }

    async fn delete(&self, tool: &str, url: &str) -> Result<bool> {
        let _key = self.lock_key(DocKey::new(tool, url)).await;
        let removed = self.state.write().await.remove(tool, url);
        if removed {
            tracing::debug!("{tool}: deleted {url}");
        }
        Ok(removed)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let terms = query_terms(&query.text);
        if terms.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.options.embedder.as_ref().map(|e| e.embed(&query.text));

        let (candidates, corpus) = {
            let state = self.state.read().await;
            let (ids, corpus) = state.index.candidates(&terms);
            let candidates: Vec<Arc<StoredDoc>> = ids
                .iter()
                .filter_map(|id| state.docs.get(id))
                .filter(|stored| {
                    query.tools.is_empty() || query.tools.contains(&stored.doc.source_tool)
                })
                .cloned()
                .collect();
            (candidates, corpus)
        };

        let lexical: Vec<f32> = candidates
            .iter()
            .map(|stored| corpus.bm25(&terms, &stored.terms))
            .collect();
        let best = lexical.iter().copied().fold(0.0_f32, f32::max);
        let weight = self.options.lexical_weight;

        let mut scored: Vec<(Arc<StoredDoc>, f32, f32, f32)> = candidates
            .into_iter()
            .zip(lexical)
            .map(|(stored, raw)| {
                let lex = if best > 0.0 { raw / best } else { 0.0 };
                let (score, vec) = match (&query_vector, &stored.doc.embedding) {
                    (Some(q), Some(d)) => {
                        let vec = cosine_similarity(q, d).max(0.0);
                        (weight * lex + (1.0 - weight) * vec, vec)
                    }
                    _ => (lex, 0.0),
                };
                (stored, score, lex, vec)
            })
            .collect();

        scored.sort_by(|(a, sa, _, _), (b, sb, _, _)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.doc.fetched_at.cmp(&a.doc.fetched_at))
                .then_with(|| a.doc.url.cmp(&b.doc.url))
        });
        scored.truncate(query.limit);

        Ok(scored
            .into_iter()
            .map(|(stored, score, lexical_score, vector_score)| SearchHit {
                meta: stored.doc.meta(),
                score,
                lexical_score,
                vector_score,
                excerpt: excerpt(&stored.doc.body, &terms),
            })
            .collect())
    }

    async fn refresh_freshness(
        &self,
        tool: &str,
        url: &str,
        freshness: Option<FreshnessTag>,
    ) -> Result<bool> {
        let _key = self.lock_key(DocKey::new(tool, url)).await;
        let refreshed = self.state.write().await.set_freshness(tool, url, freshness);
        if refreshed {
            tracing::debug!("{tool}: refreshed validators of {url}");
        }
        Ok(refreshed)
    }

    async fn get(&self, tool: &str, topic: &str) -> Result<Document> {
        let wanted = normalize_topic(topic);
        let tokens = query_terms(topic);
        let candidates: Vec<Arc<StoredDoc>> = {
            let state = self.state.read().await;
            state
                .topics
                .get(tool)
                .map(|topics| {
                    topics
                        .candidates(&wanted, &tokens)
                        .iter()
                        .filter_map(|id| state.docs.get(id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        let candidates = candidates.iter().map(|stored| (&stored.doc, &stored.topic));
        match_topic(candidates, topic, self.options.topic_threshold)
            .cloned()
            .ok_or_else(|| DocsError::not_found(tool, format!("no documentation matches '{topic}'")))
    }

    async fn document(&self, tool: &str, url: &str) -> Option<Document> {
        let state = self.state.read().await;
        state.lookup(tool, url).map(|stored| stored.doc.clone())
    }

    async fn metadata(&self, tool: &str, url: &str) -> Option<DocumentMeta> {
        let state = self.state.read().await;
        state.lookup(tool, url).map(|stored| stored.doc.meta())
    }

    async fn list_metadata(&self, tool: &str) -> Vec<DocumentMeta> {
        let state = self.state.read().await;
        state
            .by_tool
            .get(tool)
            .map(|urls| {
                urls.values()
                    .filter_map(|id| state.docs.get(id))
                    .map(|stored| stored.doc.meta())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn document_count(&self, tool: &str) -> usize {
        let state = self.state.read().await;
        state.by_tool.get(tool).map_or(0, BTreeMap::len)
    }

    async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            documents: state.docs.len(),
            per_tool: state
                .by_tool
                .iter()
                .map(|(tool, urls)| (tool.clone(), urls.len()))
                .collect(),
            terms: state.index.term_count(),
            writes: state.writes,
            last_write: state.last_write,
            embeddings: self.options.embedder.is_some(),
            persist_dir: self.options.persist_dir.clone(),
        }
    }

    async fn save(&self) -> Result<()> {
        let Some(dir) = &self.options.persist_dir else {
            return Ok(());
        };
        let mut docs: Vec<Document> = {
            let state = self.state.read().await;
            state.docs.values().map(|stored| stored.doc.clone()).collect()
        };
        docs.sort_by(|a, b| a.key().cmp(&b.key()));
        persist::save_documents(dir, docs).await
    }

    async fn load(&self) -> Result<usize> {
        let Some(dir) = &self.options.persist_dir else {
            return Ok(0);
        };
        let docs = persist::load_documents(dir).await?;
        let prepared: Vec<StoredDoc> = docs.into_iter().map(|doc| self.prepare(doc)).collect();

        let mut fresh = IndexState::default();
        for stored in prepared {
            fresh.put(stored);
        }
        let count = fresh.docs.len();

        let mut state = self.state.write().await;
        fresh.writes = state.writes;
        fresh.last_write = state.last_write;
        *state = fresh;
        tracing::info!("document store loaded {count} documents from {}", dir.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::time::Duration;

    fn store() -> IndexedStore {
        IndexedStore::new(StoreOptions::default())
    }

    fn doc(tool: &str, url: &str, title: &str, body: &str) -> Document {
        Document::new(tool, url, title, body, vec![])
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = store();
        let first = doc("docs-a", "/intro", "Intro", "Welcome to the docs");
        assert_eq!(store.upsert(first.clone()).await.unwrap(), UpsertOutcome::Inserted);
        let before = store.metadata("docs-a", "/intro").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = doc("docs-a", "/intro", "Intro", "Welcome to the docs");
        assert_eq!(store.upsert(again).await.unwrap(), UpsertOutcome::Unchanged);
        let after = store.metadata("docs-a", "/intro").await.unwrap();
        assert_eq!(before.fetched_at, after.fetched_at);
        assert_eq!(store.stats().await.writes, 1);
        assert_eq!(store.stats().await.documents, 1);

        let changed = doc("docs-a", "/intro", "Intro", "Welcome to the new docs");
        assert_eq!(store.upsert(changed.clone()).await.unwrap(), UpsertOutcome::Updated);
        let updated = store.metadata("docs-a", "/intro").await.unwrap();
        assert_ne!(updated.content_hash, before.content_hash);
        assert!(updated.fetched_at > before.fetched_at);
        assert_eq!(store.stats().await.documents, 1);
    }

    #[tokio::test]
    async fn test_round_trip_hash_matches_body() {
        let store = store();
        let mut stale = doc("docs-a", "/config", "Configuration", "Set the install path");
        stale.content_hash = "bogus".into();
        store.upsert(stale).await.unwrap();
        let stored = store.get("docs-a", "configuration").await.unwrap();
        assert_eq!(stored.content_hash, content_hash(&stored.body));
        assert!(stored.embedding.is_some());
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let store = store();
        store.upsert(doc("docs-a", "/intro", "Intro", "hello")).await.unwrap();
        assert!(store.delete("docs-a", "/intro").await.unwrap());
        assert!(!store.delete("docs-a", "/intro").await.unwrap());
        assert!(!store.delete("nobody", "/nothing").await.unwrap());
        assert!(store.key_locks.is_empty());

        let err = store.get("docs-a", "intro").await.unwrap_err();
        assert!(matches!(err, DocsError::NotFound { .. }));
        assert!(store.search(&SearchQuery::new("hello", vec![], 5)).await.unwrap().is_empty());
        assert_eq!(store.document_count("docs-a").await, 0);
    }

    #[tokio::test]
    async fn test_search_ranks_and_limits() {
        let store = store();
        for i in 0..5 {
            let body = format!("{} guide number {i}", "install ".repeat(i + 1));
            store.upsert(doc("docs-a", &format!("/p{i}"), &format!("Page {i}"), &body)).await.unwrap();
        }
        store.upsert(doc("docs-b", "/other", "Install elsewhere", "install install")).await.unwrap();

        let hits = store
            .search(&SearchQuery::new("install", vec!["docs-a".into()], 1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.url, "/p4");
        assert!(hits[0].excerpt.contains("**install**"));

        let all = store
            .search(&SearchQuery::new("install", vec!["docs-a".into()], 10))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(all.iter().all(|hit| hit.meta.source_tool == "docs-a"));

        let none = store.search(&SearchQuery::new("kubernetes", vec![], 10)).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_ties_prefer_recent_documents() {
        let store = IndexedStore::new(StoreOptions {
            embedder: None,
            ..StoreOptions::default()
        });
        let mut older = doc("docs-a", "/b-old", "Same", "identical body text");
        older.fetched_at = Utc::now() - chrono::Duration::hours(1);
        let newer = doc("docs-a", "/a-new", "Same", "identical body text");
        store.upsert(older).await.unwrap();
        store.upsert(newer).await.unwrap();

        let hits = store.search(&SearchQuery::new("identical", vec![], 10)).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, hits[1].score);
        assert_eq!(hits[0].meta.url, "/a-new");
        assert_eq!(hits[0].vector_score, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_upserts() {
        let store = Arc::new(store());
        let distinct = (0..50).map(|i| {
            let store = store.clone();
            async move {
                store
                    .upsert(doc("docs-a", &format!("/p{i}"), "Page", &format!("body {i}")))
                    .await
            }
        });
        assert!(join_all(distinct).await.iter().all(|r| r.is_ok()));
        assert_eq!(store.document_count("docs-a").await, 50);

        let same = (0..20).map(|i| {
            let store = store.clone();
            async move {
                store
                    .upsert(doc("docs-b", "/shared", "Shared", &format!("version {}", i % 2)))
                    .await
            }
        });
        join_all(same).await;
        assert!(store.key_locks.is_empty());
        assert_eq!(store.document_count("docs-b").await, 1);
        let meta = store.list_metadata("docs-b").await;
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].url, "/shared");
    }

    #[tokio::test]
    async fn test_metadata_listing_is_ordered() {
        let store = store();
        store.upsert(doc("docs-a", "/z", "Z", "zeta")).await.unwrap();
        store.upsert(doc("docs-a", "/a", "A", "alpha")).await.unwrap();
        let urls: Vec<String> = store.list_metadata("docs-a").await.into_iter().map(|m| m.url).collect();
        assert_eq!(urls, vec!["/a", "/z"]);
        assert_eq!(store.metadata("docs-a", "/a").await.unwrap().body_len, 5);
        assert!(store.list_metadata("nobody").await.is_empty());
        let stats = store.stats().await;
        assert_eq!(stats.per_tool.get("docs-a"), Some(&2));
        assert!(stats.embeddings);
    }

    #[tokio::test]
    async fn test_topic_lookup_follows_updates() {
        let store = store();
        store.upsert(doc("docs-a", "/page", "Legacy Setup", "how it used to work")).await.unwrap();
        store.upsert(doc("docs-a", "/other", "Networking", "ports")).await.unwrap();
        assert_eq!(store.get("docs-a", "legacy setup").await.unwrap().url, "/page");

        store.upsert(doc("docs-a", "/page", "Cluster Setup", "how it works now")).await.unwrap();
        assert_eq!(store.get("docs-a", "cluster setup").await.unwrap().url, "/page");
        let err = store.get("docs-a", "legacy setup").await.unwrap_err();
        assert!(matches!(err, DocsError::NotFound { .. }));
        assert!(store.get("docs-b", "networking").await.is_err());

        store.delete("docs-a", "/other").await.unwrap();
        assert!(store.get("docs-a", "networking").await.is_err());
        store.delete("docs-a", "/page").await.unwrap();
        assert!(store.state.read().await.topics.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_freshness_is_not_a_write() {
        let store = store();
        let tag = |etag: &str| FreshnessTag {
            etag: Some(etag.to_string()),
            ..FreshnessTag::default()
        };
        let page = doc("docs-a", "/intro", "Intro", "hello").with_freshness(Some(tag("\"v1\"")));
        store.upsert(page).await.unwrap();
        let writes = store.stats().await.writes;

        assert!(store.refresh_freshness("docs-a", "/intro", Some(tag("\"v2\""))).await.unwrap());
        assert!(!store.refresh_freshness("docs-a", "/intro", Some(tag("\"v2\""))).await.unwrap());
        assert!(!store.refresh_freshness("docs-a", "/missing", Some(tag("\"v2\""))).await.unwrap());
        let meta = store.metadata("docs-a", "/intro").await.unwrap();
        assert_eq!(meta.freshness, Some(tag("\"v2\"")));
        assert_eq!(store.stats().await.writes, writes);
        assert!(store.key_locks.is_empty());
    }
}
