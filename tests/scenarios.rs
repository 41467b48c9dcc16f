use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use enterprise_mcp_docs::config::{ServerConfig, ToolSettings};
use enterprise_mcp_docs::crawl::StopSignal;
use enterprise_mcp_docs::document::Document;
use enterprise_mcp_docs::provider::{Provider, ProviderKind, ProviderRegistry, RawContent};
use enterprise_mcp_docs::service::DocsService;
use enterprise_mcp_docs::store::{DocumentStore, IndexedStore, StoreOptions, UpsertOutcome};
use enterprise_mcp_docs::{DocsError, Result};
use tempfile::tempdir;

fn local_config(root: &Path) -> ServerConfig {
    let raw = serde_json::json!({
        "tools": {
            "docs-a": {
                "provider": "local",
                "base_url": root.display().to_string(),
                "cache_ttl_secs": 0
            }
        },
        "storage": { "embeddings": true, "embedding_dims": 64 }
    });
    ServerConfig::from_json(&raw.to_string()).unwrap()
}

async fn started(config: ServerConfig) -> DocsService {
    let service = DocsService::from_config(config).unwrap();
    service.start().await.unwrap();
    service
}

#[tokio::test]
async fn test_recrawl_only_stores_changed_pages() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("intro.md"), "# Intro\n\nWelcome to docs-a.").unwrap();
    std::fs::write(dir.path().join("config.md"), "# Config\n\nSet the port.").unwrap();
    let service = started(local_config(dir.path())).await;
    let store = service.store();

    let first = service.crawl(&["docs-a".into()], false).await.unwrap();
    let docs_a = first.provider("docs-a").unwrap();
    assert_eq!((docs_a.jobs, docs_a.stored, docs_a.skipped), (2, 2, 0));
    assert_eq!(store.document_count("docs-a").await, 2);
    let writes = store.stats().await.writes;

    let second = service.crawl(&["docs-a".into()], false).await.unwrap();
    assert_eq!((second.stored(), second.skipped(), second.failed()), (0, 2, 0));
    assert_eq!(store.stats().await.writes, writes);

    std::fs::write(
        dir.path().join("config.md"),
        "# Config\n\nSet the port and the bind address.",
    )
    .unwrap();
    let third = service.crawl(&["docs-a".into()], false).await.unwrap();
    assert_eq!((third.stored(), third.skipped(), third.failed()), (1, 1, 0));
    assert_eq!(store.stats().await.writes, writes + 1);

    let config = service.engine().get("docs-a", "config").await.unwrap();
    assert!(config.body.contains("bind address"));
}

#[tokio::test]
async fn test_removed_pages_leave_the_store() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("intro.md"), "# Intro\n\nWelcome.").unwrap();
    std::fs::write(dir.path().join("legacy.md"), "# Legacy\n\nOld setup guide.").unwrap();
    std::fs::write(dir.path().join("notes.md"), "# Notes\n\nRelease notes.").unwrap();
    let service = started(local_config(dir.path())).await;
    service.crawl(&[], false).await.unwrap();
    assert!(service.engine().get("docs-a", "legacy").await.is_ok());

    std::fs::remove_file(dir.path().join("legacy.md")).unwrap();
    let report = service.crawl(&[], false).await.unwrap();
    let docs_a = report.provider("docs-a").unwrap();
    assert_eq!((docs_a.jobs, docs_a.pruned), (2, 1));
    let err = service.engine().get("docs-a", "legacy").await.unwrap_err();
    assert!(matches!(err, DocsError::NotFound { .. }));

    let url = url::Url::from_file_path(dir.path().join("notes.md")).unwrap().to_string();
    assert!(service.store().delete("docs-a", &url).await.unwrap());
    assert!(!service.store().delete("docs-a", &url).await.unwrap());
    let err = service.engine().get("docs-a", "notes").await.unwrap_err();
    assert!(matches!(err, DocsError::NotFound { .. }));
}

#[tokio::test]
async fn test_search_limit_returns_best_match() {
    let dir = tempdir().unwrap();
    for i in 0..5 {
        let body = format!("# Install option {i}\n\n{}", "install the agent. ".repeat(i + 1));
        std::fs::write(dir.path().join(format!("install-{i}.md")), body).unwrap();
    }
    std::fs::write(dir.path().join("faq.md"), "# FAQ\n\nFrequently asked questions.").unwrap();
    let service = started(local_config(dir.path())).await;
    service.crawl(&[], false).await.unwrap();

    let all = service
        .engine()
        .search("install", &["docs-a".into()], Some(5))
        .await
        .unwrap();
    assert_eq!(all.hits.len(), 5);
    assert!(all.hits.windows(2).all(|w| w[0].score >= w[1].score));

    let top = service
        .engine()
        .search("install", &["docs-a".into()], Some(1))
        .await
        .unwrap();
    assert_eq!(top.hits.len(), 1);
    assert_eq!(top.hits[0].meta.url, all.hits[0].meta.url);

    let err = service.engine().search("", &[], None).await.unwrap_err();
    assert!(matches!(err, DocsError::InvalidArgument(_)));
}

/// Lists `total` pages; every page whose number is divisible by three is
/// unreachable.
struct Partial {
    total: usize,
}

#[async_trait]
impl Provider for Partial {
    fn name(&self) -> &str {
        "docs-b"
    }

    async fn list_locations(&self, _section: &str) -> Result<Vec<String>> {
        Ok((0..self.total).map(|i| format!("/page-{i}")).collect())
    }

    async fn fetch(&self, location: &str) -> Result<RawContent> {
        let n: usize = location.trim_start_matches("/page-").parse().unwrap_or(0);
        if n % 3 == 0 {
            return Err(DocsError::source_unavailable("docs-b", "connection reset"));
        }
        Ok(RawContent::new(location, format!("page number {n}")))
    }

    fn normalize(&self, raw: &RawContent) -> Result<Document> {
        Ok(Document::new("docs-b", &raw.location, &raw.location, &raw.body, vec![]))
    }
}

#[tokio::test]
async fn test_partial_failure_is_reported_not_raised() {
    let mut settings = ToolSettings::for_kind(ProviderKind::Local);
    settings.base_url = "/unused".into();
    settings.concurrency = Some(3);
    let registry = ProviderRegistry::default().with_provider(settings, Arc::new(Partial { total: 10 }));
    let store = Arc::new(IndexedStore::new(StoreOptions::default()));
    let mut config = ServerConfig::default();
    config.tools.clear();
    let service = DocsService::with_parts(config, Arc::new(registry), store.clone());
    service.start().await.unwrap();

    let report = service.crawl(&[], false).await.unwrap();
    let docs_b = report.provider("docs-b").unwrap();
    assert_eq!(docs_b.jobs, 10);
    assert_eq!(docs_b.failed, 4);
    assert_eq!(docs_b.stored, 6);
    assert_eq!(docs_b.stored + docs_b.skipped + docs_b.failed, docs_b.jobs);
    assert_eq!(store.document_count("docs-b").await, 6);
    assert!(report.to_string().contains("connection reset"));
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let store = IndexedStore::new(StoreOptions::default());
    let doc = Document::new("docs-a", "/intro", "Intro", "hello", vec![]);
    assert_eq!(store.upsert(doc.clone()).await.unwrap(), UpsertOutcome::Inserted);
    let first = store.metadata("docs-a", "/intro").await.unwrap();

    let mut again = doc.clone();
    again.fetched_at = first.fetched_at + chrono::Duration::seconds(60);
    assert_eq!(store.upsert(again).await.unwrap(), UpsertOutcome::Unchanged);
    assert_eq!(store.metadata("docs-a", "/intro").await.unwrap().fetched_at, first.fetched_at);

    let mut changed = Document::new("docs-a", "/intro", "Intro", "hello again", vec![]);
    changed.fetched_at = first.fetched_at + chrono::Duration::seconds(120);
    assert_eq!(store.upsert(changed.clone()).await.unwrap(), UpsertOutcome::Updated);
    let updated = store.metadata("docs-a", "/intro").await.unwrap();
    assert_eq!(updated.content_hash, changed.content_hash);
    assert_eq!(updated.fetched_at, changed.fetched_at);
}

#[tokio::test]
async fn test_stopped_signal_starts_nothing() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("intro.md"), "# Intro\n\nWelcome.").unwrap();
    let config = local_config(dir.path());
    let registry = Arc::new(ProviderRegistry::from_config(&config).unwrap());
    let store: Arc<dyn DocumentStore> = Arc::new(IndexedStore::new(StoreOptions::from_config(&config)));
    let scheduler = enterprise_mcp_docs::crawl::CrawlScheduler::new(registry, store.clone(), &config);

    let stop = StopSignal::new();
    stop.stop();
    let report = scheduler.crawl(&[], false, &stop).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.stored(), 0);
    assert_eq!(store.document_count("docs-a").await, 0);
}
