//! Retrieval and query engine: argument validation and response shaping
//! over the document store.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::config::SearchSettings;
use crate::document::Document;
use crate::error::{DocsError, Result};
use crate::provider::ProviderRegistry;
use crate::store::{DocumentStore, SearchHit, SearchQuery};

/// Ranked results of one search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub tools: Vec<String>,
    pub hits: Vec<SearchHit>,
}

impl SearchResponse {
    pub fn to_text(&self) -> String {
        let scope = self.tools.join(", ");
        if self.hits.is_empty() {
            return format!("No documentation found for \"{}\" in {scope}.", self.query);
        }
        let mut out = format!(
            "Found {} result{} for \"{}\" in {scope}:\n",
            self.hits.len(),
            if self.hits.len() == 1 { "" } else { "s" },
            self.query
        );
        for (rank, hit) in self.hits.iter().enumerate() {
            let meta = &hit.meta;
            let _ = write!(
                out,
                "\n{}. [{}] {} (score {:.3})\n   {}\n",
                rank + 1,
                meta.source_tool,
                meta.title,
                hit.score,
                meta.url
            );
            if !meta.section_path.is_empty() {
                let _ = writeln!(out, "   {}", meta.section_path.join(" > "));
            }
            if !hit.excerpt.is_empty() {
                let _ = writeln!(out, "   {}", hit.excerpt);
            }
        }
        out
    }
}

/// One registered tool as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub supported: bool,
    pub documents: usize,
    pub base_url: String,
}

impl ToolSummary {
    pub fn status(&self) -> &'static str {
        match (self.supported, self.enabled) {
            (false, _) => "not supported yet",
            (true, false) => "disabled",
            (true, true) if self.documents == 0 => "enabled, not crawled",
            (true, true) => "enabled",
        }
    }
}

pub fn format_tools(tools: &[ToolSummary]) -> String {
    let mut out = format!("Available documentation tools ({}):\n", tools.len());
    for tool in tools {
        let _ = write!(
            out,
            "\n- {}: {}\n  status: {}, documents: {}\n",
            tool.name,
            tool.description,
            tool.status(),
            tool.documents
        );
        if !tool.base_url.is_empty() {
            let _ = writeln!(out, "  source: {}", tool.base_url);
        }
    }
    out
}

pub fn format_document(doc: &Document) -> String {
    let mut out = format!("# {}\n\nSource: {} | {}\n", doc.title, doc.source_tool, doc.url);
    if !doc.section_path.is_empty() {
        let _ = writeln!(out, "Section: {}", doc.section_path.join(" > "));
    }
    let _ = write!(out, "Fetched: {}\n\n{}", doc.fetched_at.to_rfc3339(), doc.body);
    out
}

/// Stateless front of the store used by the protocol layer.
#[derive(Clone)]
pub struct QueryEngine {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn DocumentStore>,
    settings: SearchSettings,
}

impl QueryEngine {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn DocumentStore>, settings: SearchSettings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    fn unknown_tool(&self, operation: &str, tool: &str) -> DocsError {
        DocsError::InvalidArgument(format!(
            "{operation}: unknown tool '{tool}'; available: {}",
            self.registry.names().collect::<Vec<_>>().join(", ")
        ))
    }

    /// Searches `tools` (every registered tool when empty). `limit`
    /// defaults to the configured default and must lie in
    /// `[1, max_limit]`.
    pub async fn search(&self, query: &str, tools: &[String], limit: Option<i64>) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DocsError::InvalidArgument(
                "search_documentation: query must not be empty".into(),
            ));
        }
        let max = self.settings.max_limit;
        let limit = match limit {
            None => self.settings.default_limit,
            Some(n) if n >= 1 && n as u64 <= max as u64 => n as usize,
            Some(n) => {
                return Err(DocsError::InvalidArgument(format!(
                    "search_documentation: limit must be between 1 and {max}, got {n}"
                )));
            }
        };

        let mut scope = Vec::new();
        for tool in tools.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !self.registry.contains(tool) {
                return Err(self.unknown_tool("search_documentation", tool));
            }
            if !scope.iter().any(|s| s == tool) {
                scope.push(tool.to_string());
            }
        }
        if scope.is_empty() {
            scope = self.registry.names().map(str::to_string).collect();
        }

        let hits = self
            .store
            .search(&SearchQuery::new(query, scope.clone(), limit))
            .await?;
        tracing::debug!("search '{query}' over {} tools: {} hits", scope.len(), hits.len());
        Ok(SearchResponse {
            query: query.to_string(),
            tools: scope,
            hits,
        })
    }

    /// The document of `tool` that `topic` names.
    pub async fn get(&self, tool: &str, topic: &str) -> Result<Document> {
        let (tool, topic) = (tool.trim(), topic.trim());
        if tool.is_empty() || topic.is_empty() {
            return Err(DocsError::InvalidArgument(
                "get_documentation: tool and topic must not be empty".into(),
            ));
        }
        if !self.registry.contains(tool) {
            return Err(DocsError::not_found(
                tool,
                format!(
                    "no such documentation tool; available: {}",
                    self.registry.names().collect::<Vec<_>>().join(", ")
                ),
            ));
        }
        self.store.get(tool, topic).await
    }

    pub async fn list_tools(&self) -> Vec<ToolSummary> {
        let mut tools = Vec::with_capacity(self.registry.len());
        for registration in self.registry.iter() {
            tools.push(ToolSummary {
                name: registration.name.clone(),
                description: registration.description().to_string(),
                enabled: registration.settings.enabled,
                supported: registration.is_supported(),
                documents: self.store.document_count(&registration.name).await,
                base_url: registration.settings.base_url.clone(),
            });
        }
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;
    use crate::provider::{ProviderKind, UnsupportedProvider};
    use crate::store::{IndexedStore, StoreOptions};

    async fn engine() -> (QueryEngine, Arc<IndexedStore>) {
        let registry = ["docs-a", "docs-b"].iter().fold(ProviderRegistry::default(), |registry, name| {
            let mut settings = ToolSettings::for_kind(ProviderKind::Local);
            settings.base_url = "/srv/docs".into();
            registry.with_provider(settings, Arc::new(UnsupportedProvider::new(*name)))
        });
        let store = Arc::new(IndexedStore::new(StoreOptions::default()));
        for i in 0..5 {
            let doc = Document::new(
                "docs-a",
                format!("/install-{i}"),
                format!("Install step {i}"),
                format!("How to install part {i}."),
                vec!["Setup".into()],
            );
            store.upsert(doc).await.unwrap();
        }
        store
            .upsert(Document::new("docs-b", "/install", "Install B", "install b", vec![]))
            .await
            .unwrap();
        let engine = QueryEngine::new(Arc::new(registry), store.clone(), SearchSettings::default());
        (engine, store)
    }

    #[tokio::test]
    async fn test_search_limit_and_filter() {
        let (engine, _) = engine().await;
        let response = engine.search("install", &["docs-a".into()], Some(1)).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].meta.source_tool, "docs-a");
        assert!(response.to_text().starts_with("Found 1 result for \"install\" in docs-a"));

        let everywhere = engine.search("install", &[], None).await.unwrap();
        assert_eq!(everywhere.hits.len(), 6);
        assert_eq!(everywhere.tools, vec!["docs-a", "docs-b"]);
    }

    #[tokio::test]
    async fn test_search_validates_arguments() {
        let (engine, _) = engine().await;
        for bad in ["", "   "] {
            let err = engine.search(bad, &[], None).await.unwrap_err();
            assert!(matches!(err, DocsError::InvalidArgument(_)));
        }
        for limit in [0, -3, 51] {
            let err = engine.search("install", &[], Some(limit)).await.unwrap_err();
            assert!(matches!(err, DocsError::InvalidArgument(_)), "limit {limit}");
        }
        let err = engine.search("install", &["unknown-tool".into()], None).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool 'unknown-tool'"));
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (engine, _) = engine().await;
        let response = engine.search("kubernetes", &[], Some(5)).await.unwrap();
        assert!(response.hits.is_empty());
        assert!(response.to_text().starts_with("No documentation found"));
    }

    #[tokio::test]
    async fn test_get_and_unknown_tool() {
        let (engine, store) = engine().await;
        let doc = engine.get("docs-a", "install step 3").await.unwrap();
        assert_eq!(doc.url, "/install-3");
        assert!(format_document(&doc).contains("Section: Setup"));

        let err = engine.get("unknown-tool", "x").await.unwrap_err();
        assert!(matches!(err, DocsError::NotFound { .. }));

        store.delete("docs-a", "/install-3").await.unwrap();
        assert!(engine.get("docs-a", "/install-3").await.is_err());
    }

    #[tokio::test]
    async fn test_list_tools_reflects_registry() {
        let (engine, _) = engine().await;
        let tools = engine.list_tools().await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["docs-a", "docs-b"]);
        assert_eq!(tools[0].documents, 5);
        assert_eq!(tools[0].status(), "enabled");
        let text = format_tools(&tools);
        assert!(text.contains("docs-a"));
        assert!(!text.contains("unknown-tool"));
    }
}
