//! Server configuration loaded once at startup.
//!
//! The configuration is a JSON document; every field has a default so an
//! empty object (or no file at all) yields a working setup that registers
//! the built-in tools.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DocsError, Result};
use crate::provider::ProviderKind;

/// Upper bound for `cache_ttl_secs`: ten years.
pub const MAX_CACHE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tools: BTreeMap<String, ToolSettings>,
    pub crawl: CrawlSettings,
    pub storage: StorageSettings,
    pub search: SearchSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let tools = ProviderKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), ToolSettings::for_kind(*kind)))
            .collect();
        Self {
            tools,
            crawl: CrawlSettings::default(),
            storage: StorageSettings::default(),
            search: SearchSettings::default(),
        }
    }
}

/// Per-tool provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    /// Provider kind, e.g. `docker` or `confluence`.
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Overrides `crawl.concurrency` for this tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl ToolSettings {
    /// Defaults for a built-in provider kind. Tools that need a customer
    /// instance start disabled.
    pub fn for_kind(kind: ProviderKind) -> Self {
        Self {
            provider: kind.as_str().to_string(),
            base_url: kind.default_base_url().to_string(),
            sections: kind
                .default_sections()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cache_ttl_secs: default_cache_ttl(),
            enabled: !kind.requires_instance(),
            max_pages: default_max_pages(),
            concurrency: None,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// Concurrent fetches per provider.
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Periodic recrawl of all enabled tools while serving.
    pub refresh_interval_secs: Option<u64>,
    pub user_agent: String,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
            refresh_interval_secs: None,
            user_agent: concat!("enterprise-mcp-docs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CrawlSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for persisted documents; persistence is off when unset.
    pub dir: Option<PathBuf>,
    pub embeddings: bool,
    pub embedding_dims: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dir: None,
            embeddings: true,
            embedding_dims: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Weight of the lexical score in the blended ranking; the rest goes to
    /// vector similarity.
    pub lexical_weight: f32,
    /// Minimum similarity for `get` to accept a best-effort topic match.
    pub topic_threshold: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            lexical_weight: 0.7,
            topic_threshold: 0.5,
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> usize {
    200
}

impl ServerConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DocsError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(raw)
            .map_err(|e| DocsError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, the built-in defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, tool) in &self.tools {
            if name.trim().is_empty() {
                return Err(DocsError::Config("tool names must not be empty".into()));
            }
            ProviderKind::parse(&tool.provider).ok_or_else(|| {
                DocsError::Config(format!("{name}: unknown provider kind '{}'", tool.provider))
            })?;
            if tool.enabled && tool.base_url.trim().is_empty() {
                return Err(DocsError::Config(format!("{name}: enabled tool needs a base_url")));
            }
            if tool.cache_ttl_secs > MAX_CACHE_TTL_SECS {
                return Err(DocsError::Config(format!(
                    "{name}: cache_ttl_secs must be at most {MAX_CACHE_TTL_SECS}"
                )));
            }
            if tool.concurrency == Some(0) {
                return Err(DocsError::Config(format!("{name}: concurrency must be at least 1")));
            }
        }
        if self.crawl.concurrency == 0 {
            return Err(DocsError::Config("crawl.concurrency must be at least 1".into()));
        }
        if self.search.max_limit == 0 {
            return Err(DocsError::Config("search.max_limit must be at least 1".into()));
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(DocsError::Config(
                "search.default_limit must be between 1 and search.max_limit".into(),
            ));
        }
        for (field, value) in [
            ("search.lexical_weight", self.search.lexical_weight),
            ("search.topic_threshold", self.search.topic_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DocsError::Config(format!("{field} must be within [0, 1]")));
            }
        }
        if self.storage.embeddings && self.storage.embedding_dims == 0 {
            return Err(DocsError::Config("storage.embedding_dims must be at least 1".into()));
        }
        Ok(())
    }

}
