//! Documentation providers.
//!
//! A [`Provider`] knows how to list, fetch and normalize the pages of one
//! external documentation source. Concrete variants are selected by
//! [`ProviderKind`] and assembled into a [`ProviderRegistry`] at startup.

pub mod confluence;
pub mod html;
mod http;
pub mod local;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use crate::config::{ServerConfig, ToolSettings};
use crate::document::{Document, FreshnessTag};
use crate::error::{DocsError, Result};
use crate::retry::RetryPolicy;

pub use confluence::ConfluenceProvider;
pub use html::{HtmlSiteProvider, SiteProfile};
pub use local::LocalDirProvider;

/// Raw page content as fetched, before normalization.
#[derive(Debug, Clone)]
pub struct RawContent {
    pub location: String,
    pub body: String,
    pub content_type: Option<String>,
    pub freshness: Option<FreshnessTag>,
    pub fetched_at: DateTime<Utc>,
}

impl RawContent {
    pub fn new(location: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            body: body.into(),
            content_type: None,
            freshness: None,
            fetched_at: Utc::now(),
        }
    }
}

/// Capabilities of one documentation source.
///
/// Network I/O happens only in [`list_locations`](Provider::list_locations),
/// [`fetch`](Provider::fetch) and [`probe`](Provider::probe);
/// [`normalize`](Provider::normalize) is pure.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Tool name this provider is registered under.
    fn name(&self) -> &str;

    /// Content locations of one section, in navigation order.
    async fn list_locations(&self, section: &str) -> Result<Vec<String>>;

    /// Raw content of one location. `NotFound` means the page is gone.
    async fn fetch(&self, location: &str) -> Result<RawContent>;

    /// Cheap freshness validators for a location, when the source has any.
    async fn probe(&self, _location: &str) -> Result<Option<FreshnessTag>> {
        Ok(None)
    }

    fn normalize(&self, raw: &RawContent) -> Result<Document>;
}

/// Built-in provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Elasticsearch,
    Docker,
    Python,
    Proxmox,
    Nessus,
    Topdesk,
    Confluence,
    N8n,
    Ollama,
    Local,
}

impl ProviderKind {
    /// Kinds registered by the default configuration.
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::Elasticsearch,
        ProviderKind::Docker,
        ProviderKind::Python,
        ProviderKind::Proxmox,
        ProviderKind::Nessus,
        ProviderKind::Topdesk,
        ProviderKind::Confluence,
        ProviderKind::N8n,
        ProviderKind::Ollama,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" => Self::Elasticsearch,
            "docker" => Self::Docker,
            "python" => Self::Python,
            "proxmox" => Self::Proxmox,
            "nessus" => Self::Nessus,
            "topdesk" => Self::Topdesk,
            "confluence" => Self::Confluence,
            "n8n" => Self::N8n,
            "ollama" => Self::Ollama,
            "local" => Self::Local,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elasticsearch => "elasticsearch",
            Self::Docker => "docker",
            Self::Python => "python",
            Self::Proxmox => "proxmox",
            Self::Nessus => "nessus",
            Self::Topdesk => "topdesk",
            Self::Confluence => "confluence",
            Self::N8n => "n8n",
            Self::Ollama => "ollama",
            Self::Local => "local",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Elasticsearch => "Search & Analytics - Elasticsearch documentation",
            Self::Docker => "Containerization - Docker and Docker Compose",
            Self::Python => "Programming - Python 3.x documentation",
            Self::Proxmox => "Virtualization - Proxmox VE management",
            Self::Nessus => "Security - Nessus vulnerability scanning",
            Self::Topdesk => "Service Management - TOPdesk workflows",
            Self::Confluence => "Collaboration - Confluence spaces",
            Self::N8n => "Automation - n8n workflow automation",
            Self::Ollama => "AI/ML - Ollama model management",
            Self::Local => "Local documentation mirror",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Elasticsearch => "https://www.elastic.co/guide/en/elasticsearch/reference/current/",
            Self::Docker => "https://docs.docker.com/",
            Self::Python => "https://docs.python.org/3/",
            Self::Proxmox => "https://pve.proxmox.com/pve-docs/",
            Self::N8n => "https://docs.n8n.io/",
            Self::Ollama => "https://docs.ollama.com/",
            Self::Nessus | Self::Topdesk | Self::Confluence | Self::Local => "",
        }
    }

    pub fn default_sections(&self) -> &'static [&'static str] {
        match self {
            Self::Elasticsearch => &["index.html"],
            Self::Docker => &["engine/", "compose/"],
            Self::Python => &["library/", "tutorial/"],
            Self::Proxmox => &["index.html"],
            Self::N8n => &["workflows/", "hosting/"],
            Self::Ollama => &[""],
            Self::Nessus | Self::Topdesk | Self::Confluence | Self::Local => &[],
        }
    }

    /// Sources that only exist on a customer's own instance.
    pub fn requires_instance(&self) -> bool {
        matches!(self, Self::Nessus | Self::Topdesk | Self::Confluence)
    }
}

/// Provider for a tool whose source is known but not crawlable yet.
/// Every capability answers `NotImplementedCapability`.
pub struct UnsupportedProvider {
    name: String,
}

impl UnsupportedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for UnsupportedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_locations(&self, _section: &str) -> Result<Vec<String>> {
        Err(DocsError::not_implemented(&self.name, "list_locations"))
    }

    async fn fetch(&self, _location: &str) -> Result<RawContent> {
        Err(DocsError::not_implemented(&self.name, "fetch"))
    }

    fn normalize(&self, _raw: &RawContent) -> Result<Document> {
        Err(DocsError::not_implemented(&self.name, "normalize"))
    }
}

/// A configured tool: its settings plus the provider serving it.
#[derive(Clone)]
pub struct ProviderRegistration {
    pub name: String,
    pub kind: Option<ProviderKind>,
    pub settings: ToolSettings,
    pub provider: Arc<dyn Provider>,
}

impl ProviderRegistration {
    pub fn is_supported(&self) -> bool {
        !matches!(self.kind, Some(ProviderKind::Nessus | ProviderKind::Topdesk))
    }

    pub fn description(&self) -> &str {
        self.kind.map(|k| k.description()).unwrap_or("Custom documentation source")
    }
}

impl std::fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.settings.enabled)
            .finish()
    }
}

/// Immutable set of registered tools, built once from configuration and
/// passed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    registrations: BTreeMap<String, ProviderRegistration>,
}

impl ProviderRegistry {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.crawl.user_agent.clone())
            .timeout(config.crawl.fetch_timeout())
            .build()
            .map_err(|e| DocsError::Config(format!("cannot build http client: {e}")))?;
        let retry = RetryPolicy::new(config.crawl.max_retries, config.crawl.retry_base_delay());

        let mut registry = Self::default();
        for (name, settings) in &config.tools {
            let kind = ProviderKind::parse(&settings.provider).ok_or_else(|| {
                DocsError::Config(format!("{name}: unknown provider kind '{}'", settings.provider))
            })?;
            let provider: Arc<dyn Provider> = match kind {
                ProviderKind::Nessus | ProviderKind::Topdesk => {
                    Arc::new(UnsupportedProvider::new(name.clone()))
                }
                ProviderKind::Confluence => Arc::new(ConfluenceProvider::new(
                    name,
                    &settings.base_url,
                    settings.max_pages,
                    client.clone(),
                    retry.clone(),
                )?),
                ProviderKind::Local => Arc::new(LocalDirProvider::new(name, &settings.base_url)),
                site => Arc::new(HtmlSiteProvider::new(
                    name,
                    &settings.base_url,
                    SiteProfile::for_kind(site),
                    settings.max_pages,
                    client.clone(),
                    retry.clone(),
                )?),
            };
            registry.registrations.insert(
                name.clone(),
                ProviderRegistration {
                    name: name.clone(),
                    kind: Some(kind),
                    settings: settings.clone(),
                    provider,
                },
            );
        }
        tracing::info!("registered {} documentation tools", registry.len());
        Ok(registry)
    }

    /// Registers a provider built elsewhere, replacing any registration with
    /// the same name.
    pub fn with_provider(mut self, settings: ToolSettings, provider: Arc<dyn Provider>) -> Self {
        let name = provider.name().to_string();
        self.registrations.insert(
            name.clone(),
            ProviderRegistration {
                name,
                kind: ProviderKind::parse(&settings.provider),
                settings,
                provider,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProviderRegistration> {
        self.registrations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.registrations.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.registrations.values().filter(|r| r.settings.enabled)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
