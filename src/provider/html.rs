//! Providers for static HTML documentation sites.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::http::HttpFetcher;
use super::{Provider, ProviderKind, RawContent};
use crate::document::{Document, FreshnessTag, collapse_whitespace};
use crate::error::{DocsError, Result};
use crate::retry::RetryPolicy;

const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "svg", "form", "button",
];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul",
    "ol", "pre", "table", "tr", "dt", "dd", "dl", "blockquote", "br", "hr",
];
const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".css", ".js", ".zip", ".gz", ".pdf", ".ico",
    ".woff", ".woff2", ".xml", ".json",
];

/// Where a documentation site keeps its title, main content and breadcrumbs.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteProfile {
    pub content_selectors: Vec<&'static str>,
    pub title_selectors: Vec<&'static str>,
    pub breadcrumb_selector: Option<&'static str>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            content_selectors: vec!["main", "article", "[role=main]", "#content", "body"],
            title_selectors: vec!["h1", "title"],
            breadcrumb_selector: None,
        }
    }
}

impl SiteProfile {
    pub fn for_kind(kind: ProviderKind) -> Self {
        let generic = Self::default();
        match kind {
            ProviderKind::Elasticsearch => Self {
                content_selectors: vec!["#content", "div.book", "main", "body"],
                breadcrumb_selector: Some("div.breadcrumbs a"),
                ..generic
            },
            ProviderKind::Docker => Self {
                content_selectors: vec!["main article", "article", "main", "body"],
                breadcrumb_selector: Some("nav.breadcrumbs a"),
                ..generic
            },
            ProviderKind::Python => Self {
                content_selectors: vec!["div.body[role=main]", "div.body", "body"],
                breadcrumb_selector: Some("li.nav-item a"),
                ..generic
            },
            ProviderKind::Proxmox => Self {
                content_selectors: vec!["#content", "div.sect1", "body"],
                ..generic
            },
            ProviderKind::N8n => Self {
                content_selectors: vec!["article.md-content__inner", "article", "main", "body"],
                breadcrumb_selector: Some("nav.md-path a"),
                ..generic
            },
            _ => generic,
        }
    }
}

/// Crawls a static documentation site by following links under each
/// section's path.
pub struct HtmlSiteProvider {
    name: String,
    base: Url,
    profile: SiteProfile,
    max_pages: usize,
    http: HttpFetcher,
}

impl HtmlSiteProvider {
    pub fn new(
        name: &str,
        base_url: &str,
        profile: SiteProfile,
        max_pages: usize,
        client: Client,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| DocsError::Config(format!("{name}: invalid base_url '{base_url}': {e}")))?;
        let last_segment = base.path().rsplit('/').next().unwrap_or_default().to_string();
        if !base.path().ends_with('/') && !last_segment.contains('.') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            name: name.to_string(),
            base,
            profile,
            max_pages: max_pages.max(1),
            http: HttpFetcher::new(name, client, retry),
        })
    }

    fn section_url(&self, section: &str) -> Result<Url> {
        self.base.join(section.trim_start_matches('/')).map_err(|e| {
            DocsError::InvalidArgument(format!("{}: invalid section '{section}': {e}", self.name))
        })
    }

    fn parse_location(&self, location: &str) -> Result<Url> {
        Url::parse(location).map_err(|e| {
            DocsError::InvalidArgument(format!("{}: invalid location '{location}': {e}", self.name))
        })
    }

    /// Links in `html` that stay under `section`'s directory, in document
    /// order, deduplicated, with fragments and queries removed.
    fn section_links(&self, section: &Url, html: &str) -> Vec<String> {
        let prefix = match section.path().rfind('/') {
            Some(idx) => section.path()[..=idx].to_string(),
            None => "/".to_string(),
        };
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        push_link(section.clone(), &mut seen, &mut links);

        let document = Html::parse_document(html);
        let Ok(anchors) = Selector::parse("a[href]") else {
            return links;
        };
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Ok(url) = section.join(href) else {
                continue;
            };
            if url.host_str() != section.host_str() || !url.path().starts_with(&prefix) {
                continue;
            }
            let lower = url.path().to_ascii_lowercase();
            if ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                continue;
            }
            push_link(url, &mut seen, &mut links);
        }
        links.truncate(self.max_pages);
        links
    }

    fn fallback_section_path(&self, url: &Url) -> Vec<String> {
        let relative = url
            .path()
            .strip_prefix(self.base.path())
            .unwrap_or(url.path());
        relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.trim_end_matches(".html").trim_end_matches(".htm"))
            .filter(|segment| !segment.is_empty() && *segment != "index")
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl Provider for HtmlSiteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_locations(&self, section: &str) -> Result<Vec<String>> {
        let url = self.section_url(section)?;
        let page = self.http.get(&url).await.map_err(|err| match err {
            DocsError::NotFound { .. } => {
                DocsError::source_unavailable(&self.name, format!("section index {url} not found"))
            }
            other => other,
        })?;
        let links = self.section_links(&url, &page.body);
        tracing::debug!("{}: section '{}' lists {} locations", self.name, section, links.len());
        Ok(links)
    }

    async fn fetch(&self, location: &str) -> Result<RawContent> {
        let url = self.parse_location(location)?;
        self.http.get(&url).await
    }

    async fn probe(&self, location: &str) -> Result<Option<FreshnessTag>> {
        let url = self.parse_location(location)?;
        self.http.head(&url).await
    }

    fn normalize(&self, raw: &RawContent) -> Result<Document> {
        if let Some(content_type) = &raw.content_type {
            let lower = content_type.to_ascii_lowercase();
            if !lower.contains("html") && !lower.contains("xml") && !lower.starts_with("text/") {
                return Err(DocsError::malformed(
                    &self.name,
                    &raw.location,
                    format!("unsupported content type {content_type}"),
                ));
            }
        }
        let parts = extract_html(&raw.body, &self.profile)
            .map_err(|reason| DocsError::malformed(&self.name, &raw.location, reason))?;
        let section_path = if parts.breadcrumbs.is_empty() {
            Url::parse(&raw.location)
                .map(|url| self.fallback_section_path(&url))
                .unwrap_or_default()
        } else {
            parts.breadcrumbs
        };
        let mut doc = Document::new(&self.name, &raw.location, parts.title, parts.body, section_path)
            .with_freshness(raw.freshness.clone());
        doc.fetched_at = raw.fetched_at;
        Ok(doc)
    }
}

/// Title, text and breadcrumbs pulled out of one HTML page.
#[derive(Debug, Clone, PartialEq)]
pub struct HtmlParts {
    pub title: String,
    pub body: String,
    pub breadcrumbs: Vec<String>,
}

/// Extracts the readable parts of an HTML page. Fails with a short reason
/// when the page has no title or no text.
pub fn extract_html(html: &str, profile: &SiteProfile) -> std::result::Result<HtmlParts, String> {
    let document = Html::parse_document(html);

    let title = profile
        .title_selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            document
                .select(&selector)
                .map(|el| collapse_inline(&el.text().collect::<String>()))
                .find(|text| !text.is_empty())
        })
        .ok_or_else(|| "page has no title".to_string())?;

    let content = profile
        .content_selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| document.select(&selector).next())
        .ok_or_else(|| "page has no content element".to_string())?;

    let mut text = String::new();
    collect_text(content, &mut text);
    let body = collapse_whitespace(&text);
    if body.is_empty() {
        return Err("page has no text content".to_string());
    }

    let breadcrumbs = profile
        .breadcrumb_selector
        .and_then(|s| Selector::parse(s).ok())
        .map(|selector| {
            document
                .select(&selector)
                .map(|el| collapse_inline(&el.text().collect::<String>()))
                .filter(|text| !text.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(HtmlParts {
        title,
        body,
        breadcrumbs,
    })
}

/// Plain text of an HTML fragment, without the page-level extraction rules.
pub fn html_fragment_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::new();
    collect_text(fragment.root_element(), &mut text);
    collapse_whitespace(&text)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    out.push_str("\n\n");
                }
                collect_text(child_el, out);
                if block {
                    out.push_str("\n\n");
                }
            }
            _ => {}
        }
    }
}

fn push_link(mut url: Url, seen: &mut HashSet<String>, links: &mut Vec<String>) {
    url.set_fragment(None);
    url.set_query(None);
    let key = url.to_string();
    if seen.insert(key.clone()) {
        links.push(key);
    }
}

fn collapse_inline(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
