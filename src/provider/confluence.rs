//! Confluence spaces through the REST content API.
//!
//! Sections are space keys. Locations are the human-facing
//! `pages/viewpage.action?pageId=..` urls so that search results link
//! somewhere a reader can open.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::html::html_fragment_text;
use super::http::HttpFetcher;
use super::{Provider, RawContent};
use crate::document::{Document, FreshnessTag};
use crate::error::{DocsError, Result};
use crate::retry::RetryPolicy;

const LIST_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct ContentList {
    #[serde(default)]
    results: Vec<ContentSummary>,
    #[serde(rename = "_links", default)]
    links: ListLinks,
}

#[derive(Debug, Default, Deserialize)]
struct ListLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentSummary {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContentDetail {
    #[serde(default)]
    title: String,
    body: Option<ContentBody>,
    #[serde(default)]
    ancestors: Vec<Ancestor>,
    #[serde(default)]
    space: Option<Space>,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    storage: StorageValue,
}

#[derive(Debug, Deserialize)]
struct StorageValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Ancestor {
    title: String,
}

#[derive(Debug, Deserialize)]
struct Space {
    key: String,
}

pub struct ConfluenceProvider {
    name: String,
    base: Url,
    max_pages: usize,
    http: HttpFetcher,
}

impl ConfluenceProvider {
    pub fn new(
        name: &str,
        base_url: &str,
        max_pages: usize,
        client: Client,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let raw = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&raw)
            .map_err(|e| DocsError::Config(format!("{name}: invalid base_url '{base_url}': {e}")))?;
        Ok(Self {
            name: name.to_string(),
            base,
            max_pages: max_pages.max(1),
            http: HttpFetcher::new(name, client, retry),
        })
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| DocsError::Config(format!("{}: cannot build url for {path}: {e}", self.name)))
    }

    fn page_location(&self, id: &str) -> Result<String> {
        let mut url = self.join("pages/viewpage.action")?;
        url.query_pairs_mut().append_pair("pageId", id);
        Ok(url.to_string())
    }

    fn page_id(&self, location: &str) -> Result<String> {
        Url::parse(location)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == "pageId")
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                DocsError::InvalidArgument(format!("{}: '{location}' has no pageId", self.name))
            })
    }
}

#[async_trait]
impl Provider for ConfluenceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_locations(&self, section: &str) -> Result<Vec<String>> {
        let page_size = LIST_PAGE_SIZE.min(self.max_pages);
        let mut locations = Vec::new();
        let mut start = 0;
        loop {
            let mut url = self.join("rest/api/content")?;
            url.query_pairs_mut()
                .append_pair("spaceKey", section)
                .append_pair("type", "page")
                .append_pair("start", &start.to_string())
                .append_pair("limit", &page_size.to_string());
            let raw = self.http.get(&url).await?;
            let list: ContentList = serde_json::from_str(&raw.body)
                .map_err(|e| DocsError::malformed(&self.name, url.as_str(), e))?;

            let fetched = list.results.len();
            for summary in list.results {
                locations.push(self.page_location(&summary.id)?);
            }
            if fetched == 0 || list.links.next.is_none() || locations.len() >= self.max_pages {
                break;
            }
            start += fetched;
        }
        locations.truncate(self.max_pages);
        tracing::debug!("{}: space '{}' lists {} pages", self.name, section, locations.len());
        Ok(locations)
    }

    async fn fetch(&self, location: &str) -> Result<RawContent> {
        let id = self.page_id(location)?;
        let mut url = self.join(&format!("rest/api/content/{id}"))?;
        url.query_pairs_mut().append_pair("expand", "body.storage,ancestors,space");
        let mut raw = self.http.get(&url).await?;
        raw.location = location.to_string();
        Ok(raw)
    }

    async fn probe(&self, location: &str) -> Result<Option<FreshnessTag>> {
        let id = self.page_id(location)?;
        let url = self.join(&format!("rest/api/content/{id}"))?;
        self.http.head(&url).await
    }

    fn normalize(&self, raw: &RawContent) -> Result<Document> {
        let detail: ContentDetail = serde_json::from_str(&raw.body)
            .map_err(|e| DocsError::malformed(&self.name, &raw.location, e))?;
        let title = detail.title.trim();
        if title.is_empty() {
            return Err(DocsError::malformed(&self.name, &raw.location, "page has no title"));
        }
        let body = detail
            .body
            .map(|body| html_fragment_text(&body.storage.value))
            .unwrap_or_default();
        if body.is_empty() {
            return Err(DocsError::malformed(&self.name, &raw.location, "page has no body"));
        }
        let section_path = detail
            .space
            .map(|space| space.key)
            .into_iter()
            .chain(detail.ancestors.into_iter().map(|a| a.title))
            .collect();

        let mut doc = Document::new(&self.name, &raw.location, title, body, section_path)
            .with_freshness(raw.freshness.clone());
        doc.fetched_at = raw.fetched_at;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    fn provider(base: &str) -> ConfluenceProvider {
        ConfluenceProvider::new(
            "wiki",
            base,
            10,
            Client::new(),
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_locations_pages_through_results() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/rest/api/content")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("spaceKey".into(), "OPS".into()),
                Matcher::UrlEncoded("start".into(), "0".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results":[{"id":"1"},{"id":"2"}],"_links":{"next":"/rest/api/content?start=2"}}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/rest/api/content")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("spaceKey".into(), "OPS".into()),
                Matcher::UrlEncoded("start".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results":[{"id":"3"}],"_links":{}}"#)
            .create_async()
            .await;

        let provider = provider(&server.url());
        let locations = provider.list_locations("OPS").await.unwrap();
        first.assert_async().await;
        second.assert_async().await;

        let base = server.url();
        assert_eq!(
            locations,
            vec![
                format!("{base}/pages/viewpage.action?pageId=1"),
                format!("{base}/pages/viewpage.action?pageId=2"),
                format!("{base}/pages/viewpage.action?pageId=3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_and_normalize_page() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/rest/api/content/42")
            .match_query(Matcher::UrlEncoded("expand".into(), "body.storage,ancestors,space".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "42",
                    "title": "Restart the indexer",
                    "space": {"key": "OPS"},
                    "ancestors": [{"title": "Runbooks"}, {"title": "Search"}],
                    "body": {"storage": {"value": "<p>Stop the <b>service</b>.</p><p>Start it again.</p>"}}
                }"#,
            )
            .create_async()
            .await;

        let provider = provider(&server.url());
        let location = format!("{}/pages/viewpage.action?pageId=42", server.url());
        let raw = provider.fetch(&location).await.unwrap();
        m.assert_async().await;
        assert_eq!(raw.location, location);

        let doc = provider.normalize(&raw).unwrap();
        assert_eq!(doc.url, location);
        assert_eq!(doc.title, "Restart the indexer");
        assert_eq!(doc.body, "Stop the service.\n\nStart it again.");
        assert_eq!(doc.section_path, vec!["OPS", "Runbooks", "Search"]);
    }

    #[test]
    fn test_normalize_rejects_malformed_json() {
        let provider = provider("https://wiki.example");
        let raw = RawContent::new("https://wiki.example/pages/viewpage.action?pageId=1", "<html>");
        let err = provider.normalize(&raw).unwrap_err();
        assert!(matches!(err, DocsError::MalformedContent { .. }));

        let raw = RawContent::new(
            "https://wiki.example/pages/viewpage.action?pageId=1",
            r#"{"title": "Empty", "body": {"storage": {"value": "<p> </p>"}}}"#,
        );
        assert!(matches!(
            provider.normalize(&raw).unwrap_err(),
            DocsError::MalformedContent { .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_requires_page_id() {
        let provider = provider("https://wiki.example");
        let err = provider.fetch("https://wiki.example/display/OPS").await.unwrap_err();
        assert!(matches!(err, DocsError::InvalidArgument(_)));
    }
}
