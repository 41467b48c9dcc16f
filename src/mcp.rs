//! MCP protocol surface.
//!
//! Exposes the query engine as three MCP tools:
//!
//! - `search_documentation`: ranked search across one or more tools
//! - `get_documentation`: one page of one tool, looked up by topic
//! - `list_available_tools`: the registered documentation tools
//!
//! Argument schemas are derived from the argument types. Calls with bad
//! arguments, unknown tool names or failing lookups answer with a
//! [`CallToolResult`] describing the problem, so a misbehaving client can
//! never tear down the session with a protocol error.

use rmcp::handler::server::tool::cached_schema_for_type;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject, ListPromptsResult,
    ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{Error as McpError, RoleServer, ServerHandler, schemars};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::DocsError;
use crate::query::{QueryEngine, format_document, format_tools};

pub const SEARCH_DOCUMENTATION: &str = "search_documentation";
pub const GET_DOCUMENTATION: &str = "get_documentation";
pub const LIST_AVAILABLE_TOOLS: &str = "list_available_tools";

const OPERATIONS: [&str; 3] = [SEARCH_DOCUMENTATION, GET_DOCUMENTATION, LIST_AVAILABLE_TOOLS];

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SearchDocumentationArgs {
    #[schemars(description = "Search terms, e.g. 'install docker engine'")]
    pub query: String,
    #[serde(default)]
    #[schemars(description = "Tools to search (see list_available_tools). Empty or omitted searches every tool.")]
    pub tools: Vec<String>,
    #[serde(default)]
    #[schemars(description = "Maximum number of results, default 10")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GetDocumentationArgs {
    #[schemars(description = "Tool name, e.g. 'docker'")]
    pub tool: String,
    #[schemars(description = "Page to return: a url, path, title or section such as 'Compose > Networking'")]
    pub topic: String,
}

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListAvailableToolsArgs {}

fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text)])
}

fn error_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text)])
}

fn parse_args<T: DeserializeOwned>(
    operation: &str,
    arguments: Option<JsonObject>,
) -> Result<T, CallToolResult> {
    let value = serde_json::Value::Object(arguments.unwrap_or_default());
    serde_json::from_value(value).map_err(|e| {
        tracing::debug!("{operation}: rejected arguments: {e}");
        error_result(format!("{operation}: invalid arguments: {e}"))
    })
}

/// MCP server handler over a [`QueryEngine`].
#[derive(Clone)]
pub struct DocsServer {
    engine: QueryEngine,
}

impl DocsServer {
    pub fn new(engine: QueryEngine) -> Self {
        Self { engine }
    }

    /// The advertised tools with their argument schemas.
    pub fn tools() -> Vec<Tool> {
        vec![
            Tool::new(
                SEARCH_DOCUMENTATION,
                "Search crawled documentation across the registered tools and return ranked results with excerpts",
                cached_schema_for_type::<SearchDocumentationArgs>(),
            ),
            Tool::new(
                GET_DOCUMENTATION,
                "Return the full text of one documentation page of a tool, looked up by url, path, title or section",
                cached_schema_for_type::<GetDocumentationArgs>(),
            ),
            Tool::new(
                LIST_AVAILABLE_TOOLS,
                "List the registered documentation tools with their status and document counts",
                cached_schema_for_type::<ListAvailableToolsArgs>(),
            ),
        ]
    }

    /// Runs one tool call. Every failure becomes an error result.
    pub async fn dispatch(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        tracing::debug!("tool call: {name}");
        let result = match name {
            SEARCH_DOCUMENTATION => match parse_args(name, arguments) {
                Ok(args) => self.search_documentation(args).await,
                Err(result) => result,
            },
            GET_DOCUMENTATION => match parse_args(name, arguments) {
                Ok(args) => self.get_documentation(args).await,
                Err(result) => result,
            },
            LIST_AVAILABLE_TOOLS => match parse_args::<ListAvailableToolsArgs>(name, arguments) {
                Ok(_) => self.list_available_tools().await,
                Err(result) => result,
            },
            unknown => error_result(format!(
                "unknown operation '{unknown}'; valid operations: {}",
                OPERATIONS.join(", ")
            )),
        };
        if result.is_error == Some(true) {
            tracing::info!("tool call {name} answered with an error");
        }
        result
    }

    async fn search_documentation(&self, args: SearchDocumentationArgs) -> CallToolResult {
        match self.engine.search(&args.query, &args.tools, args.limit).await {
            Ok(response) => text_result(response.to_text()),
            Err(err) => {
                if matches!(err, DocsError::Store(_)) {
                    tracing::error!("{SEARCH_DOCUMENTATION}: {err}");
                }
                error_result(err.to_string())
            }
        }
    }

    async fn get_documentation(&self, args: GetDocumentationArgs) -> CallToolResult {
        match self.engine.get(&args.tool, &args.topic).await {
            Ok(doc) => text_result(format_document(&doc)),
            Err(DocsError::NotFound { tool, target }) => text_result(format!(
                "No documentation found for topic '{}' in '{tool}': {target}",
                args.topic.trim()
            )),
            Err(err) => {
                if matches!(err, DocsError::Store(_)) {
                    tracing::error!("{GET_DOCUMENTATION}: {err}");
                }
                error_result(err.to_string())
            }
        }
    }

    async fn list_available_tools(&self) -> CallToolResult {
        text_result(format_tools(&self.engine.list_tools().await))
    }
}

impl ServerHandler for DocsServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server searches crawled enterprise documentation. \
                Use 'list_available_tools' to see which documentation sources are registered, \
                'search_documentation' to find pages by keywords, and 'get_documentation' to read \
                one page of a tool by url, path, title or section."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: PaginatedRequestParam,
        _: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            next_cursor: None,
            tools: Self::tools(),
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.dispatch(&request.name, request.arguments).await)
    }

    async fn list_prompts(
        &self,
        _request: PaginatedRequestParam,
        _: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            next_cursor: None,
            prompts: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchSettings, ToolSettings};
    use crate::document::Document;
    use crate::provider::{ProviderKind, ProviderRegistry, UnsupportedProvider};
    use crate::store::{DocumentStore, IndexedStore, StoreOptions};
    use serde_json::json;
    use std::sync::Arc;

    async fn server() -> DocsServer {
        let mut settings = ToolSettings::for_kind(ProviderKind::Local);
        settings.base_url = "/srv/docs".into();
        let registry = ProviderRegistry::default()
            .with_provider(settings, Arc::new(UnsupportedProvider::new("docs-a")));
        let store = Arc::new(IndexedStore::new(StoreOptions::default()));
        store
            .upsert(Document::new(
                "docs-a",
                "https://docs.example/install",
                "Install",
                "Download the installer and run it.",
                vec!["Guide".into()],
            ))
            .await
            .unwrap();
        DocsServer::new(QueryEngine::new(Arc::new(registry), store, SearchSettings::default()))
    }

    fn args(value: serde_json::Value) -> Option<JsonObject> {
        value.as_object().cloned()
    }

    fn text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_tools_advertise_schemas() {
        let tools = DocsServer::tools();
        let names: Vec<&str> = tools.iter().map(|t| &*t.name).collect();
        assert_eq!(names, OPERATIONS.to_vec());
        let search = &tools[0].input_schema;
        let properties = search.get("properties").and_then(|p| p.as_object()).unwrap();
        assert!(properties.contains_key("query"));
        assert!(properties.contains_key("tools"));
        assert!(properties.contains_key("limit"));
    }

    #[tokio::test]
    async fn test_search_call() {
        let server = server().await;
        let result = server
            .dispatch(SEARCH_DOCUMENTATION, args(json!({"query": "installer", "tools": ["docs-a"], "limit": 1})))
            .await;
        assert_ne!(result.is_error, Some(true));
        assert!(text(&result).contains("https://docs.example/install"));
    }

    #[tokio::test]
    async fn test_bad_arguments_are_error_results() {
        let server = server().await;
        let empty = server.dispatch(SEARCH_DOCUMENTATION, args(json!({"query": ""}))).await;
        assert_eq!(empty.is_error, Some(true));
        assert!(text(&empty).contains("query must not be empty"));

        let missing = server.dispatch(SEARCH_DOCUMENTATION, None).await;
        assert_eq!(missing.is_error, Some(true));
        assert!(text(&missing).contains("invalid arguments"));

        let wrong_type = server
            .dispatch(SEARCH_DOCUMENTATION, args(json!({"query": "x", "limit": "ten"})))
            .await;
        assert_eq!(wrong_type.is_error, Some(true));

        let extra = server
            .dispatch(GET_DOCUMENTATION, args(json!({"tool": "docs-a", "topic": "x", "verbose": true})))
            .await;
        assert_eq!(extra.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_unknown_operation_lists_valid_ones() {
        let server = server().await;
        let result = server.dispatch("delete_everything", None).await;
        assert_eq!(result.is_error, Some(true));
        let message = text(&result);
        for op in OPERATIONS {
            assert!(message.contains(op));
        }
    }

    #[tokio::test]
    async fn test_get_documentation_not_found_is_a_message() {
        let server = server().await;
        let found = server
            .dispatch(GET_DOCUMENTATION, args(json!({"tool": "docs-a", "topic": "install"})))
            .await;
        assert!(text(&found).starts_with("# Install"));

        let unknown = server
            .dispatch(GET_DOCUMENTATION, args(json!({"tool": "unknown-tool", "topic": "x"})))
            .await;
        assert_ne!(unknown.is_error, Some(true));
        assert!(text(&unknown).contains("No documentation found"));

        let listing = server.dispatch(LIST_AVAILABLE_TOOLS, None).await;
        assert!(text(&listing).contains("docs-a"));
        assert!(!text(&listing).contains("unknown-tool"));
    }
}
