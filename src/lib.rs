//! Enterprise Documentation MCP Service
//!
//! Crawls the documentation of the tools an enterprise runs (search
//! engines, container platforms, wikis and the like), keeps it in an
//! indexed document store and serves it to AI assistants over the Model
//! Context Protocol.
//!
//! # Features
//!
//! - Concurrent, rate-limit aware crawling with per-provider worker pools
//! - Incremental recrawls driven by content hashes and freshness probes
//! - Blended BM25 and vector ranking with highlighted excerpts
//! - MCP server over stdio or SSE
//!
//! # Modules
//!
//! - [`provider`]: documentation sources and their registry
//! - [`crawl`]: crawl scheduler and run reports
//! - [`store`]: document store, index and persistence
//! - [`query`]: search and lookup front end
//! - [`mcp`]: MCP server implementation and protocol handling
//! - [`service`]: component assembly, lifecycle and health
//! - [`config`]: configuration file format and defaults

pub mod config;
pub mod crawl;
pub mod document;
pub mod error;
pub mod mcp;
pub mod provider;
pub mod query;
pub mod retry;
pub mod server;
pub mod service;
pub mod store;

pub use error::{DocsError, Result};
