use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use enterprise_mcp_docs::config::ServerConfig;
use enterprise_mcp_docs::provider::ProviderRegistry;
use enterprise_mcp_docs::server;
use enterprise_mcp_docs::service::DocsService;

#[derive(Parser, Debug)]
#[command(version, about = "Enterprise documentation MCP server")]
struct Cli {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(short, long, global = true, env = "DOCS_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP server
    Serve {
        /// Transport to serve on
        #[arg(short, long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,

        /// Address for the SSE server
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        address: String,

        /// Crawl every enabled tool in the background after startup
        #[arg(long)]
        crawl_on_start: bool,
    },
    /// Crawl documentation into the store and print the report
    Crawl {
        /// Tool to crawl; repeatable
        #[arg(short, long = "tool")]
        tools: Vec<String>,

        /// Crawl every enabled tool
        #[arg(long, conflicts_with = "tools")]
        all: bool,

        /// Ignore cache lifetimes and freshness checks
        #[arg(long)]
        force: bool,
    },
    /// Print service, store and provider health
    Status,
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ConfigAction {
    /// Validate the configuration
    Check,
    /// Print the effective configuration as JSON
    Show,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Serve over stdin/stdout
    Stdio,
    /// Serve over HTTP server-sent events
    Sse,
}

fn load_config(path: Option<&std::path::Path>) -> Result<ServerConfig> {
    let config = ServerConfig::load_or_default(path)?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stdio_mode = matches!(
        cli.command,
        Command::Serve {
            transport: Transport::Stdio,
            ..
        }
    );
    server::init_tracing(&cli.log_level, stdio_mode);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            transport,
            address,
            crawl_on_start,
        } => {
            let service = DocsService::from_config(config)?;
            service.start().await?;
            if crawl_on_start {
                let background = service.clone();
                tokio::spawn(async move {
                    match background.crawl(&[], false).await {
                        Ok(report) => tracing::info!("startup crawl finished\n{report}"),
                        Err(e) => tracing::warn!("startup crawl did not finish: {e}"),
                    }
                });
            }
            let served = match transport {
                Transport::Stdio => server::start_stdio_server(&service).await,
                Transport::Sse => server::start_sse_server(&service, &address).await,
            };
            service.stop(true).await?;
            served?;
        }
        Command::Crawl { tools, all, force } => {
            if tools.is_empty() && !all {
                bail!("name at least one --tool or pass --all");
            }
            let service = DocsService::from_config(config)?;
            service.start().await?;
            let report = service.crawl(&tools, force).await?;
            service.stop(true).await.context("failed to persist the document store")?;
            println!("{report}");
        }
        Command::Status => {
            let service = DocsService::from_config(config)?;
            service.start().await?;
            println!("{}", service.get_health().await);
        }
        Command::Config { action } => match action {
            ConfigAction::Check => {
                let registry = ProviderRegistry::from_config(&config)?;
                println!(
                    "configuration ok: {} tools, {} enabled",
                    registry.len(),
                    registry.enabled().count()
                );
            }
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}
