mod cli;
mod config;
mod proxy;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use config::Config;
use gopher_core::{
    serve, Gateway, GopherClient, HtmlRenderer, Observer, RequestHandler, TracingObserver, TransportConfig,
};

/// Gopher (RFC 1436) client, server and HTTP proxy.
///
/// Hosts are given as host[:port]; the port defaults to 70.
#[derive(Parser, Debug)]
#[command(name = "gopher", author, version, about)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(long, global = true, env = "GOPHER_CONFIG")]
    config: Option<PathBuf>,

    /// Give up connecting after this many seconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Give up on a stalled read or write after this many seconds
    #[arg(long, global = true)]
    io_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a menu or document from a gopher server
    Client {
        /// Server to ask, host[:port]
        host: String,

        /// Selector to request
        #[arg(default_value = "")]
        selector: String,

        /// Item type of the selector: 1 prints a menu, 7 searches, anything
        /// else is streamed as-is
        #[arg(short = 't', long = "type", default_value = "1")]
        item_type: String,

        /// Search query for type 7 selectors
        #[arg(short, long)]
        query: Option<String>,

        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Force JSON output for menus (auto-enabled when stdout is piped)
        #[arg(long)]
        json: bool,
    },

    /// Serve a directory tree over gopher
    Server {
        /// Address to listen on
        #[arg(long)]
        listener: Option<String>,

        /// Directory to serve; each served directory needs a gophermap
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Translate HTTP requests into gopher requests
    Proxy {
        /// Address to listen on
        #[arg(long)]
        listener: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = match args.command {
        Command::Client { .. } => "warn",
        _ => "info",
    };
    // Tracing to stderr; stdout may carry a document
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let json = match &args.command {
        Command::Client { json, .. } => cli::use_json(*json),
        _ => false,
    };

    if let Err(e) = run(args).await {
        cli::handle_error(e, json);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            config::load_config(path)?
        }
        None => Config::default(),
    };

    let mut transport = config.transport.to_config();
    if let Some(secs) = args.connect_timeout {
        transport.connect_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(secs) = args.io_timeout {
        transport.io_timeout = Some(Duration::from_secs(secs));
    }

    let observer: Arc<dyn Observer> = Arc::new(TracingObserver);

    match args.command {
        Command::Client {
            host,
            selector,
            item_type,
            query,
            output,
            json,
        } => {
            let itype = cli::parse_type(&item_type)?;
            let client = GopherClient::new(transport, config.client.policy(), observer);
            cli::fetch(
                &client,
                &host,
                &selector,
                itype,
                query.as_deref(),
                output.as_deref(),
                cli::use_json(json),
            )
            .await
        }
        Command::Server { listener, root } => {
            let listener = listener.unwrap_or(config.server.listener);
            let root = root.unwrap_or(config.server.root);
            run_server(&listener, root, transport, observer).await
        }
        Command::Proxy { listener } => {
            let listener = listener.unwrap_or(config.proxy.listener);
            let client = GopherClient::new(transport, config.client.policy(), observer.clone());
            let gateway = Arc::new(
                Gateway::new(
                    Arc::new(client),
                    Arc::new(HtmlRenderer::new(config.proxy.title)),
                    observer,
                )
                .with_max_payload(config.proxy.max_payload_bytes),
            );
            let listener = std::net::TcpListener::bind(&listener)
                .with_context(|| format!("Failed to bind proxy listener {}", listener))?;
            proxy::serve(listener, gateway, shutdown_signal()).await
        }
    }
}

async fn run_server(
    listener: &str,
    root: PathBuf,
    transport: TransportConfig,
    observer: Arc<dyn Observer>,
) -> Result<()> {
    let handler = RequestHandler::new(&root, transport, observer)
        .with_context(|| format!("Cannot serve {}", root.display()))?;
    let tcp = tokio::net::TcpListener::bind(listener)
        .await
        .with_context(|| format!("Failed to bind gopher listener {}", listener))?;

    info!(listener = %listener, root = %handler.root().display(), "Starting gopher server");
    serve(tcp, Arc::new(handler), shutdown_signal()).await;
    info!("Gopher server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}
