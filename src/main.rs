use clap::Parser;
use onemcp::config::{resolve_config_path, GatewayOptions, InboundTransport, ENV_LOG_FILE};
use onemcp::gateway::Gateway;
use onemcp::mcp::server::{run_stdio_inbound, serve_http};
use onemcp::mcp::session::SessionQuery;
use onemcp::startup::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Inbound transport (stdio or http)
    #[arg(long, default_value = "http")]
    transport: String,

    /// Server host
    #[arg(long, default_value = onemcp::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(long, default_value_t = onemcp::DEFAULT_PORT)]
    port: u16,

    /// MCP servers config file path (defaults to the config dir, or ONE_MCP_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session storage directory
    #[arg(long)]
    session_storage: Option<PathBuf>,

    /// Require OAuth bearer tokens on inbound MCP endpoints
    #[arg(long)]
    auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log file path (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Tag filter expression for the stdio session
    #[arg(long)]
    tag_filter: Option<String>,

    /// Preset name for the stdio session
    #[arg(long)]
    preset: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal: {}", e);
            eprintln!("Fatal: {}", e);
            1
        }
    });
}

async fn run(cli: Cli) -> onemcp::Result<()> {
    let transport = match cli.transport.as_str() {
        "stdio" => InboundTransport::Stdio,
        "http" => InboundTransport::Http,
        other => {
            return Err(onemcp::GatewayError::config(format!(
                "unknown transport '{}' (expected stdio or http)",
                other
            )))
        }
    };

    let log_file = cli
        .log_file
        .or_else(|| std::env::var(ENV_LOG_FILE).ok().map(PathBuf::from));
    init_logging(&cli.log_level, log_file.as_deref())?;

    let options = GatewayOptions {
        transport,
        host: cli.host,
        port: cli.port,
        config_path: resolve_config_path(cli.config),
        session_storage_path: cli.session_storage,
        auth_enabled: cli.auth,
        log_level: cli.log_level,
        log_file,
    };
    info!(
        "Starting 1mcp gateway v{} (config: {})",
        onemcp::VERSION,
        options.config_path.display()
    );

    let gateway = Gateway::new(options, None)?;
    gateway.start().await?;

    let result = match transport {
        InboundTransport::Http => {
            let serving = serve_http(Arc::clone(&gateway));
            tokio::select! {
                served = serving => served,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received");
                    Ok(())
                }
            }
        }
        InboundTransport::Stdio => {
            let query = SessionQuery {
                preset: cli.preset,
                tag_filter: cli.tag_filter,
                ..Default::default()
            };
            run_stdio_inbound(Arc::clone(&gateway), query).await
        }
    };

    gateway.shutdown().await;
    result
}
