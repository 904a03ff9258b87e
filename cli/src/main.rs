//! Heddle gateway binary: load config, init logging, serve until signalled.
//!
//! Exit codes: 0 on a clean shutdown; 1 on configuration or start failure
//! (including "port already in use"; one instance per host).

use std::path::PathBuf;

use clap::Parser;
use config::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "heddle")]
#[command(about = "Heddle — OpenAI-compatible gateway with an MCP tool layer")]
struct Args {
    /// Listen port (overrides HEDDLE_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind host (overrides HEDDLE_HOST)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Backend base URL (overrides HEDDLE_BACKEND_URL / OLLAMA_HOST)
    #[arg(long, value_name = "URL")]
    backend: Option<String>,

    /// Path to mcp.json with MCP server definitions (overrides HEDDLE_MCP_SERVERS)
    #[arg(long, value_name = "PATH")]
    mcp_servers: Option<PathBuf>,

    /// Verbose logging (debug level when RUST_LOG is not set)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "heddle=debug,serve=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args) -> Result<GatewayConfig, config::ConfigError> {
    // CLI flags override the environment; simplest is to push them into it
    // before the typed parse.
    if let Some(port) = args.port {
        std::env::set_var("HEDDLE_PORT", port.to_string());
    }
    if let Some(host) = &args.host {
        std::env::set_var("HEDDLE_HOST", host);
    }
    if let Some(backend) = &args.backend {
        std::env::set_var("HEDDLE_BACKEND_URL", backend);
    }
    if let Some(path) = &args.mcp_servers {
        std::env::set_var("HEDDLE_MCP_SERVERS", path);
    }
    GatewayConfig::from_env()
}

#[tokio::main]
async fn main() {
    config::load_and_apply("heddle", None::<&std::path::Path>).ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("heddle: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        backend = %cfg.backend.url,
        mcp_servers = cfg.mcp.servers.len(),
        "starting heddle gateway"
    );
    if let Err(e) = serve::run_serve(cfg).await {
        eprintln!("heddle: {e}");
        std::process::exit(1);
    }
}
