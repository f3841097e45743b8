use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geochat::server::{Server, ServerConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_QUEUE_CAPACITY};

#[derive(Parser)]
#[command(name = "server", version, about = "geochat position/chat fan-out server")]
struct Args {
    /// TCP address to listen on
    #[arg(long, env = "GEOCHAT_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Frames buffered per client before it is dropped as too slow
    #[arg(
        long,
        env = "GEOCHAT_QUEUE_CAPACITY",
        default_value_t = DEFAULT_QUEUE_CAPACITY,
        value_parser = parse_capacity
    )]
    queue_capacity: usize,

    /// Longest accepted inbound frame in bytes
    #[arg(long, env = "GEOCHAT_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "GEOCHAT_JSON_LOGS")]
    json_logs: bool,
}

fn parse_capacity(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("geochat=info,server=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("geochat server v{} starting", env!("CARGO_PKG_VERSION"));

    let srv = Arc::new(Server::new(ServerConfig {
        queue_capacity: args.queue_capacity,
        max_frame_len: args.max_frame_len,
    }));

    tokio::select! {
        res = srv.listen_and_serve(&args.addr) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
