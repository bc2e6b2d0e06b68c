//! keyrackd - session-scoped credential daemon
//!
//! Holds unlocked credentials in memory under TTL and answers the keyrack
//! CLI over a unix socket. One daemon per (login session, owner) pair;
//! the CLI spawns it on demand and it outlives the spawning process.

use anyhow::Result;
use clap::Parser;
use keyrackd::Server;
use keyrack_core::SessionContext;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyrackd")]
#[command(about = "keyrack daemon - holds unlocked credentials for one login session")]
#[command(version)]
struct Cli {
    /// Socket path (defaults to the per-session, per-owner path)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Owner name, for per-owner daemon isolation
    #[arg(long, default_value = "default")]
    owner: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let ctx = SessionContext::current();
    let socket = cli
        .socket
        .or_else(|| std::env::var("KEYRACK_SOCKET").ok().map(PathBuf::from))
        .unwrap_or_else(|| ctx.socket_path(&cli.owner));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = Server::bind(socket, ctx)?;
        server.run().await
    })
}
