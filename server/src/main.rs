//! Server entrypoint: parse flags, set up logging, attempt a restart from the
//! existing WAL, and serve the client API.

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use groupchat_raft::storage::ensure_dir;
use groupchat_raft::RaftNode;
use log::info;

use groupchat_server::middleware::ClusterGuard;
use groupchat_server::{handlers, logging, ChatServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "chat-server", about = "Replicated group-chat server", version)]
struct Args {
    /// Port to listen for client requests
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Port to listen for peer raft messages
    #[arg(long = "raft-port", default_value_t = 8081)]
    raft_port: u16,

    /// Data directory for snapshots and WAL segments
    #[arg(long = "data-dir", default_value = "/tmp/groupchat")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(&args.log_level)?;

    info!(
        "starting chat server, port {}, raft port {}, data dir {}",
        args.port,
        args.raft_port,
        args.data_dir.display()
    );
    ensure_dir(&args.data_dir).context("failed to create data dir")?;

    let server = ChatServer::new(ServerConfig {
        port: args.port,
        raft_port: args.raft_port,
        data_dir: args.data_dir.clone(),
    });

    if let Some(node) = RaftNode::restart(&args.data_dir).context("failed to restart raft node")? {
        info!("restarting the existing raft cluster");
        let restarted = Arc::clone(&server);
        tokio::spawn(async move {
            restarted.bootstrap(move || Ok(node)).await;
        });
    }

    let data = web::Data::from(Arc::clone(&server));
    let guard_target = Arc::clone(&server);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(ClusterGuard::new(Arc::clone(&guard_target)))
            .configure(handlers::configure)
    })
    .bind(("0.0.0.0", args.port))
    .with_context(|| format!("failed to bind client port {}", args.port))?
    .run()
    .await?;
    Ok(())
}
