use anyhow::{Result, bail};
use clap::Parser;
use mixsocks::{Server, auth::UserPass, pool::BoundedPool};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A SOCKS5 proxy that also speaks plain HTTP proxy on the same port",
    long_about = None
)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy, also used by the HTTP bridge
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Address advertised to BIND and ASSOCIATE clients
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Maximum number of concurrently running connection tasks
    #[arg(long)]
    max_tasks: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass {
                username: u,
                password: p,
            })
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let mut builder = Server::builder().with_auth(auth);
    if let Some(ip) = args.bind_ip {
        builder = builder.with_bind_ip(ip);
    }
    if let Some(max) = args.max_tasks {
        info!("Limiting connection tasks to {}", max);
        builder = builder.with_task_pool(Arc::new(BoundedPool::new(max)));
    }

    let server = Arc::new(builder.build());
    server.bind(&args.listen).await?;

    let signals = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            if let Err(e) = signals.shutdown() {
                error!("shutdown failed: {:#}", e);
            }
        }
    });

    // Run it
    info!("Starting mixed SOCKS5/HTTP proxy: {}", args.listen);
    server.serve().await
}
