use crate::AsyncStream;
use crate::address::AddrSpec;
use crate::protocol::{Command, ReplyCode, send_reply};
use crate::request::Request;
use crate::server::Config;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// CommandHandler executes one SOCKS5 command on an accepted request.
/// The handler owns the rest of the conversation, including the reply.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, stream: &mut dyn AsyncStream, request: Request) -> Result<()>;
}

/// Dialer opens outbound TCP connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream>;
}

/// DirectDialer connects straight to the target
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Handlers holds the optional handler of each command
#[derive(Clone, Default)]
pub struct Handlers {
    pub connect: Option<Arc<dyn CommandHandler>>,
    pub bind: Option<Arc<dyn CommandHandler>>,
    pub associate: Option<Arc<dyn CommandHandler>>,
}

impl Handlers {
    pub fn get(&self, command: Command) -> Option<&Arc<dyn CommandHandler>> {
        match command {
            Command::Connect => self.connect.as_ref(),
            Command::Bind => self.bind.as_ref(),
            Command::Associate => self.associate.as_ref(),
        }
    }
}

// ================
// CONNECT COMMAND
// ================

/// ConnectHandler dials the destination and relays bytes both ways
#[derive(Clone)]
pub struct ConnectHandler {
    dialer: Arc<dyn Dialer>,
}

impl ConnectHandler {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl CommandHandler for ConnectHandler {
    async fn handle(&self, stream: &mut dyn AsyncStream, request: Request) -> Result<()> {
        let target = request.target();

        let mut outbound = match self.dialer.dial(&target).await {
            Ok(outbound) => outbound,
            Err(e) => {
                send_reply(stream, reply_code_for(&e), None).await?;
                return Err(anyhow!("connect to {} failed: {}", request.dest_addr, e));
            }
        };

        let bound = AddrSpec::from(outbound.local_addr()?);
        send_reply(stream, ReplyCode::Succeeded, Some(&bound)).await?;

        let (from_client, from_server) = copy_bidirectional(stream, &mut outbound).await?;

        info!(
            "connection to {} closed: {} bytes from client, {} bytes from server",
            request.dest_addr, from_client, from_server
        );

        Ok(())
    }
}

/// reply_code_for maps a dial failure onto the closest SOCKS5 reply
fn reply_code_for(e: &io::Error) -> ReplyCode {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
        _ => ReplyCode::ServerFailure,
    }
}

// =========
// DISPATCH
// =========

/// dispatch resolves, rewrites and checks the request against the rule
/// set, then hands it to the handler configured for its command
pub(crate) async fn dispatch(
    config: &Config,
    stream: &mut dyn AsyncStream,
    mut request: Request,
) -> Result<()> {
    request.bind_ip = config.bind_ip;

    if let Some(host) = request.dest_addr.fqdn() {
        match config.resolver.resolve(host).await {
            Ok(ip) => {
                request.resolved_addr = Some(SocketAddr::new(ip, request.dest_addr.port));
            }
            Err(e) => {
                send_reply(stream, ReplyCode::HostUnreachable, None).await?;
                let dest = &request.dest_addr;
                return Err(e.context(format!("failed to resolve destination {dest}")));
            }
        }
    }

    if let Some(rewriter) = &config.rewriter {
        let dest = rewriter.rewrite(&request);
        debug!("rewrote {} to {}", request.dest_addr, dest);
        request.resolved_addr = dest.socket_addr();
        request.dest_addr = dest;
    }

    if !config.rules.allow(&request) {
        send_reply(stream, ReplyCode::ConnectionNotAllowed, None).await?;
        bail!("{} to {} blocked by rules", request.command, request.dest_addr);
    }

    // Validation already accepted the command, so the client gets no
    // reply here; the connection is simply closed
    let Some(handler) = config.handlers.get(request.command) else {
        bail!("no handler configured for {}", request.command);
    };

    handler.handle(stream, request).await
}
