use crate::AsyncStream;
use crate::auth::{
    self, Authenticator, CredentialStore, NoAuthAuthenticator, UserPass, UserPassAuthenticator,
};
use crate::bridge::bridge_http;
use crate::commands::{self, CommandHandler, ConnectHandler, Dialer, DirectDialer, Handlers};
use crate::http_proxy::{self, Upstream};
use crate::pool::{BufferPool, TaskPool, spawn_task};
use crate::protocol::{MethodRequest, Version};
use crate::request::read_request;
use crate::resolver::{DnsResolver, NameResolver};
use crate::rules::{AddressRewriter, PermitCommand, RuleSet};
use anyhow::{Context, Result, anyhow, bail};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Config is the immutable server configuration shared by every
/// connection task
pub(crate) struct Config {
    pub(crate) authenticators: Vec<Arc<dyn Authenticator>>,
    pub(crate) resolver: Arc<dyn NameResolver>,
    pub(crate) rules: Arc<dyn RuleSet>,
    pub(crate) rewriter: Option<Arc<dyn AddressRewriter>>,
    pub(crate) bind_ip: Option<IpAddr>,
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) task_pool: Option<Arc<dyn TaskPool>>,
    pub(crate) handlers: Handlers,
    pub(crate) bridge_auth: Option<UserPass>,
}

/// ServerBuilder collects the server options
#[derive(Default)]
pub struct ServerBuilder {
    authenticators: Vec<Arc<dyn Authenticator>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    resolver: Option<Arc<dyn NameResolver>>,
    rules: Option<Arc<dyn RuleSet>>,
    rewriter: Option<Arc<dyn AddressRewriter>>,
    bind_ip: Option<IpAddr>,
    buffer_pool: Option<Arc<BufferPool>>,
    task_pool: Option<Arc<dyn TaskPool>>,
    dialer: Option<Arc<dyn Dialer>>,
    handlers: Handlers,
    bridge_auth: Option<UserPass>,
}

impl ServerBuilder {
    /// with_authenticator appends an authentication method. Methods are
    /// tried in the order they were added.
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push(auth);
        self
    }

    /// with_credentials enables username/password authentication when no
    /// authenticator is set explicitly. HTTP clients are only served when
    /// the bridge has credentials as well, see `with_bridge_auth`.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// with_auth applies the desired authentication. The HTTP bridge logs
    /// in with the same credentials.
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.credentials = auth
            .clone()
            .map(|auth| Arc::new(auth) as Arc<dyn CredentialStore>);
        self.bridge_auth = auth;
        self
    }

    /// with_bridge_auth sets the credentials the HTTP bridge presents to
    /// this server's SOCKS5 listener
    pub fn with_bridge_auth(mut self, auth: UserPass) -> Self {
        self.bridge_auth = Some(auth);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn RuleSet>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn AddressRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// with_bind_ip sets the address BIND and ASSOCIATE handlers advertise.
    /// Handlers find it in `Request::bind_ip`.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// with_task_pool runs connection tasks on `pool`. Tasks the pool
    /// rejects are spawned directly.
    pub fn with_task_pool(mut self, pool: Arc<dyn TaskPool>) -> Self {
        self.task_pool = Some(pool);
        self
    }

    /// with_dialer replaces the outbound dialer of the built-in CONNECT
    /// handler
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_connect_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.connect = Some(handler);
        self
    }

    pub fn with_bind_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.bind = Some(handler);
        self
    }

    pub fn with_associate_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.associate = Some(handler);
        self
    }

    /// build freezes the configuration. At least one authenticator is
    /// always installed: user/pass when credentials were given, no-auth
    /// otherwise.
    pub fn build(self) -> Server {
        let mut authenticators = self.authenticators;
        if authenticators.is_empty() {
            let fallback: Arc<dyn Authenticator> = match self.credentials {
                Some(credentials) => Arc::new(UserPassAuthenticator::new(credentials)),
                None => Arc::new(NoAuthAuthenticator),
            };
            authenticators.push(fallback);
        }

        let mut handlers = self.handlers;
        if handlers.connect.is_none() {
            let dialer = self.dialer.unwrap_or_else(|| Arc::new(DirectDialer));
            handlers.connect = Some(Arc::new(ConnectHandler::new(dialer)));
        }

        let config = Config {
            authenticators,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(DnsResolver)),
            rules: self
                .rules
                .unwrap_or_else(|| Arc::new(PermitCommand::permit_all())),
            rewriter: self.rewriter,
            bind_ip: self.bind_ip,
            buffer_pool: self.buffer_pool.unwrap_or_default(),
            task_pool: self.task_pool,
            handlers,
            bridge_auth: self.bridge_auth,
        };

        let (shutdown, _) = watch::channel(false);

        Server {
            inner: Arc::new(Inner {
                config,
                listeners: Mutex::new(None),
                local_addr: OnceLock::new(),
                bridge_addr: OnceLock::new(),
                shutdown,
            }),
        }
    }
}

/// Server accepts SOCKS5 and plain HTTP proxy clients on one port
pub struct Server {
    inner: Arc<Inner>,
}

struct Listeners {
    primary: TcpListener,
    bridge: TcpListener,
}

struct Inner {
    config: Config,
    listeners: Mutex<Option<Listeners>>,
    local_addr: OnceLock<SocketAddr>,
    bridge_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl Default for Server {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Server implementation block
impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// local_addr is the primary listener address once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// bridge_addr is the internal HTTP proxy listener address once bound
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.inner.bridge_addr.get().copied()
    }

    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.inner.config.bind_ip
    }

    /// bind binds the primary listener to `addr` and the internal HTTP
    /// bridge listener to an ephemeral loopback port of the same family.
    /// Can only be called once.
    pub async fn bind(&self, addr: &str) -> Result<SocketAddr> {
        if self.inner.local_addr.get().is_some() {
            bail!("bind can only be called once");
        }

        let primary = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        let local_addr = primary.local_addr()?;

        let bridge = TcpListener::bind(SocketAddr::new(loopback_for(local_addr.ip()), 0))
            .await
            .context("failed to listen for the http bridge")?;
        let bridge_addr = bridge.local_addr()?;

        self.inner
            .local_addr
            .set(local_addr)
            .map_err(|_| anyhow!("bind can only be called once"))?;
        self.inner
            .bridge_addr
            .set(bridge_addr)
            .map_err(|_| anyhow!("bind can only be called once"))?;
        *self.inner.listeners()? = Some(Listeners { primary, bridge });

        info!("SOCKS5 proxy listening on {}", local_addr);
        Ok(local_addr)
    }

    /// listen_and_serve binds to `addr` and serves until shutdown or the
    /// first listener failure
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        self.bind(addr).await?;
        self.serve().await
    }

    /// serve runs the accept loop and the HTTP bridge engine on the bound
    /// listeners. Whichever finishes first decides the result; a clean
    /// shutdown returns Ok.
    pub async fn serve(&self) -> Result<()> {
        let Listeners { primary, bridge } = self
            .inner
            .listeners()?
            .take()
            .ok_or_else(|| anyhow!("server is not bound"))?;

        let upstream = Upstream::new(
            dialable(primary.local_addr()?),
            self.inner.config.bridge_auth.clone(),
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(http_proxy::serve(
            bridge,
            upstream,
            self.inner.shutdown.subscribe(),
        ));
        tasks.spawn(accept_loop(self.inner.clone(), primary));

        // Dropping the set aborts the listener still running
        match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(anyhow!("listener task failed: {e}")),
            None => Ok(()),
        }
    }

    /// shutdown stops accepting new connections without waiting for the
    /// ones in flight
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        // Listeners not handed to serve yet are closed here
        drop(self.inner.listeners()?.take());
        Ok(())
    }

    /// serve_conn serves a single accepted connection
    pub async fn serve_conn(&self, stream: TcpStream) -> Result<()> {
        self.inner.serve_conn(stream).await
    }

    /// serve_stream serves any byte stream as if it had been accepted
    pub async fn serve_stream<S>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner
            .serve_stream(stream, local_addr, remote_addr)
            .await
    }
}

/// accept_loop hands every accepted connection to its own task
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) -> Result<()> {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Shutting socks5 server down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("new client: {}", peer_addr);

                let conn = inner.clone();
                spawn_task(
                    inner.config.task_pool.as_deref(),
                    Box::pin(async move {
                        if let Err(e) = conn.serve_conn(stream).await {
                            error!("connection error from {}: {:#}", peer_addr, e);
                        }
                    }),
                );
            }
            Err(e) => {
                if *shutdown.borrow() {
                    info!("Shutting socks5 server down");
                    return Ok(());
                }
                error!("accept failed: {}", e);
                return Err(e.into());
            }
        }
    }
}

impl Inner {
    fn listeners(&self) -> Result<MutexGuard<'_, Option<Listeners>>> {
        self.listeners
            .lock()
            .map_err(|_| anyhow!("listener state poisoned"))
    }

    async fn serve_conn(&self, stream: TcpStream) -> Result<()> {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        self.serve_stream(stream, local_addr, remote_addr).await
    }

    /// serve_stream sniffs the first byte and picks the SOCKS5 or the
    /// HTTP bridge path. The stream is closed when this returns.
    async fn serve_stream<S>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = BufReader::new(stream);

        // Peek without consuming, the byte stays buffered for both paths
        let Some(first) = conn.fill_buf().await?.first().copied() else {
            bail!("connection closed before any data");
        };

        if first == Version::SOCKS5 as u8 {
            self.handle_socks(&mut conn, local_addr, remote_addr).await
        } else {
            let bridge_addr = *self
                .bridge_addr
                .get()
                .ok_or_else(|| anyhow!("http bridge is not running"))?;
            debug!("bridging non-SOCKS5 client (first byte {:#04x})", first);
            bridge_http(conn, bridge_addr, self.config.buffer_pool.clone()).await
        }
    }

    /// handle_socks handles the full client/server SOCKS5 protocol flow
    async fn handle_socks(
        &self,
        conn: &mut dyn AsyncStream,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        let method_request = MethodRequest::parse(conn).await?;

        let user_addr = remote_addr.map(|addr| addr.to_string()).unwrap_or_default();
        let auth_context = auth::negotiate(
            conn,
            &self.config.authenticators,
            &user_addr,
            &method_request.methods,
        )
        .await
        .context("failed to authenticate")?;

        let request = read_request(conn, auth_context, local_addr, remote_addr).await?;
        debug!("{} {} from {}", request.command, request.dest_addr, user_addr);

        commands::dispatch(&self.config, conn, request).await
    }
}

/// loopback_for is the loopback address of the same family as `ip`
fn loopback_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

/// dialable turns a wildcard listen address into one a local client
/// can connect to
fn dialable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(loopback_for(addr.ip()), addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthMethod;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::time::{Duration, timeout};

    #[test]
    fn defaults_to_no_auth() {
        let server = Server::builder().build();
        let codes: Vec<u8> = server
            .config()
            .authenticators
            .iter()
            .map(|auth| auth.code())
            .collect();
        assert_eq!(codes, vec![AuthMethod::NoAuth as u8]);
        assert!(server.config().handlers.connect.is_some());
        assert!(server.config().handlers.bind.is_none());
    }

    #[test]
    fn credentials_install_user_pass() {
        let server = Server::builder()
            .with_auth(Some(UserPass {
                username: "u".to_string(),
                password: "p".to_string(),
            }))
            .build();
        let codes: Vec<u8> = server
            .config()
            .authenticators
            .iter()
            .map(|auth| auth.code())
            .collect();
        assert_eq!(codes, vec![AuthMethod::UserPass as u8]);
        let bridge_auth = server.config().bridge_auth.as_ref().unwrap();
        assert_eq!(bridge_auth.username, "u");
        assert_eq!(bridge_auth.password, "p");
    }

    #[test]
    fn explicit_authenticators_win() {
        let server = Server::builder()
            .with_authenticator(Arc::new(NoAuthAuthenticator))
            .with_auth(Some(UserPass {
                username: "u".to_string(),
                password: "p".to_string(),
            }))
            .build();
        assert_eq!(server.config().authenticators.len(), 1);
        assert_eq!(
            server.config().authenticators[0].code(),
            AuthMethod::NoAuth as u8
        );
    }

    #[test]
    fn wildcard_addresses_become_loopback() {
        let v4: SocketAddr = "0.0.0.0:1080".parse().unwrap();
        let v6: SocketAddr = "[::]:1080".parse().unwrap();
        let fixed: SocketAddr = "10.0.0.2:1080".parse().unwrap();
        assert_eq!(dialable(v4), "127.0.0.1:1080".parse().unwrap());
        assert_eq!(dialable(v6), "[::1]:1080".parse().unwrap());
        assert_eq!(dialable(fixed), fixed);
    }

    #[tokio::test]
    async fn socks5_first_byte_takes_socks_path() {
        let server = Server::builder().build();
        let (stream, mut client) = duplex(256);
        let task = tokio::spawn(async move { server.serve_stream(stream, None, None).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        drop(client);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn other_first_byte_takes_bridge_path() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder().build();
        server
            .inner
            .bridge_addr
            .set(target.local_addr().unwrap())
            .unwrap();

        let (stream, mut client) = duplex(256);
        tokio::spawn(async move { server.serve_stream(stream, None, None).await });
        client.write_all(&[0x16]).await.unwrap();

        let (mut bridged, _) = target.accept().await.unwrap();
        let mut first = [0u8; 1];
        bridged.read_exact(&mut first).await.unwrap();
        assert_eq!(first, [0x16]);
    }

    #[tokio::test]
    async fn empty_connection_is_an_error() {
        let server = Server::builder().build();
        let (stream, client) = duplex(16);
        drop(client);

        let err = server.serve_stream(stream, None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "connection closed before any data");
    }

    #[tokio::test]
    async fn shutdown_stops_serving_cleanly() {
        let server = Arc::new(Server::builder().build());
        server.bind("127.0.0.1:0").await.unwrap();

        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown().unwrap();

        let result = timeout(Duration::from_secs(5), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let server = Server::builder().build();
        server.bind("127.0.0.1:0").await.unwrap();
        server.shutdown().unwrap();
        server.shutdown().unwrap();
        assert!(server.serve().await.is_err());
    }

    #[tokio::test]
    async fn bind_only_once() {
        let server = Server::builder().build();
        server.bind("127.0.0.1:0").await.unwrap();
        assert!(server.bind("127.0.0.1:0").await.is_err());
        assert!(server.bridge_addr().unwrap().ip().is_loopback());
    }
}
