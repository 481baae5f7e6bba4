//! HTTP forward proxy engine hosted on the internal bridge listener.
//!
//! Every outbound connection it makes goes through a SOCKS5 client
//! pointed at the server's own primary listener, so HTTP clients end up
//! on the same CONNECT path as SOCKS5 clients.

use crate::auth::UserPass;
use anyhow::{Result, anyhow};
use bytes::Bytes;
use http::header::{HOST, HeaderValue};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::client::conn::http1::Builder;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, error, info, warn};

/// Headers meant for the proxy itself, never forwarded
const PROXY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// Upstream is the SOCKS5 server every outbound connection goes through
#[derive(Clone)]
pub struct Upstream {
    pub addr: SocketAddr,
    /// Credentials offered when the server requires user/pass auth
    pub auth: Option<UserPass>,
}

impl Upstream {
    pub fn new(addr: SocketAddr, auth: Option<UserPass>) -> Self {
        Self { addr, auth }
    }

    async fn connect(
        &self,
        target: &str,
    ) -> Result<Socks5Stream<TcpStream>, tokio_socks::Error> {
        match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password(
                    self.addr,
                    target,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => Socks5Stream::connect(self.addr, target).await,
        }
    }
}

/// serve runs the proxy engine on `listener` until `shutdown` flips to
/// true. Accept failures end the loop with the error.
pub async fn serve(
    listener: TcpListener,
    upstream: Upstream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        "http bridge listening on {} via socks5 {}",
        listener.local_addr()?,
        upstream.addr
    );
    let upstream = Arc::new(upstream);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                error!("http bridge accept failed: {}", e);
                return Err(e.into());
            }
        };

        let upstream = upstream.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| proxy(req, upstream.clone()));

            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .half_close(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("http bridge connection from {} error: {:?}", peer_addr, err);
            }
        });
    }
}

async fn proxy(
    req: Request<hyper::body::Incoming>,
    upstream: Arc<Upstream>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if Method::CONNECT == req.method() {
        let Some(addr) = host_addr(req.uri()) else {
            warn!("CONNECT host is not socket addr: {:?}", req.uri());
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "CONNECT must be to a socket address",
            ));
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel(upgraded, &addr, &upstream).await {
                        warn!("tunnel to {} failed: {:#}", addr, e);
                    }
                }
                Err(e) => warn!("upgrade error: {}", e),
            }
        });

        return Ok(Response::new(empty()));
    }

    let addr = match origin_addr(req.uri()) {
        Some(addr) => addr,
        None => {
            warn!("HTTP request missing host: {:?}", req.uri());
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "HTTP request missing host",
            ));
        }
    };

    let stream = match upstream.connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SOCKS5 connection to {} failed: {}", addr, e);
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                "SOCKS5 connection failed",
            ));
        }
    };

    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("upstream connection error: {:?}", err);
        }
    });

    let resp = sender.send_request(into_origin_form(req)).await?;
    Ok(resp.map(|b| b.boxed()))
}

/// tunnel relays an upgraded CONNECT request through a SOCKS5 stream
async fn tunnel(upgraded: Upgraded, addr: &str, upstream: &Upstream) -> Result<()> {
    let mut server = upstream
        .connect(addr)
        .await
        .map_err(|e| anyhow!("upstream SOCKS5 connection failed: {e}"))?;
    let mut client = TokioIo::new(upgraded);

    let (from_client, from_server) = copy_bidirectional(&mut client, &mut server).await?;

    debug!(
        "tunnel to {} closed: {} bytes from client, {} bytes from server",
        addr, from_client, from_server
    );

    Ok(())
}

/// into_origin_form turns an absolute-form proxy request into the form
/// an origin server expects
fn into_origin_form<B>(mut req: Request<B>) -> Request<B> {
    if !req.headers().contains_key(HOST) {
        let host = req
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
        if let Some(host) = host {
            req.headers_mut().insert(HOST, host);
        }
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>();
    if let Ok(path) = path {
        *req.uri_mut() = path;
    }

    for name in PROXY_HEADERS {
        req.headers_mut().remove(*name);
    }

    req
}

fn host_addr(uri: &Uri) -> Option<String> {
    uri.authority().map(|auth| auth.to_string())
}

/// origin_addr is the host:port an absolute-form request goes to. The port
/// defaults from the scheme.
fn origin_addr(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    Some(format!("{}:{}", host, uri.port_u16().unwrap_or(default_port)))
}

fn status_response(
    status: StatusCode,
    msg: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
