//! A SOCKS5 proxy library that also serves plain HTTP proxy clients on
//! the same port
//!
//! ## Overview
//!
//! - Features:
//!     - Protocol detection from the first byte of every connection
//!     - No Authentication
//!     - Username/Password Authentication
//!     - CONNECT out of the box, pluggable BIND and UDP ASSOCIATE handlers
//!     - Rule sets, address rewriting and custom name resolution
//!     - HTTP forward proxying (plain requests and CONNECT tunnels) that
//!       egresses through the server's own SOCKS5 path
//!     - Optional bounded task pool with direct spawn fallback
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use mixsocks::{Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::builder()
//!         .with_auth(Some(UserPass {
//!             username: "user".to_string(),
//!             password: "pass".to_string(),
//!         }))
//!         .build();
//!     server.listen_and_serve("127.0.0.1:1080").await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod bridge;
pub mod commands;
pub mod http_proxy;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod resolver;
pub mod rules;
pub mod server;

use tokio::io::{AsyncRead, AsyncWrite};

/// AsyncStream is a bidirectional byte stream a connection can be served on
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

// Re-export main types at crate root for convenience
pub use address::{AddrSpec, Address};
pub use auth::{AuthContext, Authenticator, CredentialStore, UserPass};
pub use commands::{CommandHandler, ConnectHandler, Dialer};
pub use protocol::{AuthMethod, Command, ProtocolError, ReplyCode, Version};
pub use request::Request;
pub use server::{Server, ServerBuilder};
