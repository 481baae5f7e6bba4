use crate::AsyncStream;
use crate::protocol::{
    AuthMethod, AuthStatus, ProtocolError, USER_PASS_VERSION, send_method_reply,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// AuthContext is the outcome of a successful handshake, attached to
/// every request made on the connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthContext {
    /// Code of the method that authenticated the client
    pub method: u8,
    /// Method specific data, e.g. the username
    pub payload: HashMap<String, String>,
}

/// Authenticator is a SOCKS5 authentication mechanism
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// code is the method byte advertised during negotiation
    fn code(&self) -> u8;

    /// authenticate runs the method's exchange once it has been selected.
    /// Implementations write the method selection reply themselves.
    async fn authenticate(
        &self,
        stream: &mut dyn AsyncStream,
        user_addr: &str,
    ) -> Result<AuthContext>;
}

/// CredentialStore validates username/password pairs
pub trait CredentialStore: Send + Sync {
    fn valid(&self, user: &str, password: &str, user_addr: &str) -> bool;
}

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl CredentialStore for UserPass {
    fn valid(&self, user: &str, password: &str, _user_addr: &str) -> bool {
        user == self.username && password == self.password
    }
}

/// StaticCredentials maps usernames to passwords
#[derive(Clone, Default)]
pub struct StaticCredentials(pub HashMap<String, String>);

impl CredentialStore for StaticCredentials {
    fn valid(&self, user: &str, password: &str, _user_addr: &str) -> bool {
        self.0.get(user).is_some_and(|p| p == password)
    }
}

impl FromIterator<(String, String)> for StaticCredentials {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// NoAuthAuthenticator accepts every client
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthAuthenticator;

#[async_trait]
impl Authenticator for NoAuthAuthenticator {
    fn code(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn AsyncStream,
        _user_addr: &str,
    ) -> Result<AuthContext> {
        send_method_reply(stream, AuthMethod::NoAuth as u8).await?;
        Ok(AuthContext {
            method: AuthMethod::NoAuth as u8,
            payload: HashMap::new(),
        })
    }
}

/// UserPassAuthenticator implements RFC 1929 against a CredentialStore
#[derive(Clone)]
pub struct UserPassAuthenticator {
    pub credentials: Arc<dyn CredentialStore>,
}

impl UserPassAuthenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for UserPassAuthenticator {
    fn code(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn AsyncStream,
        user_addr: &str,
    ) -> Result<AuthContext> {
        // Tell the client to use user/pass auth
        send_method_reply(stream, AuthMethod::UserPass as u8).await?;

        // Client Username/Password Request
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;

        if header[0] != USER_PASS_VERSION {
            return Err(ProtocolError::UnsupportedAuthVersion(header[0]).into());
        }

        let mut username = vec![0u8; header[1] as usize];
        stream.read_exact(&mut username).await?;

        let mut password_len = [0u8; 1];
        stream.read_exact(&mut password_len).await?;

        let mut password = vec![0u8; password_len[0] as usize];
        stream.read_exact(&mut password).await?;

        // Username/Password Server response
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        let username = String::from_utf8(username);
        let password = String::from_utf8(password);
        let (username, password) = match (username, password) {
            (Ok(username), Ok(password))
                if self.credentials.valid(&username, &password, user_addr) =>
            {
                (username, password)
            }
            // Credentials that are not UTF-8 can never match a store entry
            _ => {
                stream
                    .write_all(&[USER_PASS_VERSION, AuthStatus::Failure as u8])
                    .await?;
                return Err(ProtocolError::UserAuthFailed.into());
            }
        };

        stream
            .write_all(&[USER_PASS_VERSION, AuthStatus::Success as u8])
            .await?;

        debug!("authenticated user {} from {}", username, user_addr);

        Ok(AuthContext {
            method: AuthMethod::UserPass as u8,
            payload: HashMap::from([
                ("username".to_string(), username),
                ("password".to_string(), password),
            ]),
        })
    }
}

/// negotiate picks the first configured authenticator the client offers
/// and runs it. When nothing matches the client is told so and the
/// handshake fails with `ProtocolError::NoSupportedAuth`.
pub async fn negotiate(
    stream: &mut dyn AsyncStream,
    authenticators: &[Arc<dyn Authenticator>],
    user_addr: &str,
    offered: &[u8],
) -> Result<AuthContext> {
    // Server preference order wins over client order
    if let Some(auth) = authenticators
        .iter()
        .find(|auth| offered.contains(&auth.code()))
    {
        return auth.authenticate(stream, user_addr).await;
    }

    // No usable method found, the write result does not change the outcome
    let _ = send_method_reply(stream, AuthMethod::NoAcceptable as u8).await;
    Err(ProtocolError::NoSupportedAuth.into())
}
