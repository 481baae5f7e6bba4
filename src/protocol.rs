use crate::address::AddrSpec;
use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version of the username/password sub-negotiation (RFC 1929)
pub const USER_PASS_VERSION: u8 = 0x01;

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// AuthStatus is the status byte of the username/password reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    Associate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::Associate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Connect => "CONNECT",
            Command::Bind => "BIND",
            Command::Associate => "ASSOCIATE",
        };
        f.write_str(name)
    }
}

/// ReplyCode is the REP field of a SOCKS5 reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// ProtocolError holds the protocol conditions callers need to tell apart.
/// They travel inside `anyhow::Error`; use `downcast_ref` to match them.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no supported authentication mechanism")]
    NoSupportedAuth,

    #[error("unsupported auth version {0:#04x}")]
    UnsupportedAuthVersion(u8),

    #[error("user authentication failed")]
    UserAuthFailed,

    #[error("unrecognized address type {0:#04x}")]
    UnrecognizedAddrType(u8),

    #[error("unrecognized command[{0}]")]
    UnrecognizedCommand(u8),
}

/// MethodRequest is the client's method negotiation frame
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// parse reads a method negotiation frame from the reader
    pub async fn parse<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // ClientHello format
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;

        let version = buf[0];
        if version != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        let mut methods = vec![0u8; buf[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(Self { version, methods })
    }
}

/// send_method_reply writes the server's method selection
pub async fn send_method_reply<W>(writer: &mut W, method: u8) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    writer.write_all(&[Version::SOCKS5 as u8, method]).await?;
    Ok(())
}

/// RequestHeader is a parsed request frame whose command byte has not
/// been validated yet
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub version: u8,
    pub command: u8,
    pub dest_addr: AddrSpec,
}

impl RequestHeader {
    /// parse reads a SOCKS5 request frame from the reader
    pub async fn parse<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // SOCKS5 request format
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut reqbuf = [0u8; 3];
        reader.read_exact(&mut reqbuf).await?;

        let version = reqbuf[0];
        let command = reqbuf[1];
        // Not checking RSV

        if version != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        let dest_addr = AddrSpec::read_from(reader).await?;

        Ok(Self {
            version,
            command,
            dest_addr,
        })
    }
}

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client. A missing bound address is sent as 0.0.0.0:0
pub async fn send_reply<W>(
    writer: &mut W,
    reply_code: ReplyCode,
    bound_addr: Option<&AddrSpec>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];

    match bound_addr {
        Some(addr) => addr.write_into(&mut reply)?,
        None => AddrSpec::unspecified().write_into(&mut reply)?,
    }

    writer.write_all(&reply).await?;
    Ok(())
}
