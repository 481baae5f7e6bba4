use crate::protocol::{AddressType, ProtocolError};
use anyhow::{Result, anyhow};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

/// AddrSpec is a destination (or bound) address together with its port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrSpec {
    pub address: Address,
    pub port: u16,
}

impl AddrSpec {
    /// domain builds an AddrSpec for a host name
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            address: Address::Domain(name.into()),
            port,
        }
    }

    /// unspecified is 0.0.0.0:0, sent when a reply carries no bound address
    pub fn unspecified() -> Self {
        Self {
            address: Address::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self.address {
            Address::Ipv4(_) => AddressType::IPv4,
            Address::Domain(_) => AddressType::DomainName,
            Address::Ipv6(_) => AddressType::IPv6,
        }
    }

    /// fqdn returns the host name when the address is a domain
    pub fn fqdn(&self) -> Option<&str> {
        match &self.address {
            Address::Domain(name) => Some(name),
            _ => None,
        }
    }

    /// socket_addr returns the address as a SocketAddr when it is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ipv4(ip) => Some(SocketAddr::new(IpAddr::V4(ip), self.port)),
            Address::Ipv6(ip) => Some(SocketAddr::new(IpAddr::V6(ip), self.port)),
            Address::Domain(_) => None,
        }
    }

    /// read_from parses ATYP, DST.ADDR and DST.PORT from a request stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // Read address type byte from stream
        let mut atype = [0u8; 1];
        reader.read_exact(&mut atype).await?;

        let address = match AddressType::from_byte(atype[0]) {
            Some(AddressType::IPv4) => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                Address::Ipv4(Ipv4Addr::from(addr))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;

                let mut domain = vec![0u8; len[0] as usize];
                reader.read_exact(&mut domain).await?;
                Address::Domain(String::from_utf8(domain)?)
            }
            Some(AddressType::IPv6) => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                Address::Ipv6(Ipv6Addr::from(addr))
            }
            None => return Err(ProtocolError::UnrecognizedAddrType(atype[0]).into()),
        };

        // Read port -> BigEndian (network order)
        let mut port_buf = [0u8; 2];
        reader.read_exact(&mut port_buf).await?;
        let port = u16::from_be_bytes(port_buf);

        Ok(Self { address, port })
    }

    /// write_into appends ATYP, ADDR and PORT to a frame under construction
    pub fn write_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.address_type() as u8);
        match &self.address {
            Address::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Domain(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| anyhow!("domain name too long: {} bytes", name.len()))?;
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

impl From<SocketAddr> for AddrSpec {
    fn from(addr: SocketAddr) -> Self {
        let address = match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip),
            IpAddr::V6(ip) => Address::Ipv6(ip),
        };
        Self {
            address,
            port: addr.port(),
        }
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            Address::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            Address::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}
