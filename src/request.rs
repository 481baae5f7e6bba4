use crate::AsyncStream;
use crate::address::AddrSpec;
use crate::auth::AuthContext;
use crate::protocol::{Command, ProtocolError, ReplyCode, RequestHeader, send_reply};
use anyhow::{Context, Result, anyhow};
use std::net::{IpAddr, SocketAddr};

/// Request is a validated SOCKS5 request ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    /// Destination as sent by the client (or as rewritten)
    pub dest_addr: AddrSpec,
    /// Destination socket address once an IP is known
    pub resolved_addr: Option<SocketAddr>,
    pub auth_context: AuthContext,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Address BIND and ASSOCIATE handlers should advertise, when the
    /// server was configured with one
    pub bind_ip: Option<IpAddr>,
}

impl Request {
    /// target is the string to dial: the resolved address when known,
    /// otherwise host:port
    pub fn target(&self) -> String {
        match self.resolved_addr {
            Some(addr) => addr.to_string(),
            None => self.dest_addr.to_string(),
        }
    }
}

/// read_request parses the request frame and validates its command.
/// Protocol-level rejections are replied to before the error is returned.
pub async fn read_request(
    stream: &mut dyn AsyncStream,
    auth_context: AuthContext,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
) -> Result<Request> {
    let header = match RequestHeader::parse(stream).await {
        Ok(header) => header,
        Err(e) => {
            if let Some(ProtocolError::UnrecognizedAddrType(_)) =
                e.downcast_ref::<ProtocolError>()
            {
                send_reply(stream, ReplyCode::AddrTypeUnsupported, None)
                    .await
                    .context("failed to send reply")?;
            }
            return Err(e.context("failed to read destination address"));
        }
    };

    let Some(command) = Command::from_byte(header.command) else {
        send_reply(stream, ReplyCode::CommandNotSupported, None)
            .await
            .map_err(|e| anyhow!("failed to send reply, {e}"))?;
        return Err(ProtocolError::UnrecognizedCommand(header.command).into());
    };

    let resolved_addr = header.dest_addr.socket_addr();

    Ok(Request {
        command,
        dest_addr: header.dest_addr,
        resolved_addr,
        auth_context,
        local_addr,
        remote_addr,
        bind_ip: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn no_auth() -> AuthContext {
        AuthContext::default()
    }

    #[tokio::test]
    async fn connect_request_is_stamped() {
        let (mut server, mut client) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();

        let local: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let req = read_request(&mut server, no_auth(), Some(local), Some(remote))
            .await
            .unwrap();

        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.dest_addr.to_string(), "93.184.216.34:80");
        assert_eq!(req.target(), "93.184.216.34:80");
        assert_eq!(req.local_addr, Some(local));
        assert_eq!(req.remote_addr, Some(remote));
    }

    #[tokio::test]
    async fn every_command_and_address_type_round_trips() {
        let ipv6: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let destinations = [
            (
                AddrSpec::from(SocketAddr::from(([10, 0, 0, 1], 8080))),
                vec![0x01, 10, 0, 0, 1, 0x1F, 0x90],
            ),
            (
                AddrSpec::from(SocketAddr::from((ipv6, 8080))),
                [&[0x04][..], &ipv6.octets()[..], &[0x1F, 0x90][..]].concat(),
            ),
            (
                AddrSpec::domain("example.com", 8080),
                [&[0x03, 11][..], &b"example.com"[..], &[0x1F, 0x90][..]].concat(),
            ),
        ];

        for command in [Command::Connect, Command::Bind, Command::Associate] {
            for (dest, encoded) in &destinations {
                let (mut server, mut client) = duplex(64);
                let frame = [&[0x05, command as u8, 0x00][..], &encoded[..]].concat();
                client.write_all(&frame).await.unwrap();

                let req = read_request(&mut server, no_auth(), None, None)
                    .await
                    .unwrap();
                assert_eq!(req.command, command);
                assert_eq!(&req.dest_addr, dest);

                send_reply(&mut server, ReplyCode::Succeeded, Some(&req.dest_addr))
                    .await
                    .unwrap();
                let expected = [&[0x05, 0x00, 0x00][..], &encoded[..]].concat();
                let mut reply = vec![0u8; expected.len()];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(reply, expected, "{command} to {dest}");
            }
        }
    }

    #[tokio::test]
    async fn unknown_command_gets_reply_and_error() {
        let (mut server, mut client) = duplex(64);
        client
            .write_all(&[0x05, 0x04, 0x00, 0x01, 1, 1, 1, 1, 0x00, 0x35])
            .await
            .unwrap();

        let err = read_request(&mut server, no_auth(), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized command[4]"));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn unknown_address_type_gets_reply_before_error() {
        let (mut server, mut client) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 1, 1, 1, 1, 0x00, 0x35])
            .await
            .unwrap();

        let err = read_request(&mut server, no_auth(), None, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnrecognizedAddrType(0x05))
        );

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::AddrTypeUnsupported as u8);
    }

    #[tokio::test]
    async fn truncated_request_is_dropped_without_reply() {
        let (mut server, mut client) = duplex(64);
        client.write_all(&[0x05, 0x01]).await.unwrap();
        client.shutdown().await.unwrap();

        assert!(read_request(&mut server, no_auth(), None, None).await.is_err());
        drop(server);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
