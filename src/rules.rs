use crate::address::AddrSpec;
use crate::protocol::Command;
use crate::request::Request;

/// RuleSet decides whether a request may proceed to its handler
pub trait RuleSet: Send + Sync {
    fn allow(&self, request: &Request) -> bool;
}

/// AddressRewriter can transparently change a request's destination
pub trait AddressRewriter: Send + Sync {
    fn rewrite(&self, request: &Request) -> AddrSpec;
}

/// PermitCommand enables or disables each SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PermitCommand {
    pub enable_connect: bool,
    pub enable_bind: bool,
    pub enable_associate: bool,
}

impl PermitCommand {
    pub fn permit_all() -> Self {
        Self {
            enable_connect: true,
            enable_bind: true,
            enable_associate: true,
        }
    }

    pub fn permit_none() -> Self {
        Self {
            enable_connect: false,
            enable_bind: false,
            enable_associate: false,
        }
    }
}

impl Default for PermitCommand {
    fn default() -> Self {
        Self::permit_all()
    }
}

impl RuleSet for PermitCommand {
    fn allow(&self, request: &Request) -> bool {
        match request.command {
            Command::Connect => self.enable_connect,
            Command::Bind => self.enable_bind,
            Command::Associate => self.enable_associate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;

    fn request(command: Command) -> Request {
        Request {
            command,
            dest_addr: AddrSpec::domain("example.com", 80),
            resolved_addr: None,
            auth_context: AuthContext::default(),
            local_addr: None,
            remote_addr: None,
            bind_ip: None,
        }
    }

    #[test]
    fn permit_all_and_none() {
        for command in [Command::Connect, Command::Bind, Command::Associate] {
            assert!(PermitCommand::permit_all().allow(&request(command)));
            assert!(!PermitCommand::permit_none().allow(&request(command)));
        }
    }

    #[test]
    fn connect_only() {
        let rules = PermitCommand {
            enable_connect: true,
            ..PermitCommand::permit_none()
        };
        assert!(rules.allow(&request(Command::Connect)));
        assert!(!rules.allow(&request(Command::Bind)));
    }
}
