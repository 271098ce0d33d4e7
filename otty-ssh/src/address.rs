use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 22;

/// Host and port of an SSH server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to the first socket address. Name lookup blocks.
    pub(crate) fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| Error::Resolve(format!("{self}: {err}")))?;
        addrs.next().ok_or_else(|| Error::Resolve(self.to_string()))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = || Error::AddressParsing(input.to_owned());

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)
                    .ok_or_else(invalid)?,
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(host, port));
        }

        let (host, port) = match input.split_once(':') {
            // Bare IPv6 literal without brackets.
            Some((_, rest)) if rest.contains(':') => (input, DEFAULT_PORT),
            Some((host, port)) => (host, parse_port(port).ok_or_else(invalid)?),
            None => (input, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse::<u16>().ok().filter(|port| *port != 0)
}

/// `[user@]host[:port]` as typed on a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub address: Address,
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.rsplit_once('@') {
            Some(("", _)) => Err(Error::AddressParsing(input.to_owned())),
            Some((user, host)) => Ok(Self {
                user: Some(user.to_owned()),
                address: host.parse()?,
            }),
            None => Ok(Self {
                user: None,
                address: input.parse()?,
            }),
        }
    }
}
