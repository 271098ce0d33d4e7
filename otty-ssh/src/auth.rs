use std::fmt;

/// Authentication mechanism advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    Password,
    PublicKey,
    KeyboardInteractive,
    GssapiMic,
    Other(String),
}

impl AuthMechanism {
    /// Map a wire name such as `publickey` to a mechanism.
    pub fn from_name(name: &str) -> Self {
        match name {
            "password" => Self::Password,
            "publickey" => Self::PublicKey,
            "keyboard-interactive" => Self::KeyboardInteractive,
            "gssapi-with-mic" => Self::GssapiMic,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Password => "password",
            Self::PublicKey => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
            Self::GssapiMic => "gssapi-with-mic",
            Self::Other(name) => name,
        }
    }

    /// Parse a comma separated list, keeping server order and dropping
    /// duplicates.
    pub(crate) fn parse_list(list: &str) -> Vec<Self> {
        let mut mechanisms: Vec<Self> = Vec::new();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let mechanism = Self::from_name(name);
            if !mechanisms.contains(&mechanism) {
                mechanisms.push(mechanism);
            }
        }
        mechanisms
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a completed authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The connection is authenticated.
    Success,
    /// The credentials were rejected; another attempt may follow.
    Denied,
    /// Accepted, but the server requires a further mechanism.
    Partial,
}
