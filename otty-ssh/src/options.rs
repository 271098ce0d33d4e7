use std::path::PathBuf;
use std::time::Duration;

use crate::size::PtySize;

const DEFAULT_TERM: &str = "xterm-256color";
const DEFAULT_READ_CHUNK: usize = 32 * 1024;
const DEFAULT_BLOCKING_TICK: Duration = Duration::from_millis(100);
const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Knobs that shape how a [`Connection`](crate::Connection) talks to the
/// server.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Identification banner sent during the handshake.
    pub banner: String,
    /// Terminal type advertised with pty requests.
    pub term: String,
    /// Geometry requested for new channels.
    pub pty_size: PtySize,
    /// Request a pty before starting the shell or command.
    pub request_pty: bool,
    /// Upper bound for a single channel read.
    pub read_chunk: usize,
    /// Offer ssh-agent identities during public key authentication.
    pub use_agent: bool,
    /// Private keys offered after the agent identities.
    pub identity_files: Vec<PathBuf>,
    /// Poll timeout used by the blocking stream helpers.
    pub blocking_tick: Duration,
}

impl ConnectionOptions {
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub fn with_pty_size(mut self, size: PtySize) -> Self {
        self.pty_size = size;
        self
    }

    /// Open channels without a pty; resizing them is then rejected.
    pub fn without_pty(mut self) -> Self {
        self.request_pty = false;
        self
    }

    pub fn with_agent(mut self, use_agent: bool) -> Self {
        self.use_agent = use_agent;
        self
    }

    pub fn with_identity_files(mut self, files: Vec<PathBuf>) -> Self {
        self.identity_files = files;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            banner: format!("SSH-2.0-otty_ssh_{}", env!("CARGO_PKG_VERSION")),
            term: DEFAULT_TERM.to_owned(),
            pty_size: PtySize::default(),
            request_pty: true,
            read_chunk: DEFAULT_READ_CHUNK,
            use_agent: true,
            identity_files: default_identity_files(),
            blocking_tick: DEFAULT_BLOCKING_TICK,
        }
    }
}

/// Conventional key locations under `~/.ssh`.
fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };

    let ssh_dir = home.join(".ssh");
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}
