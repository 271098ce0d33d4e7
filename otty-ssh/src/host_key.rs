use std::fmt::Write as _;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

/// Server host key captured after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    algorithm: String,
    key: Vec<u8>,
    sha1: Option<Vec<u8>>,
    sha256: Option<Vec<u8>>,
}

impl HostKey {
    pub fn new(
        algorithm: impl Into<String>,
        key: Vec<u8>,
        sha1: Option<Vec<u8>>,
        sha256: Option<Vec<u8>>,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            key,
            sha1,
            sha256,
        }
    }

    /// Key algorithm name, e.g. `ssh-ed25519`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw public key blob.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn sha1(&self) -> Option<&[u8]> {
        self.sha1.as_deref()
    }

    pub fn sha256(&self) -> Option<&[u8]> {
        self.sha256.as_deref()
    }

    /// SHA-1 digest as colon separated upper-case hex (`AB:CD:...`).
    pub fn sha1_hex(&self) -> Option<String> {
        let digest = self.sha1.as_deref()?;
        let mut out = String::with_capacity(digest.len() * 3);
        for (idx, byte) in digest.iter().enumerate() {
            if idx > 0 {
                out.push(':');
            }
            let _ = write!(out, "{byte:02X}");
        }
        Some(out)
    }

    /// OpenSSH style fingerprint (`SHA256:<base64 without padding>`).
    pub fn sha256_fingerprint(&self) -> Option<String> {
        let digest = self.sha256.as_deref()?;
        Some(format!(
            "SHA256:{}",
            BASE64.encode(digest).trim_end_matches('=')
        ))
    }
}
