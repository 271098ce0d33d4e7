use std::fmt;

use flume::Receiver;

/// Lifecycle phase of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    Connecting,
    Handshaking,
    /// Handshake done; waiting for `negotiate`.
    Preauth,
    /// Asking the server which mechanisms it accepts.
    Negotiating,
    AuthenticationRequired,
    Connected,
    Error,
}

impl Phase {
    /// Phases in which no session state is held.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Disconnected | Phase::Error)
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Handshaking => "handshaking",
            Phase::Preauth => "preauth",
            Phase::Negotiating => "negotiating",
            Phase::AuthenticationRequired => "authentication-required",
            Phase::Connected => "connected",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Notification emitted once per real phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub old: Phase,
    pub new: Phase,
}

/// Subscription to the phase changes of one connection.
pub struct PhaseEvents {
    receiver: Receiver<PhaseChange>,
}

impl PhaseEvents {
    pub(crate) fn new(receiver: Receiver<PhaseChange>) -> Self {
        Self { receiver }
    }

    /// Next change without waiting.
    pub fn try_recv(&self) -> Option<PhaseChange> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next change; `None` once the connection is gone.
    pub fn recv(&self) -> Option<PhaseChange> {
        self.receiver.recv().ok()
    }

    pub async fn recv_async(&self) -> Option<PhaseChange> {
        self.receiver.recv_async().await.ok()
    }

    /// Every change queued so far.
    pub fn drain(&self) -> Vec<PhaseChange> {
        self.receiver.try_iter().collect()
    }
}
