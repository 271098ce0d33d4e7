//! Seam between the connection engine and the SSH protocol library.
//!
//! Every call is non-blocking: `Poll::Pending` means the library hit
//! would-block and the call must be repeated once the socket is ready in
//! the directions reported by [`SessionAdapter::block_directions`].

use std::task::Poll;

use mio::net::TcpStream;

use crate::auth::{AuthMechanism, AuthOutcome};
use crate::credentials::CredentialPrompt;
use crate::error::Result;
use crate::host_key::HostKey;
use crate::options::ConnectionOptions;
use crate::size::PtySize;

/// Socket directions the protocol library is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directions {
    #[default]
    None,
    Inbound,
    Outbound,
    Both,
}

/// Answer to the mechanism query, which doubles as the `none` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthList {
    /// The server accepted the connection without credentials.
    Authenticated,
    Mechanisms(Vec<AuthMechanism>),
}

/// Transport-level session operations.
pub trait SessionAdapter {
    fn handshake(&mut self) -> Poll<Result<()>>;

    /// Host key negotiated by the last successful handshake.
    fn host_key(&self) -> Option<HostKey>;

    fn auth_list(&mut self, username: &str) -> Poll<Result<AuthList>>;

    fn auth_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Poll<Result<AuthOutcome>>;

    /// Offer the configured identities one after another until one is
    /// accepted or all were denied.
    fn auth_publickey(&mut self, username: &str) -> Poll<Result<AuthOutcome>>;

    fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        prompt: &mut dyn CredentialPrompt,
    ) -> Poll<Result<AuthOutcome>>;

    fn auth_gssapi(&mut self, username: &str) -> Poll<Result<AuthOutcome>>;

    fn open_session(&mut self) -> Poll<Result<Box<dyn ChannelAdapter>>>;

    fn block_directions(&self) -> Directions;
}

/// Operations on a single session channel.
pub trait ChannelAdapter {
    fn request_pty(&mut self, term: &str, size: PtySize) -> Poll<Result<()>>;

    fn shell(&mut self) -> Poll<Result<()>>;

    fn exec(&mut self, command: &str) -> Poll<Result<()>>;

    /// `Ready(Ok(0))` is only end-of-stream when
    /// [`is_remote_eof`](Self::is_remote_eof) agrees.
    fn read(&mut self, buf: &mut [u8]) -> Poll<Result<usize>>;

    fn write(&mut self, data: &[u8]) -> Poll<Result<usize>>;

    fn send_eof(&mut self) -> Poll<Result<()>>;

    fn is_remote_eof(&self) -> bool;

    fn resize_pty(&mut self, size: PtySize) -> Poll<Result<()>>;

    fn exit_status(&self) -> Option<i32>;
}

/// Creates a protocol session on top of a connected socket.
pub trait SessionFactory {
    fn create(
        &mut self,
        socket: &TcpStream,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn SessionAdapter>>;
}
