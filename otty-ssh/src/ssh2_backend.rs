//! libssh2-backed implementation of the session adapter.

use std::io::{self, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::task::Poll;

use mio::net::TcpStream;
use secrecy::ExposeSecret;
use ssh2::{
    Agent, BlockDirections, Channel, Error as SshError, ErrorCode,
    ExtendedData, HashType, HostKeyType, KeyboardInteractivePrompt, Prompt,
    PublicKey, Session,
};

use crate::auth::{AuthMechanism, AuthOutcome};
use crate::credentials::{CredentialPrompt, PromptField};
use crate::error::{Error, Result};
use crate::host_key::HostKey;
use crate::options::ConnectionOptions;
use crate::session::{
    AuthList, ChannelAdapter, Directions, SessionAdapter, SessionFactory,
};
use crate::size::PtySize;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_AGENT_PROTOCOL: i32 = -42;

/// Builds [`Ssh2Session`]s on a duplicate of the connection socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Factory;

impl SessionFactory for Ssh2Factory {
    fn create(
        &mut self,
        socket: &TcpStream,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn SessionAdapter>> {
        let fd = socket.as_fd().try_clone_to_owned()?;
        let stream = StdTcpStream::from(fd);

        let mut session = Session::new()
            .map_err(|err| protocol("failed to create ssh session", &err))?;
        session.set_tcp_stream(stream);
        session.set_blocking(false);
        session
            .set_banner(&options.banner)
            .map_err(|err| protocol("failed to set banner", &err))?;

        Ok(Box::new(Ssh2Session {
            session,
            use_agent: options.use_agent,
            identity_files: options.identity_files.clone(),
            identities: None,
        }))
    }
}

/// Non-blocking libssh2 session.
pub struct Ssh2Session {
    session: Session,
    use_agent: bool,
    identity_files: Vec<PathBuf>,
    identities: Option<IdentityCursor>,
}

/// Progress through the keys offered during one public key attempt.
struct IdentityCursor {
    agent: Option<Agent>,
    agent_keys: Vec<PublicKey>,
    next_agent_key: usize,
    next_file: usize,
}

impl IdentityCursor {
    fn discover(session: &Session, use_agent: bool) -> Self {
        let mut cursor = Self {
            agent: None,
            agent_keys: Vec::new(),
            next_agent_key: 0,
            next_file: 0,
        };
        if !use_agent {
            return cursor;
        }

        match Self::agent_keys(session) {
            Ok((agent, keys)) => {
                log::debug!("ssh-agent offers {} identities", keys.len());
                cursor.agent = Some(agent);
                cursor.agent_keys = keys;
            },
            Err(err) => log::debug!("ssh-agent unavailable: {err}"),
        }
        cursor
    }

    fn agent_keys(
        session: &Session,
    ) -> std::result::Result<(Agent, Vec<PublicKey>), SshError> {
        let mut agent = session.agent()?;
        agent.connect()?;
        agent.list_identities()?;
        let keys = agent.identities()?;
        Ok((agent, keys))
    }
}

impl Ssh2Session {
    fn try_identities(
        &mut self,
        cursor: &mut IdentityCursor,
        username: &str,
    ) -> Poll<Result<AuthOutcome>> {
        loop {
            let agent_key = cursor.agent_keys.get(cursor.next_agent_key);
            let attempt = if let (Some(agent), Some(key)) =
                (cursor.agent.as_ref(), agent_key)
            {
                let result = agent.userauth(username, key);
                if !matches!(&result, Err(err) if is_would_block(err)) {
                    cursor.next_agent_key += 1;
                }
                result
            } else if let Some(path) =
                self.identity_files.get(cursor.next_file)
            {
                if !path.exists() {
                    cursor.next_file += 1;
                    continue;
                }
                let result =
                    self.session
                        .userauth_pubkey_file(username, None, path, None);
                if !matches!(&result, Err(err) if is_would_block(err)) {
                    cursor.next_file += 1;
                }
                result
            } else {
                return Poll::Ready(Ok(AuthOutcome::Denied));
            };

            match attempt {
                Ok(()) => return Poll::Ready(Ok(self.outcome())),
                Err(err) if is_would_block(&err) => return Poll::Pending,
                Err(err) if is_key_rejected(&err) => {
                    log::debug!("identity rejected: {}", err.message());
                },
                Err(err) => {
                    return Poll::Ready(Err(protocol(
                        "public key authentication failed",
                        &err,
                    )));
                },
            }
        }
    }

    /// Success as seen by libssh2: an accepted method that did not
    /// authenticate the session was a partial success.
    fn outcome(&self) -> AuthOutcome {
        if self.session.authenticated() {
            AuthOutcome::Success
        } else {
            AuthOutcome::Partial
        }
    }
}

impl SessionAdapter for Ssh2Session {
    fn handshake(&mut self) -> Poll<Result<()>> {
        poll_unit(self.session.handshake(), "handshake failed")
    }

    fn host_key(&self) -> Option<HostKey> {
        let (key, kind) = self.session.host_key()?;
        let digest =
            |hash| self.session.host_key_hash(hash).map(<[u8]>::to_vec);
        Some(HostKey::new(
            algorithm_name(kind),
            key.to_vec(),
            digest(HashType::Sha1),
            digest(HashType::Sha256),
        ))
    }

    fn auth_list(&mut self, username: &str) -> Poll<Result<AuthList>> {
        let listed = self
            .session
            .auth_methods(username)
            .map(AuthMechanism::parse_list);

        // libssh2 reports "none" acceptance as an empty answer.
        if self.session.authenticated() {
            return Poll::Ready(Ok(AuthList::Authenticated));
        }

        match listed {
            Ok(mechanisms) => Poll::Ready(Ok(AuthList::Mechanisms(mechanisms))),
            Err(err) if is_would_block(&err) => Poll::Pending,
            Err(err) => Poll::Ready(Err(protocol(
                "failed to list authentication methods",
                &err,
            ))),
        }
    }

    fn auth_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Poll<Result<AuthOutcome>> {
        match self.session.userauth_password(username, password) {
            Ok(()) => Poll::Ready(Ok(self.outcome())),
            Err(err) if is_would_block(&err) => Poll::Pending,
            Err(err)
                if session_code(&err)
                    == Some(LIBSSH2_ERROR_PASSWORD_EXPIRED) =>
            {
                log::warn!("password expired for {username}");
                Poll::Ready(Ok(AuthOutcome::Denied))
            },
            Err(err)
                if session_code(&err)
                    == Some(LIBSSH2_ERROR_AUTHENTICATION_FAILED) =>
            {
                Poll::Ready(Ok(AuthOutcome::Denied))
            },
            Err(err) => Poll::Ready(Err(protocol(
                "password authentication failed",
                &err,
            ))),
        }
    }

    fn auth_publickey(&mut self, username: &str) -> Poll<Result<AuthOutcome>> {
        let mut cursor = match self.identities.take() {
            Some(cursor) => cursor,
            None => IdentityCursor::discover(&self.session, self.use_agent),
        };

        let poll = self.try_identities(&mut cursor, username);
        if poll.is_pending() {
            self.identities = Some(cursor);
        }
        poll
    }

    fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        prompt: &mut dyn CredentialPrompt,
    ) -> Poll<Result<AuthOutcome>> {
        let mut responder = Responder {
            prompt,
            declined: false,
        };
        let result = self
            .session
            .userauth_keyboard_interactive(username, &mut responder);

        match result {
            Ok(()) => Poll::Ready(Ok(self.outcome())),
            Err(err) if is_would_block(&err) => Poll::Pending,
            Err(_) if responder.declined => Poll::Ready(Err(Error::Cancelled)),
            Err(err) if is_key_rejected(&err) => {
                Poll::Ready(Ok(AuthOutcome::Denied))
            },
            Err(err) => Poll::Ready(Err(protocol(
                "keyboard-interactive authentication failed",
                &err,
            ))),
        }
    }

    fn auth_gssapi(&mut self, _username: &str) -> Poll<Result<AuthOutcome>> {
        Poll::Ready(Err(Error::UnsupportedMechanism(AuthMechanism::GssapiMic)))
    }

    fn open_session(&mut self) -> Poll<Result<Box<dyn ChannelAdapter>>> {
        match self.session.channel_session() {
            Ok(mut channel) => {
                let merged = channel.handle_extended_data(ExtendedData::Merge);
                if let Err(err) = merged {
                    log::warn!("failed to merge stderr: {}", err.message());
                }
                Poll::Ready(Ok(Box::new(Ssh2Channel {
                    channel,
                    resizing: None,
                })))
            },
            Err(err) if is_would_block(&err) => Poll::Pending,
            Err(err) => Poll::Ready(Err(protocol(
                "failed to open session channel",
                &err,
            ))),
        }
    }

    fn block_directions(&self) -> Directions {
        match self.session.block_directions() {
            BlockDirections::None => Directions::None,
            BlockDirections::Inbound => Directions::Inbound,
            BlockDirections::Outbound => Directions::Outbound,
            BlockDirections::Both => Directions::Both,
        }
    }
}

/// Bridges libssh2 keyboard-interactive callbacks to a [`CredentialPrompt`].
struct Responder<'a> {
    prompt: &'a mut dyn CredentialPrompt,
    declined: bool,
}

impl KeyboardInteractivePrompt for Responder<'_> {
    fn prompt<'b>(
        &mut self,
        username: &str,
        instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        let fields: Vec<PromptField> = prompts
            .iter()
            .map(|p| PromptField {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();

        match self
            .prompt
            .keyboard_interactive(username, instructions, &fields)
        {
            Some(answers) => answers
                .iter()
                .map(|answer| answer.expose_secret().to_owned())
                .collect(),
            None => {
                self.declined = true;
                Vec::new()
            },
        }
    }
}

/// Non-blocking libssh2 channel.
pub struct Ssh2Channel {
    channel: Channel,
    /// Geometry of the window-change request libssh2 is still sending.
    resizing: Option<PtySize>,
}

impl ChannelAdapter for Ssh2Channel {
    fn request_pty(&mut self, term: &str, size: PtySize) -> Poll<Result<()>> {
        let dim = (
            u32::from(size.cols),
            u32::from(size.rows),
            size.pixel_width(),
            size.pixel_height(),
        );
        poll_unit(
            self.channel.request_pty(term, None, Some(dim)),
            "pty request rejected",
        )
    }

    fn shell(&mut self) -> Poll<Result<()>> {
        poll_unit(self.channel.shell(), "failed to start shell")
    }

    fn exec(&mut self, command: &str) -> Poll<Result<()>> {
        poll_unit(self.channel.exec(command), "failed to execute command")
    }

    fn read(&mut self, buf: &mut [u8]) -> Poll<Result<usize>> {
        poll_io(self.channel.read(buf))
    }

    fn write(&mut self, data: &[u8]) -> Poll<Result<usize>> {
        poll_io(self.channel.write(data))
    }

    fn send_eof(&mut self) -> Poll<Result<()>> {
        poll_unit(self.channel.send_eof(), "failed to send eof")
    }

    fn is_remote_eof(&self) -> bool {
        self.channel.eof()
    }

    fn resize_pty(&mut self, size: PtySize) -> Poll<Result<()>> {
        // libssh2 finishes a started request with its original geometry,
        // so a newer size is sent once that one is through.
        loop {
            let sending = *self.resizing.get_or_insert(size);
            let sent = poll_unit(
                self.channel.request_pty_size(
                    u32::from(sending.cols),
                    u32::from(sending.rows),
                    Some(sending.pixel_width()),
                    Some(sending.pixel_height()),
                ),
                "failed to resize pty",
            );
            match sent {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) if sending != size => {
                    self.resizing = None;
                },
                Poll::Ready(result) => {
                    self.resizing = None;
                    return Poll::Ready(result);
                },
            }
        }
    }

    fn exit_status(&self) -> Option<i32> {
        if !self.channel.eof() {
            return None;
        }
        self.channel.exit_status().ok()
    }
}

fn poll_unit(
    result: std::result::Result<(), SshError>,
    context: &'static str,
) -> Poll<Result<()>> {
    match result {
        Ok(()) => Poll::Ready(Ok(())),
        Err(err) if is_would_block(&err) => Poll::Pending,
        Err(err) => Poll::Ready(Err(protocol(context, &err))),
    }
}

fn poll_io(result: io::Result<usize>) -> Poll<Result<usize>> {
    match result {
        Ok(count) => Poll::Ready(Ok(count)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
        Err(err) => Poll::Ready(Err(err.into())),
    }
}

fn protocol(context: &'static str, err: &SshError) -> Error {
    Error::Protocol {
        context,
        message: err.message().to_owned(),
    }
}

fn session_code(err: &SshError) -> Option<i32> {
    match err.code() {
        ErrorCode::Session(code) => Some(code),
        _ => None,
    }
}

/// Check whether a libssh2 error represents a non-blocking retry condition.
fn is_would_block(err: &SshError) -> bool {
    session_code(err) == Some(LIBSSH2_ERROR_EAGAIN)
}

/// The offered credential was refused; the next one may still work.
fn is_key_rejected(err: &SshError) -> bool {
    matches!(
        session_code(err),
        Some(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED
                | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
                | LIBSSH2_ERROR_FILE
                | LIBSSH2_ERROR_AGENT_PROTOCOL
        )
    )
}

fn algorithm_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}
