//! Scripted protocol backend and harness for exercising the engine
//! without a server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use mio::net::TcpStream;
use secrecy::ExposeSecret;

use crate::address::Address;
use crate::auth::{AuthMechanism, AuthOutcome};
use crate::channel::Channel;
use crate::connection::{ChannelKind, Connection, Phase, PhaseEvents};
use crate::credentials::{CredentialPrompt, PromptField};
use crate::error::{Error, Result};
use crate::host_key::HostKey;
use crate::options::ConnectionOptions;
use crate::runtime::{Readiness, Runtime};
use crate::session::{
    AuthList, ChannelAdapter, Directions, SessionAdapter, SessionFactory,
};
use crate::size::PtySize;

const TICK: Duration = Duration::from_millis(10);
const MAX_TURNS: usize = 500;

/// Behaviour of the fake server, editable between operations.
#[derive(Default)]
pub(crate) struct Script {
    pub handshake_blocks: usize,
    pub handshake_error: Option<Error>,
    pub host_key: Option<HostKey>,
    pub none_accepted: bool,
    pub mechanisms: Vec<AuthMechanism>,
    pub password: Option<String>,
    pub publickey_accepted: bool,
    /// Accepted mechanisms that only count as one factor of several.
    pub partial: Vec<AuthMechanism>,
    pub auth_blocked: bool,
    pub open_blocked: bool,
    pub pty_error: Option<Error>,
    pub directions: Directions,

    pub sessions: usize,
    pub attempts: Vec<AuthMechanism>,
    pub channels: Vec<Rc<RefCell<FakeChannel>>>,
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    pub pty: Option<(String, PtySize)>,
    pub started: Option<ChannelKind>,
    pub incoming: VecDeque<u8>,
    pub written: Vec<u8>,
    pub write_limit: Option<usize>,
    pub write_blocked: bool,
    pub eof_blocked: bool,
    pub eof_sent: bool,
    pub remote_eof: bool,
    pub resize_blocked: bool,
    pub resizes: Vec<(u16, u16)>,
    pub exit_status: Option<i32>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    script: Rc<RefCell<Script>>,
}

impl FakeServer {
    pub fn new(configure: impl FnOnce(&mut Script)) -> Self {
        let server = Self::default();
        configure(&mut server.script.borrow_mut());
        server
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.borrow_mut())
    }

    pub fn channel(&self, index: usize) -> Rc<RefCell<FakeChannel>> {
        Rc::clone(&self.script.borrow().channels[index])
    }
}

impl SessionFactory for FakeServer {
    fn create(
        &mut self,
        _socket: &TcpStream,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn SessionAdapter>> {
        self.script.borrow_mut().sessions += 1;
        Ok(Box::new(FakeSession {
            script: Rc::clone(&self.script),
        }))
    }
}

struct FakeSession {
    script: Rc<RefCell<Script>>,
}

impl FakeSession {
    fn resolve(
        &self,
        mechanism: AuthMechanism,
        accepted: bool,
    ) -> Poll<Result<AuthOutcome>> {
        let mut script = self.script.borrow_mut();
        if script.auth_blocked {
            return Poll::Pending;
        }
        let outcome = if !accepted {
            AuthOutcome::Denied
        } else if script.partial.contains(&mechanism) {
            AuthOutcome::Partial
        } else {
            AuthOutcome::Success
        };
        script.attempts.push(mechanism);
        Poll::Ready(Ok(outcome))
    }
}

impl SessionAdapter for FakeSession {
    fn handshake(&mut self) -> Poll<Result<()>> {
        let mut script = self.script.borrow_mut();
        if script.handshake_blocks > 0 {
            script.handshake_blocks -= 1;
            return Poll::Pending;
        }
        match script.handshake_error.take() {
            Some(err) => Poll::Ready(Err(err)),
            None => Poll::Ready(Ok(())),
        }
    }

    fn host_key(&self) -> Option<HostKey> {
        self.script.borrow().host_key.clone()
    }

    fn auth_list(&mut self, _username: &str) -> Poll<Result<AuthList>> {
        let script = self.script.borrow();
        Poll::Ready(Ok(if script.none_accepted {
            AuthList::Authenticated
        } else {
            AuthList::Mechanisms(script.mechanisms.clone())
        }))
    }

    fn auth_password(
        &mut self,
        _username: &str,
        password: &str,
    ) -> Poll<Result<AuthOutcome>> {
        let accepted =
            self.script.borrow().password.as_deref() == Some(password);
        self.resolve(AuthMechanism::Password, accepted)
    }

    fn auth_publickey(&mut self, _username: &str) -> Poll<Result<AuthOutcome>> {
        let accepted = self.script.borrow().publickey_accepted;
        self.resolve(AuthMechanism::PublicKey, accepted)
    }

    fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        prompt: &mut dyn CredentialPrompt,
    ) -> Poll<Result<AuthOutcome>> {
        let fields = [PromptField {
            text: "Password: ".into(),
            echo: false,
        }];
        let Some(answers) = prompt.keyboard_interactive(username, "", &fields)
        else {
            return Poll::Ready(Err(Error::Cancelled));
        };

        let expected = self.script.borrow().password.clone();
        let accepted = answers.first().map(|a| a.expose_secret().to_owned())
            == expected;
        self.resolve(AuthMechanism::KeyboardInteractive, accepted)
    }

    fn auth_gssapi(&mut self, _username: &str) -> Poll<Result<AuthOutcome>> {
        Poll::Ready(Err(Error::UnsupportedMechanism(AuthMechanism::GssapiMic)))
    }

    fn open_session(&mut self) -> Poll<Result<Box<dyn ChannelAdapter>>> {
        let mut script = self.script.borrow_mut();
        if script.open_blocked {
            return Poll::Pending;
        }
        let state = Rc::new(RefCell::new(FakeChannel::default()));
        script.channels.push(Rc::clone(&state));
        Poll::Ready(Ok(Box::new(FakeChannelHandle {
            script: Rc::clone(&self.script),
            state,
        })))
    }

    fn block_directions(&self) -> Directions {
        self.script.borrow().directions
    }
}

struct FakeChannelHandle {
    script: Rc<RefCell<Script>>,
    state: Rc<RefCell<FakeChannel>>,
}

impl ChannelAdapter for FakeChannelHandle {
    fn request_pty(&mut self, term: &str, size: PtySize) -> Poll<Result<()>> {
        if let Some(err) = self.script.borrow_mut().pty_error.take() {
            return Poll::Ready(Err(err));
        }
        self.state.borrow_mut().pty = Some((term.to_owned(), size));
        Poll::Ready(Ok(()))
    }

    fn shell(&mut self) -> Poll<Result<()>> {
        self.state.borrow_mut().started = Some(ChannelKind::Shell);
        Poll::Ready(Ok(()))
    }

    fn exec(&mut self, command: &str) -> Poll<Result<()>> {
        self.state.borrow_mut().started =
            Some(ChannelKind::Exec(command.to_owned()));
        Poll::Ready(Ok(()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Poll<Result<usize>> {
        let mut state = self.state.borrow_mut();
        if state.incoming.is_empty() {
            return if state.remote_eof {
                Poll::Ready(Ok(0))
            } else {
                Poll::Pending
            };
        }

        let count = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        Poll::Ready(Ok(count))
    }

    fn write(&mut self, data: &[u8]) -> Poll<Result<usize>> {
        let mut state = self.state.borrow_mut();
        if state.write_blocked {
            return Poll::Pending;
        }
        let count = data.len().min(state.write_limit.unwrap_or(usize::MAX));
        state.written.extend_from_slice(&data[..count]);
        Poll::Ready(Ok(count))
    }

    fn send_eof(&mut self) -> Poll<Result<()>> {
        let mut state = self.state.borrow_mut();
        if state.eof_blocked {
            return Poll::Pending;
        }
        state.eof_sent = true;
        Poll::Ready(Ok(()))
    }

    fn is_remote_eof(&self) -> bool {
        let state = self.state.borrow();
        state.remote_eof && state.incoming.is_empty()
    }

    fn resize_pty(&mut self, size: PtySize) -> Poll<Result<()>> {
        let mut state = self.state.borrow_mut();
        if state.resize_blocked {
            return Poll::Pending;
        }
        state.resizes.push((size.cols, size.rows));
        Poll::Ready(Ok(()))
    }

    fn exit_status(&self) -> Option<i32> {
        self.state.borrow().exit_status
    }
}

/// Capture the result of an asynchronous operation.
pub(crate) fn capture<T: 'static>()
-> (Rc<RefCell<Option<T>>>, impl FnOnce(T) + 'static) {
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    (slot, move |value| *sink.borrow_mut() = Some(value))
}

/// Take a captured result, failing the test if it has not arrived.
pub(crate) fn take<T>(slot: &Rc<RefCell<Option<T>>>) -> T {
    slot.borrow_mut().take().expect("operation should have resolved")
}

/// Runtime, loopback listener and a connection wired to a [`FakeServer`].
pub(crate) struct Harness {
    pub runtime: Runtime,
    pub server: FakeServer,
    pub connection: Connection,
    pub events: PhaseEvents,
    pub address: Address,
    _listener: TcpListener,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut Script)) -> anyhow::Result<Self> {
        Self::with_options(
            ConnectionOptions::default().with_agent(false),
            configure,
        )
    }

    pub fn with_options(
        options: ConnectionOptions,
        configure: impl FnOnce(&mut Script),
    ) -> anyhow::Result<Self> {
        let runtime = Runtime::new()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = Address::new("127.0.0.1", listener.local_addr()?.port());
        let server = FakeServer::new(configure);
        let connection =
            Connection::with_factory(
                &runtime.handle(),
                options,
                server.clone(),
            );
        let events = connection.subscribe();

        Ok(Self {
            runtime,
            server,
            connection,
            events,
            address,
            _listener: listener,
        })
    }

    /// Harness already authenticated through "none".
    pub fn connected(
        configure: impl FnOnce(&mut Script),
    ) -> anyhow::Result<Self> {
        Self::connected_with(
            ConnectionOptions::default().with_agent(false),
            configure,
        )
    }

    pub fn connected_with(
        options: ConnectionOptions,
        configure: impl FnOnce(&mut Script),
    ) -> anyhow::Result<Self> {
        let mut harness = Self::with_options(options, |script| {
            script.none_accepted = true;
            configure(script);
        })?;
        harness.connect()?;
        let phase = harness.negotiate()?;
        anyhow::ensure!(phase == Phase::Connected, "unexpected phase {phase}");
        Ok(harness)
    }

    pub fn turn_until<F>(&mut self, what: &str, done: F) -> anyhow::Result<()>
    where
        F: Fn() -> bool,
    {
        for _ in 0..MAX_TURNS {
            if done() {
                return Ok(());
            }
            // The scripted backend never talks on the wire, so a quiet
            // tick pumps the connection the way a blocking wait does.
            if self.runtime.turn(Some(TICK))? == 0 {
                self.connection
                    .on_ready(Readiness::READABLE | Readiness::WRITABLE);
            }
        }
        anyhow::bail!("timed out waiting for {what}")
    }

    pub fn connect(&mut self) -> anyhow::Result<()> {
        let (result, callback) = capture::<Result<()>>();
        self.connection
            .connect(self.address.clone(), "alice", None, callback)?;
        self.turn_until("handshake", || result.borrow().is_some())?;
        take(&result)?;
        Ok(())
    }

    pub fn negotiate(&mut self) -> anyhow::Result<Phase> {
        let (result, callback) = capture::<Result<Phase>>();
        self.connection.negotiate(None, callback)?;
        self.turn_until("negotiation", || result.borrow().is_some())?;
        Ok(take(&result)?)
    }

    pub fn authenticate(
        &mut self,
        mechanism: AuthMechanism,
    ) -> anyhow::Result<Result<AuthOutcome>> {
        let (result, callback) = capture::<Result<AuthOutcome>>();
        self.connection.authenticate(mechanism, None, callback)?;
        self.turn_until("authentication", || result.borrow().is_some())?;
        Ok(take(&result))
    }

    pub fn open(&mut self, kind: ChannelKind) -> anyhow::Result<Channel> {
        let (result, callback) = capture::<Result<Channel>>();
        self.connection.open_channel(kind, None, callback)?;
        self.turn_until("channel open", || result.borrow().is_some())?;
        Ok(take(&result)?)
    }
}
