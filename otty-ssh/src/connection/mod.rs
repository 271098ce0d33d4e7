//! Client-side SSH connection state machine.

mod auth;
mod driver;
mod open;
mod phase;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use flume::Sender;
use mio::Interest;
use mio::net::TcpStream;
use secrecy::SecretString;

use crate::address::Address;
use crate::auth::{AuthMechanism, AuthOutcome};
use crate::cancel::Cancellable;
use crate::channel::{Channel, ChannelInner};
use crate::credentials::CredentialPrompt;
use crate::error::{Error, Result};
use crate::host_key::HostKey;
use crate::options::ConnectionOptions;
use crate::runtime::{Readiness, ReadyHandler, RuntimeHandle};
use crate::session::{ChannelAdapter, SessionAdapter, SessionFactory};
use crate::ssh2_backend::Ssh2Factory;
use crate::task::{Completions, Task, reap_cancelled};
use crate::watcher::SocketWatcher;

use self::auth::AuthRequest;
use self::open::OpenRequest;

pub(crate) use self::driver::{drive, wait_for};
pub use self::open::ChannelKind;
pub use self::phase::{Phase, PhaseChange, PhaseEvents};

pub(crate) type WeakConnection = Weak<RefCell<ConnectionInner>>;

/// Client side of one SSH connection.
///
/// A connection walks through [`Phase`]s: `connect` establishes TCP and
/// runs the handshake, `negotiate` asks which mechanisms the server
/// accepts, `authenticate` tries one of them, and once connected
/// `open_channel` starts shells and commands. Every operation is
/// asynchronous: it returns right away and its callback runs from a later
/// pump of the connection (a [`Runtime::turn`](crate::Runtime::turn) or an
/// explicit [`on_ready`](Self::on_ready)).
///
/// Handles are cheap to clone and all refer to the same connection. The
/// connection is single-threaded and callbacks must not outlive the
/// runtime thread.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnectionInner>>,
}

pub(crate) struct ConnectionInner {
    this: WeakConnection,
    runtime: RuntimeHandle,
    options: ConnectionOptions,
    factory: Box<dyn SessionFactory>,
    credentials: Option<Box<dyn CredentialPrompt>>,

    phase: Phase,
    address: Option<Address>,
    username: String,
    socket: Option<SocketWatcher>,
    session: Option<Box<dyn SessionAdapter>>,
    host_key: Option<HostKey>,
    mechanisms: Vec<AuthMechanism>,

    handshake: Option<Task<()>>,
    negotiate: Option<Task<Phase>>,
    auth: Option<AuthRequest>,
    opens: Vec<OpenRequest>,
    channels: Vec<Weak<RefCell<ChannelInner>>>,
    next_channel_id: u64,

    cached_error: Option<Error>,
    observers: Vec<Sender<PhaseChange>>,
    completions: Completions,
    driving: bool,
    rerun: Option<Readiness>,
    blocking: bool,
}

impl Connection {
    /// Connection backed by libssh2 with default options.
    pub fn new(runtime: &RuntimeHandle) -> Self {
        Self::with_options(runtime, ConnectionOptions::default())
    }

    pub fn with_options(
        runtime: &RuntimeHandle,
        options: ConnectionOptions,
    ) -> Self {
        Self::with_factory(runtime, options, Ssh2Factory)
    }

    /// Connection backed by a custom protocol library.
    pub fn with_factory<F>(
        runtime: &RuntimeHandle,
        options: ConnectionOptions,
        factory: F,
    ) -> Self
    where
        F: SessionFactory + 'static,
    {
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(ConnectionInner {
                this: this.clone(),
                runtime: runtime.clone(),
                options,
                factory: Box::new(factory),
                credentials: None,
                phase: Phase::Disconnected,
                address: None,
                username: String::new(),
                socket: None,
                session: None,
                host_key: None,
                mechanisms: Vec::new(),
                handshake: None,
                negotiate: None,
                auth: None,
                opens: Vec::new(),
                channels: Vec::new(),
                next_channel_id: 0,
                cached_error: None,
                observers: Vec::new(),
                completions: Completions::default(),
                driving: false,
                rerun: None,
                blocking: false,
            })
        });

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<ConnectionInner>>) -> Self {
        Self { inner }
    }

    /// Install the collaborator asked for passwords and
    /// keyboard-interactive answers.
    pub fn set_credentials<P>(&self, prompt: P)
    where
        P: CredentialPrompt + 'static,
    {
        self.inner.borrow_mut().credentials = Some(Box::new(prompt));
    }

    pub fn phase(&self) -> Phase {
        self.inner.borrow().phase
    }

    pub fn options(&self) -> ConnectionOptions {
        self.inner.borrow().options.clone()
    }

    /// Receive every subsequent phase change.
    pub fn subscribe(&self) -> PhaseEvents {
        let (sender, receiver) = flume::unbounded();
        self.inner.borrow_mut().observers.push(sender);
        PhaseEvents::new(receiver)
    }

    /// Server host key, known from the end of the handshake until reset.
    pub fn host_key(&self) -> Option<HostKey> {
        self.inner.borrow().host_key.clone()
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.borrow().address.clone()
    }

    pub fn username(&self) -> String {
        self.inner.borrow().username.clone()
    }

    /// Open TCP to `address` and run the SSH handshake. The callback
    /// fires once the handshake finished; the connection then rests in
    /// [`Phase::Preauth`]. A connection that failed must be
    /// [`reset`](Self::reset) before it connects again.
    pub fn connect<F>(
        &self,
        address: Address,
        username: &str,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.reap_cancelled();
        {
            let mut inner = self.inner.borrow_mut();
            let pending = inner.handshake.is_some();
            inner.admit("connect", pending, &[Phase::Disconnected])?;

            inner.username = username.to_owned();
            inner.address = Some(address.clone());
            inner.handshake = Some(Task::new(cancellable, callback));
            inner.transition(Phase::Connecting);
            if let Err(err) = inner.start_socket(&address) {
                inner.take_error(err);
            }
        }

        drive(&self.inner, Readiness::WRITABLE);
        Ok(())
    }

    /// Query the mechanisms the server accepts. Resolves with
    /// [`Phase::Connected`] when the server let the user in without
    /// credentials, otherwise with [`Phase::AuthenticationRequired`].
    pub fn negotiate<F>(
        &self,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Phase>) + 'static,
    {
        self.reap_cancelled();
        {
            let mut inner = self.inner.borrow_mut();
            let pending = inner.negotiate.is_some();
            inner.admit("negotiate", pending, &[Phase::Preauth])?;
            inner.negotiate = Some(Task::new(cancellable, callback));
            inner.transition(Phase::Negotiating);
        }

        drive(&self.inner, Readiness::READABLE | Readiness::WRITABLE);
        Ok(())
    }

    /// Mechanisms offered by the server, in server order.
    pub fn authentication_mechanisms(&self) -> Result<Vec<AuthMechanism>> {
        let mut inner = self.inner.borrow_mut();
        inner.admit(
            "authentication_mechanisms",
            false,
            &[Phase::AuthenticationRequired],
        )?;
        Ok(inner.mechanisms.clone())
    }

    /// Try one mechanism. A denial leaves the connection in
    /// [`Phase::AuthenticationRequired`] so another attempt can follow.
    ///
    /// Password authentication asks the credential prompt up front; a
    /// declined prompt resolves the operation as cancelled.
    pub fn authenticate<F>(
        &self,
        mechanism: AuthMechanism,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<AuthOutcome>) + 'static,
    {
        self.reap_cancelled();
        let password = match mechanism {
            AuthMechanism::Password => match self.ask_password()? {
                Some(password) => Some(password),
                None => {
                    log::debug!("password prompt declined");
                    callback(Err(Error::Cancelled));
                    return Ok(());
                },
            },
            _ => None,
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.admit_auth()?;
            if mechanism == AuthMechanism::KeyboardInteractive
                && inner.credentials.is_none()
            {
                return Err(Error::NoCredentials);
            }

            log::debug!("authenticating {} with {mechanism}", inner.username);
            inner.auth = Some(AuthRequest::new(
                mechanism,
                password,
                Task::new(cancellable, callback),
            ));
        }

        drive(&self.inner, Readiness::READABLE | Readiness::WRITABLE);
        Ok(())
    }

    /// Open a session channel running a shell or a command. Several opens
    /// may be in flight at once.
    pub fn open_channel<F>(
        &self,
        kind: ChannelKind,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Channel>) + 'static,
    {
        self.reap_cancelled();
        {
            let mut inner = self.inner.borrow_mut();
            inner.admit("open_channel", false, &[Phase::Connected])?;
            log::debug!("opening {kind:?} channel");
            inner
                .opens
                .push(OpenRequest::new(kind, Task::new(cancellable, callback)));
        }

        drive(&self.inner, Readiness::READABLE | Readiness::WRITABLE);
        Ok(())
    }

    /// Tear everything down and return to [`Phase::Disconnected`]. Pending
    /// operations resolve with [`Error::Disconnected`] and channels lose
    /// their link to this connection. Allowed from any phase.
    pub fn reset(&self) {
        self.inner.borrow_mut().transition(Phase::Disconnected);
        drive(&self.inner, Readiness::empty());
    }

    /// Feed readiness from a foreign event loop.
    pub fn on_ready(&self, readiness: Readiness) {
        drive(&self.inner, readiness);
    }

    pub fn on_readable(&self) {
        self.on_ready(Readiness::READABLE);
    }

    pub fn on_writable(&self) {
        self.on_ready(Readiness::WRITABLE);
    }

    /// Directions the socket watcher is currently armed for.
    pub fn socket_interest(&self) -> Option<Readiness> {
        let inner = self.inner.borrow();
        let interest = inner.socket.as_ref()?.interest()?;

        let mut readiness = Readiness::empty();
        if interest.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if interest.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        Some(readiness)
    }

    /// How often the socket watcher was (re)armed since connect.
    pub fn socket_rearms(&self) -> usize {
        self.inner
            .borrow()
            .socket
            .as_ref()
            .map_or(0, SocketWatcher::rearms)
    }

    /// Channels still referenced by the caller.
    pub fn channel_count(&self) -> usize {
        self.inner
            .borrow()
            .channels
            .iter()
            .filter(|channel| channel.strong_count() > 0)
            .count()
    }

    fn ask_password(&self) -> Result<Option<SecretString>> {
        let (mut prompt, username, host) = {
            let mut inner = self.inner.borrow_mut();
            inner.admit_auth()?;
            let prompt = inner.credentials.take().ok_or(Error::NoCredentials)?;
            let host = inner
                .address
                .as_ref()
                .map(|address| address.host().to_owned())
                .unwrap_or_default();
            (prompt, inner.username.clone(), host)
        };

        let password = prompt.password(&username, &host);

        let mut inner = self.inner.borrow_mut();
        if inner.credentials.is_none() {
            inner.credentials = Some(prompt);
        }
        Ok(password)
    }

    /// Resolve connection-level operations whose caller gave up, so that
    /// a fresh operation can take their slot.
    fn reap_cancelled(&self) {
        let completions = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            reap_cancelled(&mut inner.handshake, &mut inner.completions);
            reap_cancelled(&mut inner.negotiate, &mut inner.completions);
            if let Some(request) = inner.auth.take_if(|r| r.is_cancelled()) {
                request
                    .into_task()
                    .complete(Err(Error::Cancelled), &mut inner.completions);
            }
            inner.completions.take()
        };

        for completion in completions {
            completion();
        }
    }
}

impl ConnectionInner {
    /// Gate every operation: a cached error is handed out first, then
    /// pending duplicates and wrong phases are refused.
    fn admit(
        &mut self,
        operation: &'static str,
        pending: bool,
        allowed: &[Phase],
    ) -> Result<()> {
        if let Some(error) = self.cached_error.take() {
            return Err(error);
        }
        if pending {
            return Err(Error::AlreadyPending(operation));
        }
        if !allowed.contains(&self.phase) {
            return Err(Error::InvalidState {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn admit_auth(&mut self) -> Result<()> {
        let pending = self.auth.is_some();
        self.admit("authenticate", pending, &[Phase::AuthenticationRequired])
    }

    fn start_socket(&mut self, address: &Address) -> Result<()> {
        let addr = address.resolve()?;
        log::debug!("connecting to {address} ({addr})");

        let stream = TcpStream::connect(addr)?;
        let handler: Weak<dyn ReadyHandler> = self.this.clone();
        let token = self.runtime.add_handler(handler);
        let mut socket =
            SocketWatcher::new(stream, self.runtime.clone(), token);
        socket.arm(Interest::WRITABLE)?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Move to `new`, notifying observers. Entering a terminal phase
    /// releases all session state.
    pub(crate) fn transition(&mut self, new: Phase) {
        let old = self.phase;
        if old == new {
            return;
        }

        log::debug!("ssh connection: {old} => {new}");
        self.phase = new;
        let change = PhaseChange { old, new };
        self.observers.retain(|observer| observer.send(change).is_ok());

        if new.is_terminal() {
            self.reset_state();
        }
    }

    fn reset_state(&mut self) {
        let out = &mut self.completions;
        if let Some(task) = self.handshake.take() {
            task.complete(Err(Error::Disconnected), out);
        }
        if let Some(task) = self.negotiate.take() {
            task.complete(Err(Error::Disconnected), out);
        }
        if let Some(request) = self.auth.take() {
            request.into_task().complete(Err(Error::Disconnected), out);
        }
        for request in self.opens.drain(..) {
            request.into_task().complete(Err(Error::Disconnected), out);
        }
        for channel in self.channels.drain(..) {
            if let Some(channel) = channel.upgrade() {
                channel.borrow_mut().orphan(out);
            }
        }

        self.session = None;
        self.socket = None;
        self.host_key = None;
        self.mechanisms.clear();
        self.cached_error = None;
    }

    /// Route a fatal error: the pending connection-level operation gets
    /// it, otherwise every pending channel operation, otherwise it is
    /// kept for the next operation started. The connection then enters
    /// [`Phase::Error`].
    pub(crate) fn take_error(&mut self, error: Error) {
        if self.phase.is_terminal() {
            log::debug!("dropping error after teardown: {error}");
            return;
        }
        log::warn!("ssh connection failed while {}: {error}", self.phase);

        let out = &mut self.completions;
        let undelivered = if let Some(task) = self.handshake.take() {
            task.complete(Err(error), out);
            None
        } else if let Some(task) = self.negotiate.take() {
            task.complete(Err(error), out);
            None
        } else if let Some(request) = self.auth.take() {
            request.into_task().complete(Err(error), out);
            None
        } else if self.broadcast(&error) > 0 {
            None
        } else {
            Some(error)
        };

        self.transition(Phase::Error);
        self.cached_error = undelivered;
    }

    fn broadcast(&mut self, error: &Error) -> usize {
        let mut delivered = 0;
        for request in self.opens.drain(..) {
            request
                .into_task()
                .complete(Err(error.clone()), &mut self.completions);
            delivered += 1;
        }
        for channel in &self.channels {
            if let Some(channel) = channel.upgrade() {
                delivered += channel
                    .borrow_mut()
                    .fail_pending(error, &mut self.completions);
            }
        }
        delivered
    }

    fn register_channel(
        &mut self,
        native: Box<dyn ChannelAdapter>,
        have_pty: bool,
    ) -> Channel {
        self.next_channel_id += 1;
        let channel = Channel::new(ChannelInner::new(
            self.next_channel_id,
            self.this.clone(),
            native,
            have_pty,
            self.options.pty_size,
        ));
        self.channels.push(channel.downgrade());
        channel
    }

    pub(crate) fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub(crate) fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub(crate) fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.transition(Phase::Disconnected);
        for completion in self.completions.take() {
            completion();
        }
    }
}
