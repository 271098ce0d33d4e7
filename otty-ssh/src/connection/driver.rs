use std::cell::RefCell;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::task::Poll;

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Token};

use super::open::OpenProgress;
use super::{ConnectionInner, Phase};
use crate::auth::AuthOutcome;
use crate::channel::ChannelInner;
use crate::error::{Error, Result};
use crate::runtime::{Readiness, ReadyHandler};
use crate::session::AuthList;
use crate::task::reap_cancelled;
use crate::watcher::interest_for;

const BLOCKING_TOKEN: Token = Token(0);

impl ReadyHandler for RefCell<ConnectionInner> {
    fn on_ready(&self, readiness: Readiness) {
        drive(self, readiness);
    }
}

/// Pump the connection and run every callback that became ready.
///
/// Re-entrant calls (from inside a callback) only record their readiness;
/// the outermost call runs another pass before returning, so callbacks
/// never observe a half-updated connection.
pub(crate) fn drive(
    connection: &RefCell<ConnectionInner>,
    readiness: Readiness,
) {
    {
        let mut inner = connection.borrow_mut();
        if inner.driving {
            inner.rerun = Some(inner.rerun.unwrap_or_default() | readiness);
            return;
        }
        inner.driving = true;
    }

    let mut readiness = readiness;
    loop {
        let completions = {
            let mut inner = connection.borrow_mut();
            inner.iterate(readiness);
            inner.completions.take()
        };

        for completion in completions {
            completion();
        }

        let mut inner = connection.borrow_mut();
        match inner.rerun.take() {
            Some(next) => readiness = next,
            None => {
                inner.driving = false;
                break;
            },
        }
    }
}

/// Start an operation and pump the connection from a private poller until
/// it resolves. Used by the blocking stream helpers.
pub(crate) fn wait_for<T, S>(
    connection: &Rc<RefCell<ConnectionInner>>,
    start: S,
) -> Result<T>
where
    T: 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T>)>) -> Result<()>,
{
    {
        let mut inner = connection.borrow_mut();
        if inner.is_blocking() || inner.driving {
            return Err(Error::NestedBlocking);
        }
        inner.set_blocking(true);
    }

    let slot: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let outcome = start(Box::new(move |result| {
        *sink.borrow_mut() = Some(result);
    }))
    .and_then(|()| block_until(connection, || slot.borrow().is_some()));

    connection.borrow_mut().set_blocking(false);
    outcome?;

    let result = slot.borrow_mut().take();
    result.unwrap_or(Err(Error::Disconnected))
}

fn block_until<F>(connection: &RefCell<ConnectionInner>, done: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let mut poll = mio::Poll::new().map_err(Error::poll)?;
    let mut events = Events::with_capacity(8);
    let tick = connection.borrow().options().blocking_tick;
    let mut armed: Option<(i32, Interest)> = None;

    while !done() {
        let wanted = {
            let inner = connection.borrow();
            inner.socket.as_ref().map(|socket| {
                (socket.stream().as_raw_fd(), inner.desired_interest())
            })
        };
        let Some((fd, interest)) = wanted else {
            // Torn down without resolving; the reset path already failed
            // every pending operation.
            break;
        };

        match armed {
            Some(current) if current == (fd, interest) => {},
            Some((old, _)) if old == fd => poll.registry().reregister(
                &mut SourceFd(&fd),
                BLOCKING_TOKEN,
                interest,
            )?,
            _ => poll
                .registry()
                .register(&mut SourceFd(&fd), BLOCKING_TOKEN, interest)?,
        }
        armed = Some((fd, interest));

        events.clear();
        match poll.poll(&mut events, Some(tick)) {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::poll(err)),
        }

        let mut readiness = events
            .iter()
            .fold(Readiness::empty(), |acc, event| {
                acc | Readiness::from_event(event)
            });
        if readiness.is_empty() {
            // Tick elapsed: pump anyway so cancellation is noticed.
            readiness = Readiness::READABLE | Readiness::WRITABLE;
        }
        drive(connection, readiness);
    }

    Ok(())
}

impl ConnectionInner {
    /// Advance the state machine as far as the socket allows.
    pub(super) fn iterate(&mut self, readiness: Readiness) {
        let io = readiness & (Readiness::READABLE | Readiness::WRITABLE);

        loop {
            let advanced = match self.phase {
                Phase::Disconnected | Phase::Error => return,
                Phase::Connecting => self.step_connecting(),
                Phase::Handshaking => self.step_handshake(),
                Phase::Preauth => false,
                Phase::Negotiating => self.step_negotiate(),
                Phase::AuthenticationRequired => self.step_authenticate(),
                Phase::Connected => {
                    self.process_connected(io);
                    false
                },
            };
            if !advanced {
                break;
            }
        }

        if readiness.is_fatal() && !self.phase.is_terminal() {
            self.take_error(Error::Hangup);
        }
        self.rearm_socket();
    }

    pub(super) fn desired_interest(&self) -> Interest {
        match (self.phase, self.session.as_ref()) {
            (Phase::Connecting, _) | (_, None) => Interest::WRITABLE,
            (_, Some(session)) => interest_for(
                session.block_directions(),
                self.any_channel(ChannelInner::has_pending_read),
                self.any_channel(ChannelInner::has_pending_write),
            ),
        }
    }

    fn any_channel(&self, pending: fn(&ChannelInner) -> bool) -> bool {
        self.channels.iter().any(|channel| {
            channel
                .upgrade()
                .is_some_and(|channel| pending(&channel.borrow()))
        })
    }

    fn rearm_socket(&mut self) {
        if self.socket.is_none() {
            return;
        }

        let interest = self.desired_interest();
        let armed = match self.socket.as_mut() {
            Some(socket) => socket.arm(interest),
            None => Ok(()),
        };
        if let Err(err) = armed {
            self.take_error(err);
        }
    }

    fn step_connecting(&mut self) -> bool {
        reap_cancelled(&mut self.handshake, &mut self.completions);

        let connected = match self.socket.as_ref() {
            Some(socket) => probe_connect(socket.stream()),
            None => Err(Error::Disconnected),
        };
        match connected {
            Ok(true) => {},
            Ok(false) => return false,
            Err(err) => {
                self.take_error(err);
                return false;
            },
        }

        let created = match self.socket.as_ref() {
            Some(socket) => {
                if let Err(err) = socket.stream().set_nodelay(true) {
                    log::debug!("failed to set TCP_NODELAY: {err}");
                }
                self.factory.create(socket.stream(), &self.options)
            },
            None => Err(Error::Disconnected),
        };

        match created {
            Ok(session) => {
                self.session = Some(session);
                self.transition(Phase::Handshaking);
                true
            },
            Err(err) => {
                self.take_error(err);
                false
            },
        }
    }

    fn step_handshake(&mut self) -> bool {
        reap_cancelled(&mut self.handshake, &mut self.completions);

        let Some(session) = self.session.as_mut() else {
            self.take_error(Error::Disconnected);
            return false;
        };

        match session.handshake() {
            Poll::Pending => false,
            Poll::Ready(Err(err)) => {
                self.take_error(err);
                false
            },
            Poll::Ready(Ok(())) => {
                self.host_key = session.host_key();
                if let Some(key) = &self.host_key {
                    log::info!(
                        "server host key {} {}",
                        key.algorithm(),
                        key.sha256_fingerprint().unwrap_or_default()
                    );
                }
                if let Some(task) = self.handshake.take() {
                    task.complete(Ok(()), &mut self.completions);
                }
                self.transition(Phase::Preauth);
                true
            },
        }
    }

    fn step_negotiate(&mut self) -> bool {
        reap_cancelled(&mut self.negotiate, &mut self.completions);

        let Some(session) = self.session.as_mut() else {
            self.take_error(Error::Disconnected);
            return false;
        };

        let next = match session.auth_list(&self.username) {
            Poll::Pending => return false,
            Poll::Ready(Err(err)) => {
                self.take_error(err);
                return false;
            },
            Poll::Ready(Ok(AuthList::Authenticated)) => {
                log::info!(
                    "server accepted {} without credentials",
                    self.username
                );
                Phase::Connected
            },
            Poll::Ready(Ok(AuthList::Mechanisms(mechanisms))) => {
                log::debug!("server offers {mechanisms:?}");
                self.mechanisms = mechanisms;
                Phase::AuthenticationRequired
            },
        };

        if let Some(task) = self.negotiate.take() {
            task.complete(Ok(next), &mut self.completions);
        }
        self.transition(next);
        true
    }

    fn step_authenticate(&mut self) -> bool {
        let Some(request) = self.auth.take() else {
            return false;
        };
        if request.is_cancelled() {
            request
                .into_task()
                .complete(Err(Error::Cancelled), &mut self.completions);
            return false;
        }

        let attempt = match self.session.as_mut() {
            Some(session) => request.attempt(
                session.as_mut(),
                &self.username,
                &mut self.credentials,
            ),
            None => Poll::Ready(Err(Error::Disconnected)),
        };

        match attempt {
            Poll::Pending => {
                self.auth = Some(request);
                false
            },
            Poll::Ready(Ok(AuthOutcome::Success)) => {
                log::info!(
                    "authenticated {} with {}",
                    self.username,
                    request.mechanism()
                );
                request
                    .into_task()
                    .complete(Ok(AuthOutcome::Success), &mut self.completions);
                self.mechanisms.clear();
                self.transition(Phase::Connected);
                true
            },
            Poll::Ready(Ok(outcome)) => {
                log::debug!("{} attempt: {outcome:?}", request.mechanism());
                request
                    .into_task()
                    .complete(Ok(outcome), &mut self.completions);
                false
            },
            Poll::Ready(Err(err)) if err.is_operation_scoped() => {
                request.into_task().complete(Err(err), &mut self.completions);
                false
            },
            Poll::Ready(Err(err)) => {
                self.auth = Some(request);
                self.take_error(err);
                false
            },
        }
    }

    fn process_connected(&mut self, io: Readiness) {
        self.channels.retain(|channel| channel.strong_count() > 0);

        let read_chunk = self.options.read_chunk;
        for channel in &self.channels {
            if let Some(channel) = channel.upgrade() {
                channel
                    .borrow_mut()
                    .pump(io, read_chunk, &mut self.completions);
            }
        }

        self.process_opens();
    }

    fn process_opens(&mut self) {
        for mut request in std::mem::take(&mut self.opens) {
            if request.is_cancelled() {
                request
                    .into_task()
                    .complete(Err(Error::Cancelled), &mut self.completions);
                continue;
            }

            let progress = match self.session.as_mut() {
                Some(session) => {
                    request.advance(session.as_mut(), &self.options)
                },
                None => OpenProgress::Failed(Error::Disconnected),
            };

            match progress {
                OpenProgress::Pending => self.opens.push(request),
                OpenProgress::Failed(err) => {
                    log::debug!("channel open failed: {err}");
                    request
                        .into_task()
                        .complete(Err(err), &mut self.completions);
                },
                OpenProgress::Opened { native, have_pty } => {
                    let channel = self.register_channel(native, have_pty);
                    log::debug!("channel {} open", channel.id());
                    request
                        .into_task()
                        .complete(Ok(channel), &mut self.completions);
                },
            }
        }
    }
}

/// Whether a non-blocking connect finished.
fn probe_connect(stream: &TcpStream) -> Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err.into());
    }

    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err.into()),
    }
}
