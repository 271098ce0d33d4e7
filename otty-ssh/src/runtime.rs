use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token};

use crate::error::{Error, Result};

const DEFAULT_EVENT_CAPACITY: usize = 128;

bitflags! {
    /// Socket conditions delivered to a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR = 0b0100;
        const HANGUP = 0b1000;
    }
}

impl Readiness {
    pub(crate) fn from_event(event: &Event) -> Self {
        let mut readiness = Readiness::empty();
        if event.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if event.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        if event.is_error() {
            readiness |= Readiness::ERROR;
        }
        if event.is_read_closed() && event.is_write_closed() {
            readiness |= Readiness::HANGUP;
        }
        readiness
    }

    /// Error or hang-up on the socket.
    pub fn is_fatal(self) -> bool {
        self.intersects(Readiness::ERROR | Readiness::HANGUP)
    }
}

/// Object woken by the runtime when its registered source is ready.
pub(crate) trait ReadyHandler {
    fn on_ready(&self, readiness: Readiness);
}

struct RuntimeShared {
    registry: Registry,
    handlers: RefCell<HashMap<Token, Weak<dyn ReadyHandler>>>,
    next_token: Cell<usize>,
}

/// Cloneable handle used by connections to register their sockets.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Rc<RuntimeShared>,
}

impl RuntimeHandle {
    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn add_handler(&self, handler: Weak<dyn ReadyHandler>) -> Token {
        let token = Token(self.shared.next_token.get());
        self.shared.next_token.set(token.0 + 1);
        self.shared.handlers.borrow_mut().insert(token, handler);
        token
    }

    pub(crate) fn remove_handler(&self, token: Token) {
        self.shared.handlers.borrow_mut().remove(&token);
    }

    fn handler(&self, token: Token) -> Option<Rc<dyn ReadyHandler>> {
        self.shared
            .handlers
            .borrow()
            .get(&token)
            .and_then(Weak::upgrade)
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.shared.handlers.borrow().len()
    }
}

/// Single-threaded readiness loop that owns the `mio` poller and wakes the
/// connections registered through its [`RuntimeHandle`].
///
/// The runtime never blocks on its own; embedders call [`Runtime::turn`]
/// from their main loop, or feed readiness to
/// [`Connection::on_ready`](crate::Connection::on_ready) from a foreign
/// poller instead.
pub struct Runtime {
    poll: Poll,
    events: Events,
    handle: RuntimeHandle,
}

impl Runtime {
    /// Construct a new event loop with the default capacity.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Construct a new event loop with a custom event capacity.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let poll = Poll::new().map_err(Error::poll)?;
        let registry = poll.registry().try_clone().map_err(Error::poll)?;
        let shared = RuntimeShared {
            registry,
            handlers: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            handle: RuntimeHandle {
                shared: Rc::new(shared),
            },
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Wait for readiness once and dispatch it. Returns the number of
    /// events delivered to live handlers.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.poll_once(timeout)?;

        let ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|event| (event.token(), Readiness::from_event(event)))
            .collect();

        let mut delivered = 0;
        for (token, readiness) in ready {
            if let Some(handler) = self.handle.handler(token) {
                handler.on_ready(readiness);
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Keep turning until `done` reports completion.
    pub fn run_until<F>(&mut self, mut done: F, tick: Duration) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        while !done() {
            self.turn(Some(tick))?;
        }
        Ok(())
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.events.clear();
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::poll(err)),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::net::TcpListener;
    use std::rc::{Rc, Weak};
    use std::time::Duration;

    use mio::Interest;
    use mio::net::TcpStream;

    use super::{Readiness, ReadyHandler, Runtime};

    #[derive(Default)]
    struct StubHandler {
        seen: RefCell<Vec<Readiness>>,
    }

    impl ReadyHandler for StubHandler {
        fn on_ready(&self, readiness: Readiness) {
            self.seen.borrow_mut().push(readiness);
        }
    }

    #[test]
    fn fatal_readiness() {
        assert!(Readiness::HANGUP.is_fatal());
        assert!((Readiness::READABLE | Readiness::ERROR).is_fatal());
        assert!(!(Readiness::READABLE | Readiness::WRITABLE).is_fatal());
    }

    #[test]
    fn dispatches_to_registered_handler() -> anyhow::Result<()> {
        let mut runtime = Runtime::new()?;
        let handle = runtime.handle();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let mut stream = TcpStream::connect(listener.local_addr()?)?;

        let stub = Rc::new(StubHandler::default());
        let weak = Rc::downgrade(&stub) as Weak<dyn ReadyHandler>;
        let token = handle.add_handler(weak);
        handle
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)?;

        let (mut peer, _) = listener.accept()?;
        peer.write_all(b"x")?;

        for _ in 0..100 {
            runtime.turn(Some(Duration::from_millis(10)))?;
            if !stub.seen.borrow().is_empty() {
                break;
            }
        }
        assert!(
            stub.seen
                .borrow()
                .iter()
                .any(|readiness| readiness.contains(Readiness::WRITABLE))
        );
        Ok(())
    }

    #[test]
    fn dropped_handlers_are_skipped() -> anyhow::Result<()> {
        let mut runtime = Runtime::new()?;
        let handle = runtime.handle();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let mut stream = TcpStream::connect(listener.local_addr()?)?;

        let stub = Rc::new(StubHandler::default());
        let weak = Rc::downgrade(&stub) as Weak<dyn ReadyHandler>;
        let token = handle.add_handler(weak);
        handle
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)?;
        drop(stub);

        let delivered = runtime.turn(Some(Duration::from_millis(50)))?;
        assert_eq!(delivered, 0);

        handle.remove_handler(token);
        assert_eq!(handle.registered(), 0);
        Ok(())
    }
}
