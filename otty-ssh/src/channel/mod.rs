//! Session channels and their byte streams.

mod input;
mod output;


use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::task::Poll;

use crate::cancel::Cancellable;
use crate::connection::{Connection, ConnectionInner, WeakConnection, drive};
use crate::error::{Error, Result};
use crate::runtime::Readiness;
use crate::session::ChannelAdapter;
use crate::size::PtySize;
use crate::task::{Completions, Task};

use self::input::InputState;
use self::output::OutputState;

pub use self::input::ChannelInputStream;
pub use self::output::{ChannelOutputStream, EofState};

/// An open session channel running a shell or a command.
///
/// Handles are cheap to clone. A channel outlives a reset of its
/// connection, but every operation on it then fails with
/// [`Error::Disconnected`].
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

pub(crate) struct ChannelInner {
    id: u64,
    connection: Option<WeakConnection>,
    native: Option<Box<dyn ChannelAdapter>>,
    have_pty: bool,
    pty_size: PtySize,
    input: Option<InputState>,
    output: Option<OutputState>,
    resize: ResizeState,
}

impl Channel {
    pub(crate) fn new(inner: ChannelInner) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ChannelInner>> {
        Rc::downgrade(&self.inner)
    }

    /// Identifier unique within the owning connection.
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn has_pty(&self) -> bool {
        self.inner.borrow().have_pty
    }

    /// Geometry of the most recent resize request.
    pub fn pty_size(&self) -> PtySize {
        self.inner.borrow().pty_size
    }

    /// Owning connection, unless it was reset or dropped.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.borrow().owner().ok().map(Connection::from_inner)
    }

    pub fn is_orphaned(&self) -> bool {
        self.connection().is_none()
    }

    /// Stream of bytes sent by the remote side.
    pub fn input_stream(&self) -> ChannelInputStream {
        self.inner.borrow_mut().input_mut();
        ChannelInputStream::new(Rc::clone(&self.inner))
    }

    /// Stream of bytes sent to the remote side.
    pub fn output_stream(&self) -> ChannelOutputStream {
        self.inner.borrow_mut().output_mut();
        ChannelOutputStream::new(Rc::clone(&self.inner))
    }

    /// Exit status of the remote command, once it is known.
    pub fn exit_status(&self) -> Option<i32> {
        self.inner
            .borrow()
            .native
            .as_ref()
            .and_then(|native| native.exit_status())
    }

    /// Ask the server to resize the pty.
    ///
    /// Requests made while one is still unacknowledged are coalesced: the
    /// latest size replaces the pending one and every superseded caller
    /// receives the result of that single request.
    pub fn request_resize<F>(
        &self,
        cols: u16,
        rows: u16,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        {
            let mut channel = self.inner.borrow_mut();
            channel.owner()?;
            if !channel.have_pty {
                return Err(Error::NoPty);
            }

            let size = PtySize {
                cols,
                rows,
                ..channel.pty_size
            };
            channel.pty_size = size;
            channel.resize.submit(size, Task::new(cancellable, callback));
        }

        kick(&self.inner);
        Ok(())
    }
}

impl ChannelInner {
    pub(crate) fn new(
        id: u64,
        connection: WeakConnection,
        native: Box<dyn ChannelAdapter>,
        have_pty: bool,
        pty_size: PtySize,
    ) -> Self {
        Self {
            id,
            connection: Some(connection),
            native: Some(native),
            have_pty,
            pty_size,
            input: None,
            output: None,
            resize: ResizeState::default(),
        }
    }

    fn owner(&self) -> Result<Rc<RefCell<ConnectionInner>>> {
        self.connection
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::Disconnected)
    }

    fn input_mut(&mut self) -> &mut InputState {
        self.input.get_or_insert_with(InputState::default)
    }

    fn output_mut(&mut self) -> &mut OutputState {
        self.output.get_or_insert_with(OutputState::default)
    }

    pub(crate) fn has_pending_read(&self) -> bool {
        self.input.as_ref().is_some_and(InputState::has_pending_read)
    }

    /// A write, close or resize still has to reach the server.
    pub(crate) fn has_pending_write(&self) -> bool {
        self.resize.is_pending()
            || self.output.as_ref().is_some_and(OutputState::has_pending_write)
    }

    /// Run every pending operation as far as `io` allows.
    pub(crate) fn pump(
        &mut self,
        io: Readiness,
        read_chunk: usize,
        out: &mut Completions,
    ) {
        let Some(native) = self.native.as_mut() else {
            return;
        };

        if let Some(input) = self.input.as_mut() {
            input.pump(
                native.as_mut(),
                io.contains(Readiness::READABLE),
                read_chunk,
                out,
            );
        }
        if let Some(output) = self.output.as_mut() {
            output.pump(native.as_mut(), io.contains(Readiness::WRITABLE), out);
        }
        self.resize.pump(native.as_mut(), out);
    }

    /// Resolve every pending operation with `error`.
    pub(crate) fn fail_pending(
        &mut self,
        error: &Error,
        out: &mut Completions,
    ) -> usize {
        let mut failed = self.resize.fail(error, out);
        if let Some(input) = self.input.as_mut() {
            failed += input.fail(error, out);
        }
        if let Some(output) = self.output.as_mut() {
            failed += output.fail(error, out);
        }
        failed
    }

    /// Detach from a connection that is being torn down.
    pub(crate) fn orphan(&mut self, out: &mut Completions) {
        self.fail_pending(&Error::Disconnected, out);
        self.connection = None;
        self.native = None;
    }
}

/// Pump the owning connection right away so a new operation gets its
/// first attempt.
fn kick(channel: &RefCell<ChannelInner>) {
    let owner = channel.borrow().owner();
    if let Ok(owner) = owner {
        drive(&owner, Readiness::READABLE | Readiness::WRITABLE);
    }
}

/// Start an operation on `channel` and wait for it from a private poller.
fn block_on<T, S>(channel: &RefCell<ChannelInner>, start: S) -> Result<T>
where
    T: 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T>)>) -> Result<()>,
{
    let owner = channel.borrow().owner()?;
    crate::connection::wait_for(&owner, start)
}

/// Latest pty geometry requested plus everyone waiting for it.
struct ResizeRequest {
    size: PtySize,
    waiters: Vec<Task<()>>,
}

impl ResizeRequest {
    fn reap_cancelled(&mut self, out: &mut Completions) {
        let (cancelled, waiting) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition::<Vec<_>, _>(Task::is_cancelled);
        self.waiters = waiting;
        for task in cancelled {
            task.complete(Err(Error::Cancelled), out);
        }
    }
}

/// The resize being pushed to the server.
///
/// Until the server acknowledges, a newer request replaces the size in
/// place, so a burst of resizes ends in one call with the final geometry.
#[derive(Default)]
struct ResizeState {
    pending: Option<ResizeRequest>,
}

impl ResizeState {
    fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn submit(&mut self, size: PtySize, task: Task<()>) {
        match self.pending.as_mut() {
            Some(request) => {
                log::trace!(
                    "resize to {}x{} supersedes {}x{}",
                    size.cols,
                    size.rows,
                    request.size.cols,
                    request.size.rows
                );
                request.size = size;
                request.waiters.push(task);
            },
            None => {
                self.pending = Some(ResizeRequest {
                    size,
                    waiters: vec![task],
                });
            },
        }
    }

    fn pump(&mut self, native: &mut dyn ChannelAdapter, out: &mut Completions) {
        let Some(mut request) = self.pending.take() else {
            return;
        };
        // Once started, a resize runs to completion even without waiters.
        request.reap_cancelled(out);

        match native.resize_pty(request.size) {
            Poll::Pending => self.pending = Some(request),
            Poll::Ready(result) => {
                if let Err(err) = &result {
                    log::debug!("pty resize failed: {err}");
                }
                for waiter in request.waiters {
                    waiter.complete(result.clone(), out);
                }
            },
        }
    }

    fn fail(&mut self, error: &Error, out: &mut Completions) -> usize {
        let Some(request) = self.pending.take() else {
            return 0;
        };
        let failed = request.waiters.len();
        for waiter in request.waiters {
            waiter.complete(Err(error.clone()), out);
        }
        failed
    }
}
