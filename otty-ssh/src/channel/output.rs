use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

use super::{ChannelInner, block_on, kick};
use crate::cancel::Cancellable;
use crate::error::{Error, Result};
use crate::session::ChannelAdapter;
use crate::task::{Completions, Task, take_cancelled};

/// Progress of the end-of-file exchange that closes an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EofState {
    #[default]
    Open,
    /// Close requested; our EOF is not on the wire yet.
    RequestedEof,
    /// Our EOF was sent; waiting for the peer's.
    SentEof,
    /// Both sides signalled EOF.
    ReceivedEof,
}

struct WriteRequest {
    data: Vec<u8>,
    task: Task<usize>,
}

#[derive(Default)]
pub(super) struct OutputState {
    state: EofState,
    write: Option<WriteRequest>,
    close: Option<Task<()>>,
}

impl OutputState {
    pub(super) fn has_pending_write(&self) -> bool {
        self.write.is_some() || self.close.is_some()
    }

    /// Drop a close whose caller gave up. An EOF not yet on the wire is
    /// forgotten, leaving the stream writable again.
    fn take_cancelled_close(&mut self) -> Option<Task<()>> {
        let task = take_cancelled(&mut self.close)?;
        if self.state == EofState::RequestedEof {
            self.state = EofState::Open;
        }
        Some(task)
    }

    fn take_cancelled_write(&mut self) -> Option<WriteRequest> {
        self.write.take_if(|r| r.task.is_cancelled())
    }

    pub(super) fn pump(
        &mut self,
        native: &mut dyn ChannelAdapter,
        writable: bool,
        out: &mut Completions,
    ) {
        if let Some(request) = self.take_cancelled_write() {
            request.task.complete(Err(Error::Cancelled), out);
        }
        if let Some(task) = self.take_cancelled_close() {
            task.complete(Err(Error::Cancelled), out);
        }

        if writable {
            if let Some(request) = self.write.take() {
                match native.write(&request.data) {
                    Poll::Pending | Poll::Ready(Ok(0)) => {
                        self.write = Some(request);
                    },
                    Poll::Ready(Ok(count)) => {
                        request.task.complete(Ok(count), out);
                    },
                    Poll::Ready(Err(err)) => {
                        request.task.complete(Err(err), out);
                    },
                }
            }
        }

        if self.state == EofState::RequestedEof {
            match native.send_eof() {
                Poll::Pending => return,
                Poll::Ready(Err(err)) => {
                    self.state = EofState::Open;
                    if let Some(task) = self.close.take() {
                        task.complete(Err(err), out);
                    }
                    return;
                },
                Poll::Ready(Ok(())) => self.state = EofState::SentEof,
            }
        }

        if self.state == EofState::SentEof && native.is_remote_eof() {
            self.state = EofState::ReceivedEof;
            if let Some(task) = self.close.take() {
                task.complete(Ok(()), out);
            }
        }
    }

    pub(super) fn fail(
        &mut self,
        error: &Error,
        out: &mut Completions,
    ) -> usize {
        let mut failed = 0;
        if let Some(request) = self.write.take() {
            request.task.complete(Err(error.clone()), out);
            failed += 1;
        }
        if let Some(task) = self.close.take() {
            task.complete(Err(error.clone()), out);
            failed += 1;
        }
        failed
    }
}

/// Bytes sent to the remote side of a channel.
#[derive(Clone)]
pub struct ChannelOutputStream {
    channel: Rc<RefCell<ChannelInner>>,
}

impl ChannelOutputStream {
    pub(super) fn new(channel: Rc<RefCell<ChannelInner>>) -> Self {
        Self { channel }
    }

    pub fn state(&self) -> EofState {
        self.channel
            .borrow()
            .output
            .as_ref()
            .map_or(EofState::Open, |output| output.state)
    }

    /// Write `data`. The callback receives how many bytes the server
    /// accepted, which may be fewer than offered; the caller resubmits
    /// the rest.
    pub fn write<F>(
        &self,
        data: impl Into<Vec<u8>>,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<usize>) + 'static,
    {
        let data = data.into();
        self.reap_cancelled()?;
        {
            let mut channel = self.channel.borrow_mut();
            let output = channel.output_mut();
            if output.state != EofState::Open {
                return Err(Error::Closed);
            }
            if output.write.is_some() {
                return Err(Error::AlreadyPending("write"));
            }
            if !data.is_empty() {
                output.write = Some(WriteRequest {
                    data,
                    task: Task::new(cancellable, callback),
                });
            } else {
                drop(channel);
                callback(Ok(0));
                return Ok(());
            }
        }

        kick(&self.channel);
        Ok(())
    }

    /// Write `data`, pumping the connection until the server accepted at
    /// least part of it.
    pub fn write_blocking(&self, data: &[u8]) -> Result<usize> {
        block_on(&self.channel, |callback| {
            self.write(data.to_vec(), None, callback)
        })
    }

    /// Send EOF and wait for the peer's. Rejected while a write is
    /// pending or once the stream is already closing.
    pub fn close<F>(
        &self,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.reap_cancelled()?;
        {
            let mut channel = self.channel.borrow_mut();
            let output = channel.output_mut();
            if output.state != EofState::Open {
                return Err(Error::Closed);
            }
            if output.write.is_some() {
                return Err(Error::AlreadyPending("write"));
            }
            output.state = EofState::RequestedEof;
            output.close = Some(Task::new(cancellable, callback));
        }

        kick(&self.channel);
        Ok(())
    }

    pub fn close_blocking(&self) -> Result<()> {
        block_on(&self.channel, |callback| self.close(None, callback))
    }

    /// Resolve operations cancelled since the last pump so their slots
    /// are free for a new one.
    fn reap_cancelled(&self) -> Result<()> {
        let (write, close) = {
            let mut channel = self.channel.borrow_mut();
            channel.owner()?;
            let output = channel.output_mut();
            (output.take_cancelled_write(), output.take_cancelled_close())
        };

        if let Some(request) = write {
            request.task.resolve(Err(Error::Cancelled));
        }
        if let Some(task) = close {
            task.resolve(Err(Error::Cancelled));
        }
        Ok(())
    }
}
