use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

use super::{ChannelInner, block_on, kick};
use crate::cancel::Cancellable;
use crate::error::{Error, Result};
use crate::session::ChannelAdapter;
use crate::task::{Completions, Task};

struct ReadRequest {
    max_len: usize,
    task: Task<Vec<u8>>,
}

#[derive(Default)]
pub(super) struct InputState {
    closed: bool,
    read: Option<ReadRequest>,
}

impl InputState {
    pub(super) fn has_pending_read(&self) -> bool {
        self.read.is_some()
    }

    pub(super) fn pump(
        &mut self,
        native: &mut dyn ChannelAdapter,
        readable: bool,
        read_chunk: usize,
        out: &mut Completions,
    ) {
        if let Some(request) = self.read.take_if(|r| r.task.is_cancelled()) {
            request.task.complete(Err(Error::Cancelled), out);
            return;
        }
        if !readable {
            return;
        }
        let Some(request) = self.read.take() else {
            return;
        };

        let mut buf = vec![0; request.max_len.min(read_chunk).max(1)];
        match native.read(&mut buf) {
            Poll::Ready(Ok(0)) if native.is_remote_eof() => {
                request.task.complete(Ok(Vec::new()), out);
            },
            Poll::Pending | Poll::Ready(Ok(0)) => self.read = Some(request),
            Poll::Ready(Ok(count)) => {
                buf.truncate(count);
                request.task.complete(Ok(buf), out);
            },
            Poll::Ready(Err(err)) => request.task.complete(Err(err), out),
        }
    }

    pub(super) fn fail(
        &mut self,
        error: &Error,
        out: &mut Completions,
    ) -> usize {
        match self.read.take() {
            Some(request) => {
                request.task.complete(Err(error.clone()), out);
                1
            },
            None => 0,
        }
    }
}

/// Bytes arriving from the remote side of a channel.
///
/// An empty read marks end of stream.
#[derive(Clone)]
pub struct ChannelInputStream {
    channel: Rc<RefCell<ChannelInner>>,
}

impl ChannelInputStream {
    pub(super) fn new(channel: Rc<RefCell<ChannelInner>>) -> Self {
        Self { channel }
    }

    /// Read up to `max_len` bytes. Only one read may be pending.
    pub fn read<F>(
        &self,
        max_len: usize,
        cancellable: Option<&Cancellable>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + 'static,
    {
        let stale = {
            let mut channel = self.channel.borrow_mut();
            channel.owner()?;
            let input = channel.input_mut();
            if input.closed {
                return Err(Error::Closed);
            }

            let stale = input.read.take_if(|r| r.task.is_cancelled());
            if input.read.is_some() {
                return Err(Error::AlreadyPending("read"));
            }
            if max_len > 0 {
                input.read = Some(ReadRequest {
                    max_len,
                    task: Task::new(cancellable, callback),
                });
            } else {
                drop(channel);
                if let Some(stale) = stale {
                    stale.task.resolve(Err(Error::Cancelled));
                }
                callback(Ok(Vec::new()));
                return Ok(());
            }
            stale
        };

        if let Some(stale) = stale {
            stale.task.resolve(Err(Error::Cancelled));
        }
        kick(&self.channel);
        Ok(())
    }

    /// Read into `buf`, pumping the connection until data arrives.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<usize> {
        let data = block_on(&self.channel, |callback| {
            self.read(buf.len(), None, callback)
        })?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Stop reading. A pending read resolves with [`Error::Closed`].
    pub fn close(&self) {
        let pending = {
            let mut channel = self.channel.borrow_mut();
            let input = channel.input_mut();
            input.closed = true;
            input.read.take()
        };

        if let Some(request) = pending {
            request.task.resolve(Err(Error::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel
            .borrow()
            .input
            .as_ref()
            .is_some_and(|input| input.closed)
    }
}
