use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::error::Result;
use crate::runtime::RuntimeHandle;
use crate::session::Directions;

/// Registration of the connection socket with the runtime poller.
///
/// Interest is only pushed to the poller when it differs from the armed
/// set, so repeated pumps with unchanged directions are free.
pub(crate) struct SocketWatcher {
    stream: TcpStream,
    runtime: RuntimeHandle,
    token: Token,
    interest: Option<Interest>,
    rearms: usize,
}

impl SocketWatcher {
    pub(crate) fn new(
        stream: TcpStream,
        runtime: RuntimeHandle,
        token: Token,
    ) -> Self {
        Self {
            stream,
            runtime,
            token,
            interest: None,
            rearms: 0,
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub(crate) fn rearms(&self) -> usize {
        self.rearms
    }

    pub(crate) fn arm(&mut self, interest: Interest) -> Result<()> {
        let registry = self.runtime.registry();
        match self.interest {
            Some(current) if current == interest => return Ok(()),
            Some(_) => {
                registry.reregister(&mut self.stream, self.token, interest)?
            },
            None => registry.register(&mut self.stream, self.token, interest)?,
        }

        log::trace!("socket {:?} armed for {interest:?}", self.token);
        self.interest = Some(interest);
        self.rearms += 1;
        Ok(())
    }
}

impl Drop for SocketWatcher {
    fn drop(&mut self) {
        if self.interest.is_some() {
            let registry = self.runtime.registry();
            if let Err(err) = registry.deregister(&mut self.stream) {
                log::debug!("failed to deregister ssh socket: {err}");
            }
        }
        self.runtime.remove_handler(self.token);
    }
}

/// Poller interest for the directions libssh reports as blocked.
///
/// Reads pending on any channel keep the socket readable and pending
/// writes keep it writable, whatever the session itself waits on. A write
/// stalled on the remote window is retried once the window adjust arrives.
pub(crate) fn interest_for(
    directions: Directions,
    wants_read: bool,
    wants_write: bool,
) -> Interest {
    let readable = wants_read
        || matches!(
            directions,
            Directions::None | Directions::Inbound | Directions::Both
        );
    let writable = wants_write
        || matches!(directions, Directions::Outbound | Directions::Both);

    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}
