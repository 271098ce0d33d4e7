use std::task::Poll;

use crate::channel::Channel;
use crate::error::Error;
use crate::options::ConnectionOptions;
use crate::session::{ChannelAdapter, SessionAdapter};
use crate::task::Task;

/// What a new channel runs once it is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Interactive login shell.
    Shell,
    /// Single remote command.
    Exec(String),
}

enum OpenStep {
    OpenSession,
    RequestPty(Box<dyn ChannelAdapter>),
    Start(Box<dyn ChannelAdapter>),
}

pub(crate) enum OpenProgress {
    Pending,
    Opened {
        native: Box<dyn ChannelAdapter>,
        have_pty: bool,
    },
    Failed(Error),
}

/// One in-flight channel open, carrying its own progress.
pub(crate) struct OpenRequest {
    kind: ChannelKind,
    step: Option<OpenStep>,
    have_pty: bool,
    task: Task<Channel>,
}

impl OpenRequest {
    pub(crate) fn new(kind: ChannelKind, task: Task<Channel>) -> Self {
        Self {
            kind,
            step: Some(OpenStep::OpenSession),
            have_pty: false,
            task,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub(crate) fn into_task(self) -> Task<Channel> {
        self.task
    }

    /// Run as many steps as the session allows without blocking.
    pub(crate) fn advance(
        &mut self,
        session: &mut dyn SessionAdapter,
        options: &ConnectionOptions,
    ) -> OpenProgress {
        loop {
            let Some(step) = self.step.take() else {
                return OpenProgress::Failed(Error::Disconnected);
            };

            match step {
                OpenStep::OpenSession => match session.open_session() {
                    Poll::Pending => {
                        self.step = Some(OpenStep::OpenSession);
                        return OpenProgress::Pending;
                    },
                    Poll::Ready(Err(err)) => return OpenProgress::Failed(err),
                    Poll::Ready(Ok(native)) => {
                        self.step = Some(if options.request_pty {
                            OpenStep::RequestPty(native)
                        } else {
                            OpenStep::Start(native)
                        });
                    },
                },
                OpenStep::RequestPty(mut native) => {
                    match native.request_pty(&options.term, options.pty_size) {
                        Poll::Pending => {
                            self.step = Some(OpenStep::RequestPty(native));
                            return OpenProgress::Pending;
                        },
                        Poll::Ready(Err(err)) => {
                            return OpenProgress::Failed(err);
                        },
                        Poll::Ready(Ok(())) => {
                            self.have_pty = true;
                            self.step = Some(OpenStep::Start(native));
                        },
                    }
                },
                OpenStep::Start(mut native) => {
                    let started = match &self.kind {
                        ChannelKind::Shell => native.shell(),
                        ChannelKind::Exec(command) => native.exec(command),
                    };
                    match started {
                        Poll::Pending => {
                            self.step = Some(OpenStep::Start(native));
                            return OpenProgress::Pending;
                        },
                        Poll::Ready(Err(err)) => {
                            return OpenProgress::Failed(err);
                        },
                        Poll::Ready(Ok(())) => {
                            return OpenProgress::Opened {
                                native,
                                have_pty: self.have_pty,
                            };
                        },
                    }
                },
            }
        }
    }
}
