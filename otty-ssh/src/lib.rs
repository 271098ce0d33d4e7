//! Embeddable, readiness-driven SSH client engine.
//!
//! A [`Connection`] is a small state machine that never blocks: the
//! embedding event loop (a [`Runtime`], or any poller feeding
//! [`Connection::on_ready`]) reports socket readiness and the connection
//! advances as far as it can, resolving pending operations through their
//! callbacks. Once authenticated, any number of [`Channel`]s can run
//! shells or commands over the same transport, each exposing an input and
//! an output stream.
//!
//! The protocol work is delegated to a [`SessionAdapter`]; libssh2 via the
//! `ssh2` crate is the built-in backend.

#![cfg(unix)]

mod address;
mod auth;
mod cancel;
mod channel;
mod connection;
mod credentials;
mod error;
mod host_key;
mod options;
mod runtime;
mod session;
mod size;
mod ssh2_backend;
mod task;
mod watcher;

#[cfg(test)]
mod fake;

pub use crate::address::{Address, DEFAULT_PORT, Destination};
pub use crate::auth::{AuthMechanism, AuthOutcome};
pub use crate::cancel::Cancellable;
pub use crate::channel::{
    Channel, ChannelInputStream, ChannelOutputStream, EofState,
};
pub use crate::connection::{
    ChannelKind, Connection, Phase, PhaseChange, PhaseEvents,
};
pub use crate::credentials::{CredentialPrompt, PromptField, StaticCredentials};
pub use crate::error::{Error, Result};
pub use crate::host_key::HostKey;
pub use crate::options::ConnectionOptions;
pub use crate::runtime::{Readiness, Runtime, RuntimeHandle};
pub use crate::session::{
    AuthList, ChannelAdapter, Directions, SessionAdapter, SessionFactory,
};
pub use crate::size::PtySize;
pub use crate::ssh2_backend::{Ssh2Channel, Ssh2Factory, Ssh2Session};
