use secrecy::SecretString;

use super::{ChannelKind, Phase, PhaseChange};
use crate::auth::{AuthMechanism, AuthOutcome};
use crate::cancel::Cancellable;
use crate::channel::Channel;
use crate::credentials::{CredentialPrompt, StaticCredentials};
use crate::error::{Error, Result};
use crate::fake::{Harness, capture, take};
use crate::host_key::HostKey;
use crate::runtime::Readiness;
use crate::session::Directions;

struct Declining;

impl CredentialPrompt for Declining {
    fn password(&mut self, _: &str, _: &str) -> Option<SecretString> {
        None
    }
}

fn phases(changes: &[PhaseChange]) -> Vec<Phase> {
    changes.iter().map(|change| change.new).collect()
}

#[test]
fn connect_rests_in_preauth() -> anyhow::Result<()> {
    let key = HostKey::new("ssh-ed25519", vec![7; 32], Some(vec![1; 20]), None);
    let mut harness = Harness::new(|script| {
        script.host_key = Some(key.clone());
        script.handshake_blocks = 1;
    })?;

    harness.connect()?;

    assert_eq!(harness.connection.phase(), Phase::Preauth);
    assert_eq!(harness.connection.host_key(), Some(key));
    assert_eq!(harness.server.with(|script| script.sessions), 1);
    assert_eq!(
        harness.events.drain(),
        vec![
            PhaseChange {
                old: Phase::Disconnected,
                new: Phase::Connecting
            },
            PhaseChange {
                old: Phase::Connecting,
                new: Phase::Handshaking
            },
            PhaseChange {
                old: Phase::Handshaking,
                new: Phase::Preauth
            },
        ]
    );
    Ok(())
}

#[test]
fn none_authentication_skips_mechanisms() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| script.none_accepted = true)?;
    harness.connect()?;

    assert_eq!(harness.negotiate()?, Phase::Connected);
    let seen = phases(&harness.events.drain());
    assert!(!seen.contains(&Phase::AuthenticationRequired));
    assert_eq!(seen.last(), Some(&Phase::Connected));
    Ok(())
}

#[test]
fn denied_password_then_publickey() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms =
            vec![AuthMechanism::Password, AuthMechanism::PublicKey];
        script.password = Some("secret".into());
        script.publickey_accepted = true;
    })?;
    harness.connection.set_credentials(StaticCredentials::new("wrong"));

    harness.connect()?;
    assert_eq!(harness.negotiate()?, Phase::AuthenticationRequired);
    assert_eq!(
        harness.connection.authentication_mechanisms()?,
        vec![AuthMechanism::Password, AuthMechanism::PublicKey]
    );

    let outcome = harness.authenticate(AuthMechanism::Password)?;
    assert!(matches!(outcome, Ok(AuthOutcome::Denied)));
    assert_eq!(harness.connection.phase(), Phase::AuthenticationRequired);

    let outcome = harness.authenticate(AuthMechanism::PublicKey)?;
    assert!(matches!(outcome, Ok(AuthOutcome::Success)));
    assert_eq!(harness.connection.phase(), Phase::Connected);

    assert_eq!(
        phases(&harness.events.drain()),
        vec![
            Phase::Connecting,
            Phase::Handshaking,
            Phase::Preauth,
            Phase::Negotiating,
            Phase::AuthenticationRequired,
            Phase::Connected,
        ]
    );
    assert!(matches!(
        harness.connection.authentication_mechanisms(),
        Err(Error::InvalidState { .. })
    ));
    Ok(())
}

#[test]
fn partial_success_keeps_asking_for_factors() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms =
            vec![AuthMechanism::Password, AuthMechanism::PublicKey];
        script.password = Some("secret".into());
        script.partial = vec![AuthMechanism::Password];
        script.publickey_accepted = true;
    })?;
    harness.connection.set_credentials(StaticCredentials::new("secret"));
    harness.connect()?;
    harness.negotiate()?;

    let outcome = harness.authenticate(AuthMechanism::Password)?;
    assert!(matches!(outcome, Ok(AuthOutcome::Partial)));
    assert_eq!(harness.connection.phase(), Phase::AuthenticationRequired);

    let outcome = harness.authenticate(AuthMechanism::PublicKey)?;
    assert!(matches!(outcome, Ok(AuthOutcome::Success)));
    assert_eq!(harness.connection.phase(), Phase::Connected);
    Ok(())
}

#[test]
fn callback_can_start_next_operation() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| script.none_accepted = true)?;
    let connection = harness.connection.clone();

    let (connected, on_connect) = capture::<Result<()>>();
    let (negotiated, on_negotiate) = capture::<Result<Phase>>();
    harness.connection.connect(
        harness.address.clone(),
        "alice",
        None,
        move |result| {
            on_connect(result);
            connection
                .negotiate(None, on_negotiate)
                .expect("negotiate is allowed in preauth");
        },
    )?;
    harness.turn_until("handshake", || connected.borrow().is_some())?;

    // Serviced by the same pass that delivered the handshake.
    take(&connected)?;
    assert!(matches!(take(&negotiated), Ok(Phase::Connected)));
    assert_eq!(harness.connection.phase(), Phase::Connected);
    Ok(())
}

#[test]
fn keyboard_interactive_uses_prompt() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms = vec![AuthMechanism::KeyboardInteractive];
        script.password = Some("secret".into());
    })?;
    harness.connect()?;
    harness.negotiate()?;

    assert!(matches!(
        harness
            .connection
            .authenticate(AuthMechanism::KeyboardInteractive, None, |_| {}),
        Err(Error::NoCredentials)
    ));

    harness.connection.set_credentials(StaticCredentials::new("secret"));
    let outcome = harness.authenticate(AuthMechanism::KeyboardInteractive)?;
    assert!(matches!(outcome, Ok(AuthOutcome::Success)));
    Ok(())
}

#[test]
fn declined_password_prompt_cancels() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms = vec![AuthMechanism::Password];
    })?;
    harness.connect()?;
    harness.negotiate()?;

    assert!(matches!(
        harness.connection.authenticate(AuthMechanism::Password, None, |_| {}),
        Err(Error::NoCredentials)
    ));

    harness.connection.set_credentials(Declining);
    let outcome = harness.authenticate(AuthMechanism::Password)?;
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(harness.connection.phase(), Phase::AuthenticationRequired);
    assert!(harness.server.with(|script| script.attempts.is_empty()));
    Ok(())
}

#[test]
fn unsupported_mechanisms_keep_connection() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms = vec![AuthMechanism::GssapiMic];
    })?;
    harness.connect()?;
    harness.negotiate()?;

    let outcome = harness.authenticate(AuthMechanism::GssapiMic)?;
    assert!(matches!(outcome, Err(Error::UnsupportedMechanism(_))));

    let outcome = harness.authenticate(AuthMechanism::from_name("hostbased"))?;
    assert!(matches!(outcome, Err(Error::UnsupportedMechanism(_))));
    assert_eq!(harness.connection.phase(), Phase::AuthenticationRequired);
    Ok(())
}

#[test]
fn second_authenticate_fails_fast() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms = vec![AuthMechanism::PublicKey];
        script.publickey_accepted = true;
        script.auth_blocked = true;
    })?;
    harness.connect()?;
    harness.negotiate()?;

    let (first, callback) = capture::<Result<AuthOutcome>>();
    harness
        .connection
        .authenticate(AuthMechanism::PublicKey, None, callback)?;
    assert!(first.borrow().is_none());

    let (second, callback) = capture::<Result<AuthOutcome>>();
    let refused = harness
        .connection
        .authenticate(AuthMechanism::PublicKey, None, callback);
    assert!(matches!(refused, Err(Error::AlreadyPending("authenticate"))));
    assert!(second.borrow().is_none());

    harness.server.with(|script| script.auth_blocked = false);
    harness.connection.on_writable();

    assert!(matches!(take(&first), Ok(AuthOutcome::Success)));
    assert_eq!(harness.server.with(|script| script.attempts.len()), 1);
    Ok(())
}

#[test]
fn cancelled_authentication_frees_slot() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.mechanisms = vec![AuthMechanism::PublicKey];
        script.auth_blocked = true;
    })?;
    harness.connect()?;
    harness.negotiate()?;

    let token = Cancellable::new();
    let (first, callback) = capture::<Result<AuthOutcome>>();
    harness
        .connection
        .authenticate(AuthMechanism::PublicKey, Some(&token), callback)?;
    token.cancel();

    let (second, callback) = capture::<Result<AuthOutcome>>();
    harness
        .connection
        .authenticate(AuthMechanism::PublicKey, None, callback)?;
    assert!(matches!(take(&first), Err(Error::Cancelled)));
    assert!(second.borrow().is_none());
    Ok(())
}

#[test]
fn second_connect_fails_fast() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| script.handshake_blocks = 1)?;

    let (first, callback) = capture::<Result<()>>();
    harness
        .connection
        .connect(harness.address.clone(), "alice", None, callback)?;
    let refused =
        harness
            .connection
            .connect(harness.address.clone(), "alice", None, |_| {});
    assert!(matches!(refused, Err(Error::AlreadyPending("connect"))));

    harness.turn_until("handshake", || first.borrow().is_some())?;
    assert!(matches!(take(&first), Ok(())));
    assert_eq!(harness.server.with(|script| script.sessions), 1);
    Ok(())
}

#[test]
fn operations_check_phase() -> anyhow::Result<()> {
    let harness = Harness::new(|_| {})?;

    let refused = harness
        .connection
        .open_channel(ChannelKind::Shell, None, |_| {});
    assert!(matches!(
        refused,
        Err(Error::InvalidState {
            operation: "open_channel",
            phase: Phase::Disconnected
        })
    ));
    assert!(matches!(
        harness.connection.negotiate(None, |_| {}),
        Err(Error::InvalidState { .. })
    ));
    Ok(())
}

#[test]
fn handshake_error_reaches_connect_callback() -> anyhow::Result<()> {
    let mut harness = Harness::new(|script| {
        script.handshake_error = Some(Error::Protocol {
            context: "handshake failed",
            message: "kex mismatch".into(),
        });
    })?;

    let (result, callback) = capture::<Result<()>>();
    harness
        .connection
        .connect(harness.address.clone(), "alice", None, callback)?;
    harness.turn_until("handshake", || result.borrow().is_some())?;

    assert!(matches!(take(&result), Err(Error::Protocol { .. })));
    assert_eq!(harness.connection.phase(), Phase::Error);
    assert_eq!(harness.connection.host_key(), None);
    assert!(matches!(
        harness.connection.negotiate(None, |_| {}),
        Err(Error::InvalidState {
            phase: Phase::Error,
            ..
        })
    ));

    let again =
        harness
            .connection
            .connect(harness.address.clone(), "alice", None, |_| {});
    assert!(matches!(again, Err(Error::InvalidState { .. })));
    harness.connection.reset();
    harness.connect()?;
    assert_eq!(harness.connection.phase(), Phase::Preauth);
    Ok(())
}

#[test]
fn connect_to_closed_port_fails() -> anyhow::Result<()> {
    let mut harness = Harness::new(|_| {})?;
    let closed = std::net::TcpListener::bind("127.0.0.1:0")?;
    let address = crate::address::Address::new(
        "127.0.0.1",
        closed.local_addr()?.port(),
    );
    drop(closed);

    let (result, callback) = capture::<Result<()>>();
    harness.connection.connect(address, "alice", None, callback)?;
    harness.turn_until("refusal", || result.borrow().is_some())?;

    assert!(matches!(take(&result), Err(Error::Io(_))));
    assert_eq!(harness.connection.phase(), Phase::Error);
    assert_eq!(harness.server.with(|script| script.sessions), 0);
    Ok(())
}

#[test]
fn unclaimed_error_is_delivered_once() -> anyhow::Result<()> {
    let harness = Harness::connected(|_| {})?;

    harness.connection.on_ready(Readiness::HANGUP);
    assert_eq!(harness.connection.phase(), Phase::Error);

    let first = harness
        .connection
        .open_channel(ChannelKind::Shell, None, |_| {});
    assert!(matches!(first, Err(Error::Hangup)));

    let second = harness
        .connection
        .open_channel(ChannelKind::Shell, None, |_| {});
    assert!(matches!(second, Err(Error::InvalidState { .. })));
    Ok(())
}

#[test]
fn error_is_broadcast_to_channel_operations() -> anyhow::Result<()> {
    let mut harness = Harness::connected(|_| {})?;
    let first = harness.open(ChannelKind::Shell)?;
    let second = harness.open(ChannelKind::Exec("top".into()))?;

    let (read_a, callback) = capture::<Result<Vec<u8>>>();
    first.input_stream().read(64, None, callback)?;
    let (read_b, callback) = capture::<Result<Vec<u8>>>();
    second.input_stream().read(64, None, callback)?;

    harness.connection.on_ready(Readiness::READABLE | Readiness::HANGUP);

    assert!(matches!(take(&read_a), Err(Error::Hangup)));
    assert!(matches!(take(&read_b), Err(Error::Hangup)));
    assert!(first.is_orphaned() && second.is_orphaned());

    let next = harness
        .connection
        .open_channel(ChannelKind::Shell, None, |_| {});
    assert!(matches!(next, Err(Error::InvalidState { .. })));
    Ok(())
}

#[test]
fn reset_is_idempotent() -> anyhow::Result<()> {
    let mut harness = Harness::connected(|_| {})?;
    let channel = harness.open(ChannelKind::Shell)?;
    let (read, callback) = capture::<Result<Vec<u8>>>();
    channel.input_stream().read(64, None, callback)?;
    harness.events.drain();

    harness.connection.reset();

    assert!(matches!(take(&read), Err(Error::Disconnected)));
    assert_eq!(harness.connection.phase(), Phase::Disconnected);
    assert!(channel.is_orphaned());
    assert_eq!(harness.connection.channel_count(), 0);
    assert_eq!(harness.connection.socket_interest(), None);
    assert_eq!(
        harness.events.drain(),
        vec![PhaseChange {
            old: Phase::Connected,
            new: Phase::Disconnected
        }]
    );

    harness.connection.reset();
    assert!(harness.events.drain().is_empty());
    assert_eq!(harness.runtime.handle().registered(), 0);
    Ok(())
}

#[test]
fn reset_discards_cached_error() -> anyhow::Result<()> {
    let mut harness = Harness::connected(|_| {})?;
    harness.connection.on_ready(Readiness::ERROR);
    assert_eq!(harness.connection.phase(), Phase::Error);

    harness.connection.reset();
    let refused = harness
        .connection
        .open_channel(ChannelKind::Shell, None, |_| {});
    assert!(matches!(
        refused,
        Err(Error::InvalidState {
            phase: Phase::Disconnected,
            ..
        })
    ));

    harness.connect()?;
    assert_eq!(harness.connection.phase(), Phase::Preauth);
    Ok(())
}

#[test]
fn dropping_connection_resolves_pending_operations() -> anyhow::Result<()> {
    let harness = Harness::connected(|script| script.open_blocked = true)?;
    let (open, callback) = capture::<Result<Channel>>();
    harness
        .connection
        .open_channel(ChannelKind::Shell, None, callback)?;
    assert!(open.borrow().is_none());

    let Harness {
        connection, events, ..
    } = harness;
    drop(connection);

    assert!(matches!(take(&open), Err(Error::Disconnected)));
    assert_eq!(
        events.drain().last().map(|change| change.new),
        Some(Phase::Disconnected)
    );
    Ok(())
}

#[test]
fn concurrent_opens_resolve_independently() -> anyhow::Result<()> {
    let harness = Harness::connected(|script| script.open_blocked = true)?;

    let (shell, callback) = capture::<Result<Channel>>();
    harness
        .connection
        .open_channel(ChannelKind::Shell, None, callback)?;
    let (exec, callback) = capture::<Result<Channel>>();
    harness.connection.open_channel(
        ChannelKind::Exec("uptime".into()),
        None,
        callback,
    )?;

    harness.server.with(|script| script.open_blocked = false);
    harness.connection.on_writable();

    let shell = take(&shell)?;
    let exec = take(&exec)?;
    assert_ne!(shell.id(), exec.id());
    assert_eq!(harness.connection.channel_count(), 2);
    assert_eq!(
        harness.server.channel(1).borrow().started,
        Some(ChannelKind::Exec("uptime".into()))
    );
    Ok(())
}

#[test]
fn cancelled_open_resolves_on_next_pump() -> anyhow::Result<()> {
    let harness = Harness::connected(|script| script.open_blocked = true)?;
    let token = Cancellable::new();

    let (open, callback) = capture::<Result<Channel>>();
    harness
        .connection
        .open_channel(ChannelKind::Shell, Some(&token), callback)?;
    token.cancel();
    assert!(open.borrow().is_none());

    harness.connection.on_readable();
    assert!(matches!(take(&open), Err(Error::Cancelled)));
    assert_eq!(harness.connection.phase(), Phase::Connected);
    Ok(())
}

#[test]
fn pty_rejection_only_fails_the_open() -> anyhow::Result<()> {
    let mut harness = Harness::connected(|script| {
        script.pty_error = Some(Error::Protocol {
            context: "pty request rejected",
            message: "denied".into(),
        });
    })?;

    let (open, callback) = capture::<Result<Channel>>();
    harness
        .connection
        .open_channel(ChannelKind::Shell, None, callback)?;
    assert!(matches!(take(&open), Err(Error::Protocol { .. })));
    assert_eq!(harness.connection.phase(), Phase::Connected);

    let channel = harness.open(ChannelKind::Shell)?;
    assert!(channel.has_pty());
    Ok(())
}

#[test]
fn socket_is_rearmed_only_when_directions_change() -> anyhow::Result<()> {
    let harness = Harness::connected(|_| {})?;
    let rearms = harness.connection.socket_rearms();
    assert_eq!(harness.connection.socket_interest(), Some(Readiness::READABLE));

    for _ in 0..3 {
        harness.connection.on_readable();
    }
    assert_eq!(harness.connection.socket_rearms(), rearms);

    harness
        .server
        .with(|script| script.directions = Directions::Outbound);
    harness.connection.on_readable();
    assert_eq!(harness.connection.socket_rearms(), rearms + 1);
    assert_eq!(harness.connection.socket_interest(), Some(Readiness::WRITABLE));
    Ok(())
}

#[test]
fn phase_changes_are_reported_once() -> anyhow::Result<()> {
    let harness = Harness::connected(|_| {})?;
    let late = harness.connection.subscribe();

    harness.connection.on_readable();
    harness.connection.on_writable();
    assert!(late.try_recv().is_none());

    harness.connection.reset();
    assert_eq!(
        late.drain(),
        vec![PhaseChange {
            old: Phase::Connected,
            new: Phase::Disconnected
        }]
    );
    Ok(())
}
