//! Connect to a remote shell over SSH, run a command and print its output.
//!
//! Required environment:
//! - `SSH_EXAMPLE_TARGET` must contain `[user@]host[:port]`.
//! - `SSH_EXAMPLE_USER` sets the username when the target has none
//!   (defaults to `root`).
//! - `SSH_EXAMPLE_PASSWORD` optionally provides a password; if omitted,
//!   ssh-agent identities and default key files are tried.
//!
//! Run with:
//! `cargo run --package otty-ssh --example ssh_shell`

use std::cell::RefCell;
use std::env;
use std::error::Error;
use std::rc::Rc;
use std::time::Duration;

use otty_ssh::{
    AuthMechanism, AuthOutcome, Channel, ChannelKind, Connection,
    Destination, Phase, Runtime, StaticCredentials,
};

const TICK: Duration = Duration::from_millis(50);

type Slot<T> = Rc<RefCell<Option<otty_ssh::Result<T>>>>;

fn slot<T>() -> Slot<T> {
    Rc::new(RefCell::new(None))
}

fn wait<T>(runtime: &mut Runtime, slot: &Slot<T>) -> otty_ssh::Result<T> {
    runtime.run_until(|| slot.borrow().is_some(), TICK)?;
    slot.borrow_mut().take().unwrap_or(Err(otty_ssh::Error::Disconnected))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let target = env::var("SSH_EXAMPLE_TARGET")
        .expect("Set SSH_EXAMPLE_TARGET before running the example");
    let destination: Destination = target.parse()?;
    let user = destination
        .user
        .or_else(|| env::var("SSH_EXAMPLE_USER").ok())
        .unwrap_or_else(|| "root".into());

    let mut runtime = Runtime::new()?;
    let connection = Connection::new(&runtime.handle());
    let password = env::var("SSH_EXAMPLE_PASSWORD").ok();
    if let Some(password) = &password {
        connection.set_credentials(StaticCredentials::new(password.clone()));
    }

    let connected = slot();
    let sink = Rc::clone(&connected);
    connection.connect(destination.address, &user, None, move |result| {
        *sink.borrow_mut() = Some(result);
    })?;
    wait(&mut runtime, &connected)?;

    if let Some(key) = connection.host_key() {
        println!(
            "Host key {} {}",
            key.algorithm(),
            key.sha256_fingerprint().unwrap_or_default()
        );
    }

    let negotiated = slot();
    let sink = Rc::clone(&negotiated);
    connection.negotiate(None, move |result| {
        *sink.borrow_mut() = Some(result);
    })?;

    if wait(&mut runtime, &negotiated)? == Phase::AuthenticationRequired {
        let offered = connection.authentication_mechanisms()?;
        let mut order = vec![AuthMechanism::PublicKey];
        if password.is_some() {
            order.push(AuthMechanism::Password);
            order.push(AuthMechanism::KeyboardInteractive);
        }

        for mechanism in order.into_iter().filter(|m| offered.contains(m)) {
            let outcome = slot();
            let sink = Rc::clone(&outcome);
            connection.authenticate(mechanism.clone(), None, move |result| {
                *sink.borrow_mut() = Some(result);
            })?;
            match wait(&mut runtime, &outcome) {
                Ok(AuthOutcome::Success) => break,
                Ok(outcome) => println!("{mechanism}: {outcome:?}"),
                Err(err) => println!("{mechanism}: {err}"),
            }
        }
    }

    if connection.phase() != Phase::Connected {
        return Err(format!("could not authenticate as {user}").into());
    }

    let opened: Slot<Channel> = slot();
    let sink = Rc::clone(&opened);
    connection.open_channel(ChannelKind::Shell, None, move |result| {
        *sink.borrow_mut() = Some(result);
    })?;
    let channel = wait(&mut runtime, &opened)?;

    let output = channel.output_stream();
    let command: &[u8] =
        b"echo 'Hello from remote otty-ssh session' && uname -a\nexit\n";
    let mut offset = 0;
    while offset < command.len() {
        offset += output.write_blocking(&command[offset..])?;
    }

    let input = channel.input_stream();
    let mut buffer = [0u8; 4096];
    loop {
        let read = input.read_blocking(&mut buffer)?;
        if read == 0 {
            break;
        }
        print!("{}", String::from_utf8_lossy(&buffer[..read]));
    }

    output.close_blocking()?;
    match channel.exit_status() {
        Some(code) => println!("\nRemote shell terminated with code {code}"),
        None => println!("\nRemote shell closed"),
    }

    connection.reset();
    Ok(())
}
