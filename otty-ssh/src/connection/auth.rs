use std::task::Poll;

use secrecy::{ExposeSecret, SecretString};

use crate::auth::{AuthMechanism, AuthOutcome};
use crate::credentials::CredentialPrompt;
use crate::error::{Error, Result};
use crate::session::SessionAdapter;
use crate::task::Task;

/// Pending `authenticate` call.
pub(crate) struct AuthRequest {
    mechanism: AuthMechanism,
    password: Option<SecretString>,
    task: Task<AuthOutcome>,
}

impl AuthRequest {
    pub(crate) fn new(
        mechanism: AuthMechanism,
        password: Option<SecretString>,
        task: Task<AuthOutcome>,
    ) -> Self {
        Self {
            mechanism,
            password,
            task,
        }
    }

    pub(crate) fn mechanism(&self) -> &AuthMechanism {
        &self.mechanism
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub(crate) fn into_task(self) -> Task<AuthOutcome> {
        self.task
    }

    /// Drive the mechanism one non-blocking step.
    pub(crate) fn attempt(
        &self,
        session: &mut dyn SessionAdapter,
        username: &str,
        credentials: &mut Option<Box<dyn CredentialPrompt>>,
    ) -> Poll<Result<AuthOutcome>> {
        match &self.mechanism {
            AuthMechanism::Password => match &self.password {
                Some(password) => {
                    session.auth_password(username, password.expose_secret())
                },
                None => Poll::Ready(Err(Error::NoCredentials)),
            },
            AuthMechanism::PublicKey => session.auth_publickey(username),
            AuthMechanism::KeyboardInteractive => match credentials {
                Some(prompt) => {
                    session.auth_keyboard_interactive(username, prompt.as_mut())
                },
                None => Poll::Ready(Err(Error::NoCredentials)),
            },
            AuthMechanism::GssapiMic => session.auth_gssapi(username),
            AuthMechanism::Other(_) => Poll::Ready(Err(
                Error::UnsupportedMechanism(self.mechanism.clone()),
            )),
        }
    }
}
