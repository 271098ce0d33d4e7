use secrecy::{ExposeSecret, SecretString};

/// Single question of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptField {
    pub text: String,
    /// Whether the answer may be shown while typed.
    pub echo: bool,
}

/// Caller-supplied source of secrets used during authentication.
///
/// Implementations must not call back into the connection that invokes
/// them.
pub trait CredentialPrompt {
    /// Password for `username` on `host`. `None` declines the attempt.
    fn password(&mut self, username: &str, host: &str) -> Option<SecretString>;

    /// Answers for one keyboard-interactive round, one per field.
    fn keyboard_interactive(
        &mut self,
        _username: &str,
        _instructions: &str,
        _fields: &[PromptField],
    ) -> Option<Vec<SecretString>> {
        None
    }
}

/// Prompt that answers every question with one fixed password.
pub struct StaticCredentials {
    password: SecretString,
}

impl StaticCredentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: SecretString::from(password.into()),
        }
    }

    fn answer(&self) -> SecretString {
        SecretString::from(self.password.expose_secret().to_owned())
    }
}

impl CredentialPrompt for StaticCredentials {
    fn password(&mut self, _: &str, _: &str) -> Option<SecretString> {
        Some(self.answer())
    }

    fn keyboard_interactive(
        &mut self,
        _: &str,
        _: &str,
        fields: &[PromptField],
    ) -> Option<Vec<SecretString>> {
        Some(fields.iter().map(|_| self.answer()).collect())
    }
}
