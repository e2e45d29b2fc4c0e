pub mod basic;
pub mod htpasswd;
pub mod ldap;


use std::fmt::{Debug, Formatter};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;


/// A username/password pair presented by a client
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// The credential validation strategy selected by the configuration.
/// New variants are only ever introduced by [`crate::settings::resolve`].
pub enum Backend {
    /// No credentials are required, a client is never challenged
    Disabled,
    /// Any credential pair is accepted, only the exchange itself is required
    AnonymousAllowed,
    /// The one and only accepted pair
    SingleUser {
        username: String,
        password: String,
    },
    /// An htpasswd-like file loaded at configuration time
    PasswordFile(htpasswd::PasswordFile),
    /// A directory server validating the credentials with a bind
    DirectoryService(ldap::DirectoryService),
}

/// A backend failure which is not a verdict on the credentials themselves
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("directory server {server} is unreachable: {reason}")]
    DirectoryUnreachable { server: String, reason: String },
    #[error("directory server {server} failed with result code {code}: {reason}")]
    DirectoryFailure { server: String, code: u32, reason: String },
    #[error("unusable password record of user {username}: {reason}")]
    PasswordRecord { username: String, reason: String },
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"__stripped__")
            .finish()
    }
}

impl Debug for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::SingleUser { username, .. } => f.debug_struct("SingleUser")
                .field("username", username)
                .finish_non_exhaustive(),
            Backend::PasswordFile(x) => f.debug_tuple("PasswordFile").field(x).finish(),
            Backend::DirectoryService(x) => f.debug_tuple("DirectoryService").field(x).finish(),
            x => f.write_str(x.kind()),
        }
    }
}

impl Backend {
    /// Whether clients have to present credentials at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Backend::Disabled)
    }

    /// Short name of the backend kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Disabled => "disabled",
            Backend::AnonymousAllowed => "any",
            Backend::SingleUser { .. } => "single-user",
            Backend::PasswordFile(_) => "password-file",
            Backend::DirectoryService(_) => "directory",
        }
    }

    /// Check the credential against the backend.
    ///
    /// `Ok(false)` means the credential was rejected. An `Err` means the backend
    /// could not reach a verdict, which callers must also treat as a rejection.
    pub fn validate(&self, credential: &Credential) -> Result<bool, BackendError> {
        match self {
            Backend::Disabled | Backend::AnonymousAllowed => Ok(true),
            Backend::SingleUser { username, password } => {
                let user_match = username.as_bytes().ct_eq(credential.username.as_bytes());
                let pass_match = password.as_bytes().ct_eq(credential.password.as_bytes());
                Ok(bool::from(user_match & pass_match))
            }
            Backend::PasswordFile(x) => x.validate(credential),
            Backend::DirectoryService(x) => x.validate(credential),
        }
    }
}
