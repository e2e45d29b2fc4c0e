use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use serde::Deserialize;
use crate::authentication::htpasswd::PasswordFile;
use crate::authentication::ldap::DirectoryService;
use crate::authentication::Backend;


const ANY_USER_SPEC: &str = "any";
const PASSWORD_FILE_PREFIX: char = '@';
const LDAP_SCHEME: &str = "ldap";
const LDAPS_SCHEME: &str = "ldaps";


pub type Result<T> = std::result::Result<T, ConfigError>;

/// The operating mode of the proxy
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ProxyMode {
    /// Explicit forward proxy, clients send `CONNECT`
    #[default]
    Regular,
    /// The proxy stands in for a fixed upstream
    Reverse,
    Transparent,
    Socks5,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed proxyauth specification: {0}")]
    MalformedSpec(String),
    #[error("unsupported proxyauth specification: {0}")]
    UnsupportedScheme(String),
    #[error("could not load password file {path}: {reason}")]
    FileNotReadable { path: String, reason: String },
    #[error("proxy authentication is not supported in {0} mode")]
    IncompatibleMode(ProxyMode),
    #[error("invalid proxy mode: {0}")]
    InvalidMode(String),
    #[error("invalid directory timeout: {0}")]
    DirectoryTimeout(String),
}

/// The authentication related part of the proxy configuration
#[derive(Deserialize)]
pub struct Settings {
    /// The operating mode of the proxy
    #[serde(default)]
    pub(crate) mode: ProxyMode,
    /// The backend specification, see [`resolve`].
    /// Absent or empty means no authentication.
    #[serde(default)]
    pub(crate) proxyauth: Option<String>,
    /// Time out of directory server connections and operations
    #[serde(default = "Settings::default_directory_timeout")]
    #[serde(rename(deserialize = "directory_timeout_secs"))]
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub(crate) directory_timeout: Duration,
}

pub struct SettingsBuilder {
    settings: Settings,
}

impl Display for ProxyMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProxyMode::Regular => "regular",
            ProxyMode::Reverse => "reverse",
            ProxyMode::Transparent => "transparent",
            ProxyMode::Socks5 => "socks5",
        })
    }
}

impl FromStr for ProxyMode {
    type Err = ConfigError;

    /// Accepts the bare mode names. The reverse mode may carry its upstream
    /// specification, e.g. `reverse:https://example.com`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regular" => Ok(ProxyMode::Regular),
            "reverse" => Ok(ProxyMode::Reverse),
            "transparent" => Ok(ProxyMode::Transparent),
            "socks5" => Ok(ProxyMode::Socks5),
            x if x.starts_with("reverse:") => Ok(ProxyMode::Reverse),
            x => Err(ConfigError::InvalidMode(x.to_string())),
        }
    }
}

impl TryFrom<String> for ProxyMode {
    type Error = ConfigError;

    fn try_from(v: String) -> Result<Self> {
        v.parse()
    }
}

impl ProxyMode {
    /// Whether clients can be challenged for credentials in this mode
    pub fn supports_authentication(&self) -> bool {
        match self {
            ProxyMode::Regular | ProxyMode::Reverse => true,
            ProxyMode::Transparent | ProxyMode::Socks5 => false,
        }
    }
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    pub fn proxyauth(&self) -> Option<&str> {
        self.proxyauth.as_deref()
    }

    pub fn directory_timeout(&self) -> Duration {
        self.directory_timeout
    }

    /// Turn the settings into the backend they describe
    pub fn resolve(&self) -> Result<Backend> {
        resolve_backend(self.proxyauth(), self.mode, self.directory_timeout)
    }

    fn default_directory_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            proxyauth: None,
            directory_timeout: Settings::default_directory_timeout(),
        }
    }
}

impl SettingsBuilder {
    fn new() -> Self {
        Self {
            settings: Default::default(),
        }
    }

    /// Finalize [`Settings`]
    pub fn build(self) -> Result<Settings> {
        if self.settings.directory_timeout.is_zero() {
            return Err(ConfigError::DirectoryTimeout("Must be non-zero".to_string()));
        }

        Ok(self.settings)
    }

    /// Set the operating mode of the proxy
    pub fn mode(mut self, v: ProxyMode) -> Self {
        self.settings.mode = v;
        self
    }

    /// Set the backend specification
    pub fn proxyauth<S: Into<String>>(mut self, v: S) -> Self {
        self.settings.proxyauth = Some(v.into());
        self
    }

    /// Set time out of directory server connections and operations
    pub fn directory_timeout(mut self, v: Duration) -> Self {
        self.settings.directory_timeout = v;
        self
    }
}

/// Parse a backend specification:
///
/// | spec                            | backend                        |
/// |---------------------------------|--------------------------------|
/// | absent or empty                 | [`Backend::Disabled`]          |
/// | `any`                           | [`Backend::AnonymousAllowed`]  |
/// | `<user>:<pass>`                 | [`Backend::SingleUser`]        |
/// | `@<path>`                       | [`Backend::PasswordFile`]      |
/// | `ldap:<server>:<dn>:<filter>`   | [`Backend::DirectoryService`]  |
/// | `ldaps:<server>:<dn>:<filter>`  | the same over TLS              |
///
/// Any backend except the disabled one is incompatible with the transparent
/// and SOCKS5 modes.
pub fn resolve(spec: Option<&str>, mode: ProxyMode) -> Result<Backend> {
    resolve_backend(spec, mode, Settings::default_directory_timeout())
}

fn resolve_backend(spec: Option<&str>, mode: ProxyMode, directory_timeout: Duration) -> Result<Backend> {
    let backend = match spec {
        None | Some("") => Backend::Disabled,
        Some(ANY_USER_SPEC) => Backend::AnonymousAllowed,
        Some(x) if x.starts_with(PASSWORD_FILE_PREFIX) => {
            let path = &x[PASSWORD_FILE_PREFIX.len_utf8()..];
            Backend::PasswordFile(
                PasswordFile::new(path)
                    .map_err(|e| ConfigError::FileNotReadable {
                        path: path.to_string(),
                        reason: e.to_string(),
                    })?
            )
        }
        Some(x) => match x.split_once(':') {
            Some((scheme @ (LDAP_SCHEME | LDAPS_SCHEME), rest)) =>
                Backend::DirectoryService(
                    parse_directory(rest, scheme == LDAPS_SCHEME)?.with_timeout(directory_timeout)
                ),
            Some((user, pass)) if !pass.contains(':') => {
                if user.is_empty() {
                    return Err(ConfigError::MalformedSpec("Empty username".to_string()));
                }
                Backend::SingleUser {
                    username: user.to_string(),
                    password: pass.to_string(),
                }
            }
            Some((token, _)) => return Err(ConfigError::UnsupportedScheme(token.to_string())),
            None => return Err(ConfigError::UnsupportedScheme(x.to_string())),
        },
    };

    if backend.is_enabled() && !mode.supports_authentication() {
        return Err(ConfigError::IncompatibleMode(mode));
    }

    Ok(backend)
}

fn parse_directory(spec: &str, tls: bool) -> Result<DirectoryService> {
    let fields: Vec<&str> = spec.split(':').collect();
    match fields.as_slice() {
        [server, dn_template, filter] if fields.iter().all(|x| !x.is_empty()) =>
            Ok(DirectoryService::new(server, tls, dn_template, filter)),
        _ => Err(ConfigError::MalformedSpec(
            "Expected `ldap[s]:<server>:<dn template>:<filter>`".to_string()
        )),
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: serde::de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            write!(formatter, "a positive integer")
        }

        fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E> where E: serde::de::Error {
            if v == 0 {
                return Err(E::invalid_value(serde::de::Unexpected::Unsigned(v), &self));
            }
            Ok(v)
        }

        fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E> where E: serde::de::Error {
            match u64::try_from(v) {
                Ok(x) => self.visit_u64(x),
                Err(_) => Err(E::invalid_value(serde::de::Unexpected::Signed(v), &self)),
            }
        }
    }

    let secs = deserializer.deserialize_u64(Visitor)?;
    Ok(Duration::from_secs(secs))
}
