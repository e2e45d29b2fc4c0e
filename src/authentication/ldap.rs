use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use ldap3::{LdapConn, LdapConnSettings, Scope, SearchResult};
use crate::authentication::{BackendError, Credential};


/// The placeholder of a DN template substituted with the authenticating username
pub const DN_PLACEHOLDER: char = '?';

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// RFC 4511 result codes
const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;


/// Opens sessions to a directory server
pub trait DirectoryConnector: Send + Sync {
    /// Connect to the server at `url`.
    /// Fails with [`BackendError::DirectoryUnreachable`] if the server is not usable.
    fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn DirectorySession>, BackendError>;
}

/// An established directory connection
pub trait DirectorySession {
    /// Try a simple bind. `Ok(false)` means the server refused the credentials.
    fn bind(&mut self, dn: &str, password: &str) -> Result<bool, BackendError>;

    /// Check whether the entry `dn` itself matches the search filter
    fn has_entry(&mut self, dn: &str, filter: &str) -> Result<bool, BackendError>;
}

/// The backend validating a credential with a bind to a directory server
pub struct DirectoryService {
    server: String,
    tls: bool,
    dn_template: String,
    filter: String,
    timeout: Duration,
    connector: Arc<dyn DirectoryConnector>,
}

/// [`DirectoryConnector`] speaking LDAP through the `ldap3` synchronous client
pub struct Ldap3Connector;

struct Ldap3Session {
    conn: LdapConn,
    url: String,
    timeout: Duration,
}

impl DirectoryService {
    pub fn new(server: &str, tls: bool, dn_template: &str, filter: &str) -> Self {
        if dn_template.matches(DN_PLACEHOLDER).count() != 1 {
            warn!("DN template should contain exactly one `{}` placeholder: {}", DN_PLACEHOLDER, dn_template);
        }

        Self {
            server: server.to_string(),
            tls,
            dn_template: dn_template.to_string(),
            filter: filter.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connector: Arc::new(Ldap3Connector),
        }
    }

    /// Set the time out of the connection establishment and of each directory operation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the directory client
    pub fn with_connector(mut self, connector: Arc<dyn DirectoryConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn url(&self) -> String {
        format!("{}://{}", if self.tls { "ldaps" } else { "ldap" }, self.server)
    }

    /// Substitute the DN-escaped username into the template placeholder
    pub fn user_dn(&self, username: &str) -> String {
        self.dn_template.replacen(DN_PLACEHOLDER, &ldap3::dn_escape(username), 1)
    }

    /// The filter a bound entry must match.
    /// A bare value is an object class, a parenthesized value is a complete LDAP filter.
    pub fn search_filter(&self) -> String {
        if self.filter.starts_with('(') {
            self.filter.clone()
        } else {
            format!("(objectClass={})", ldap3::ldap_escape(self.filter.as_str()))
        }
    }

    pub fn validate(&self, credential: &Credential) -> Result<bool, BackendError> {
        // most servers treat a bind with an empty password as a successful unauthenticated one
        if credential.password.is_empty() {
            debug!("Empty password for {}, skipping directory bind", credential.username);
            return Ok(false);
        }

        let dn = self.user_dn(&credential.username);
        let mut session = self.connector.connect(&self.url(), self.timeout)?;
        if !session.bind(&dn, &credential.password)? {
            debug!("Directory bind refused: dn={}", dn);
            return Ok(false);
        }

        let matched = session.has_entry(&dn, &self.search_filter())?;
        if !matched {
            debug!("Bound entry does not match filter: dn={} filter={}", dn, self.filter);
        }
        Ok(matched)
    }
}

impl Debug for DirectoryService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryService")
            .field("server", &self.server)
            .field("tls", &self.tls)
            .field("dn_template", &self.dn_template)
            .field("filter", &self.filter)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DirectoryConnector for Ldap3Connector {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn DirectorySession>, BackendError> {
        let settings = LdapConnSettings::new().set_conn_timeout(timeout);
        let conn = LdapConn::with_settings(settings, url)
            .map_err(|e| unreachable(url, e))?;
        Ok(Box::new(Ldap3Session {
            conn,
            url: url.to_string(),
            timeout,
        }))
    }
}

impl DirectorySession for Ldap3Session {
    fn bind(&mut self, dn: &str, password: &str) -> Result<bool, BackendError> {
        let result = self.conn.with_timeout(self.timeout)
            .simple_bind(dn, password)
            .map_err(|e| unreachable(&self.url, e))?;
        verdict(&self.url, result.rc, &result.text)
    }

    fn has_entry(&mut self, dn: &str, filter: &str) -> Result<bool, BackendError> {
        let SearchResult(entries, result) = self.conn.with_timeout(self.timeout)
            .search(dn, Scope::Base, filter, vec!["objectClass"])
            .map_err(|e| unreachable(&self.url, e))?;
        Ok(verdict(&self.url, result.rc, &result.text)? && !entries.is_empty())
    }
}

impl Drop for Ldap3Session {
    fn drop(&mut self) {
        let _ = self.conn.unbind();
    }
}

/// Interpret the result of a bind or a search.
/// A refused bind or a missing entry is a verdict against the client, anything
/// else the server could not complete is a backend failure.
fn verdict(url: &str, rc: u32, text: &str) -> Result<bool, BackendError> {
    match rc {
        RC_SUCCESS => Ok(true),
        RC_INVALID_CREDENTIALS | RC_NO_SUCH_OBJECT => Ok(false),
        RC_BUSY | RC_UNAVAILABLE => Err(BackendError::DirectoryUnreachable {
            server: url.to_string(),
            reason: format!("result code {}: {}", rc, text),
        }),
        _ => Err(BackendError::DirectoryFailure {
            server: url.to_string(),
            code: rc,
            reason: text.to_string(),
        }),
    }
}

fn unreachable(url: &str, e: ldap3::LdapError) -> BackendError {
    BackendError::DirectoryUnreachable {
        server: url.to_string(),
        reason: e.to_string(),
    }
}
