//! The authentication hooks of the proxy pipeline

use std::sync::{Arc, Mutex};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    WWW_AUTHENTICATE,
};
use http::StatusCode;
use crate::authentication::basic::CodecError;
use crate::authentication::{basic, Backend, BackendError, Credential};
use crate::cache::AuthCache;
use crate::flow::{ConnectionId, Flow, Response};
use crate::log_id;
use crate::settings::{self, ConfigError, ProxyMode, Settings};


/// The flow metadata key of the accepted identity
pub const METADATA_KEY: &str = "proxyauth";

const CHALLENGE_VALUE: &str = "Basic realm=\"proxy\"";


/// Guards the proxy: every flow either passes untouched or gets a challenge
/// response which the pipeline must send back instead of forwarding the request.
pub struct ProxyAuth {
    config: ArcSwap<Snapshot>,
    /// Serializes reconfigurations, validations never take it
    reconfigure_lock: Mutex<()>,
    cache: AuthCache,
}

/// The configuration a validation runs against from its start to its end
struct Snapshot {
    generation: u64,
    mode: ProxyMode,
    backend: Backend,
}

/// What to look at and what to answer in a proxy mode
struct Challenge {
    credential_header: HeaderName,
    status: StatusCode,
    challenge_header: HeaderName,
}

#[derive(Debug, thiserror::Error)]
enum Denial {
    #[error("no {0} header")]
    Missing(HeaderName),
    #[error("{0}")]
    Malformed(CodecError),
    #[error("empty username")]
    EmptyUsername,
    #[error("credentials of {0} rejected")]
    Rejected(String),
    #[error("{0}")]
    Backend(BackendError),
}

impl ProxyAuth {
    /// Make a guard with authentication disabled in the regular mode
    pub fn new() -> Self {
        Self {
            config: ArcSwap::from_pointee(Snapshot {
                generation: 0,
                mode: ProxyMode::default(),
                backend: Backend::Disabled,
            }),
            reconfigure_lock: Mutex::new(()),
            cache: AuthCache::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> settings::Result<Self> {
        let x = Self::new();
        x.configure(settings)?;
        Ok(x)
    }

    /// Apply new settings.
    /// On error the active configuration stays in effect.
    pub fn configure(&self, settings: &Settings) -> settings::Result<()> {
        let backend = settings.resolve()?;
        self.install(settings.mode(), backend);
        Ok(())
    }

    /// Apply a backend specification, see [`settings::resolve`].
    /// On error the active configuration stays in effect.
    pub fn configure_spec(&self, spec: Option<&str>, mode: ProxyMode) -> Result<(), ConfigError> {
        let backend = settings::resolve(spec, mode)?;
        self.install(mode, backend);
        Ok(())
    }

    fn install(&self, mode: ProxyMode, backend: Backend) {
        let _guard = self.reconfigure_lock.lock().unwrap_or_else(|e| e.into_inner());
        let generation = self.config.load().generation + 1;
        info!("Proxy authentication: mode={} backend={:?}", mode, backend);
        self.config.store(Arc::new(Snapshot { generation, mode, backend }));
        // entries of the previous generations are already invisible, this just reclaims them
        self.cache.clear();
    }

    /// Whether clients are challenged at all
    pub fn enabled(&self) -> bool {
        self.config.load().backend.is_enabled()
    }

    pub fn mode(&self) -> ProxyMode {
        self.config.load().mode
    }

    /// The number of connections with a remembered credential
    pub fn cached_connections(&self) -> usize {
        self.cache.len()
    }

    /// The `CONNECT` hook of the regular mode.
    /// On success the credential is remembered for the whole client connection.
    pub fn on_connect(&self, flow: &mut Flow) {
        let snapshot = self.config.load_full();
        if !snapshot.backend.is_enabled() || snapshot.mode != ProxyMode::Regular {
            return;
        }
        if self.pass_cached(&snapshot, flow) {
            return;
        }
        if let Some(challenge) = Challenge::for_mode(snapshot.mode) {
            self.authenticate_with(&snapshot, &challenge, flow);
        }
    }

    /// The request headers hook, run for every flow in every mode
    pub fn on_request_headers(&self, flow: &mut Flow) {
        let snapshot = self.config.load_full();
        if !snapshot.backend.is_enabled() || self.pass_cached(&snapshot, flow) {
            return;
        }
        if let Some(challenge) = Challenge::for_mode(snapshot.mode) {
            self.authenticate_with(&snapshot, &challenge, flow);
        }
    }

    /// The client connection lifecycle hook
    pub fn on_client_disconnected(&self, conn: ConnectionId) {
        if self.cache.remove(conn) {
            trace!("Forgot credentials of closed connection {}", conn.get());
        }
    }

    /// Check the flow's credentials without touching the flow or the cache
    pub fn check(&self, flow: &Flow) -> Option<Credential> {
        let snapshot = self.config.load_full();
        let challenge = Challenge::for_mode(snapshot.mode)?;
        Self::verify(&snapshot, &challenge, flow).ok()
    }

    /// Check the flow's credentials. On success strip them from the request and record
    /// the identity in the metadata, otherwise set the challenge response.
    pub fn authenticate(&self, flow: &mut Flow) -> bool {
        let snapshot = self.config.load_full();
        if !snapshot.backend.is_enabled() {
            return true;
        }
        match Challenge::for_mode(snapshot.mode) {
            Some(challenge) => self.authenticate_with(&snapshot, &challenge, flow),
            None => true,
        }
    }

    /// The identity accepted for the flow, if any
    pub fn accepted_identity(flow: &Flow) -> Option<Credential> {
        flow.metadata.get(METADATA_KEY)
            .and_then(|x| serde_json::from_value(x.clone()).ok())
    }

    fn pass_cached(&self, snapshot: &Snapshot, flow: &mut Flow) -> bool {
        let credential = match self.cache.get(flow.client_conn.id(), snapshot.generation) {
            Some(x) => x,
            None => return false,
        };

        log_id!(trace, flow.log_id(), "Connection already authenticated as {}", credential.username);
        if let Some(challenge) = Challenge::for_mode(snapshot.mode) {
            flow.request.headers.remove(&challenge.credential_header);
        }
        stamp_identity(flow, &credential);
        true
    }

    fn authenticate_with(&self, snapshot: &Snapshot, challenge: &Challenge, flow: &mut Flow) -> bool {
        match Self::verify(snapshot, challenge, flow) {
            Ok(credential) => {
                log_id!(debug, flow.log_id(), "Authenticated as {}", credential.username);
                flow.request.headers.remove(&challenge.credential_header);
                stamp_identity(flow, &credential);
                self.cache.insert(flow.client_conn.id(), snapshot.generation, credential);
                true
            }
            Err(e) => {
                match &e {
                    Denial::Backend(_) => log_id!(warn, flow.log_id(), "Authentication backend failure: {}", e),
                    _ => log_id!(debug, flow.log_id(), "Authentication failed: {}", e),
                }
                flow.response = Some(challenge.response());
                false
            }
        }
    }

    fn verify(snapshot: &Snapshot, challenge: &Challenge, flow: &Flow) -> Result<Credential, Denial> {
        let token = flow.request.headers.get(&challenge.credential_header)
            .ok_or_else(|| Denial::Missing(challenge.credential_header.clone()))?
            .to_str()
            .map_err(|_| Denial::Malformed(CodecError::MalformedToken))?;
        let credential = basic::decode(token).map_err(Denial::Malformed)?;
        // empty identity is never accepted, whatever the backend is
        if credential.username.is_empty() {
            return Err(Denial::EmptyUsername);
        }

        match snapshot.backend.validate(&credential) {
            Ok(true) => Ok(credential),
            Ok(false) => Err(Denial::Rejected(credential.username)),
            Err(e) => Err(Denial::Backend(e)),
        }
    }
}

impl Default for ProxyAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Challenge {
    fn for_mode(mode: ProxyMode) -> Option<Self> {
        match mode {
            ProxyMode::Regular => Some(Self {
                credential_header: PROXY_AUTHORIZATION,
                status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                challenge_header: PROXY_AUTHENTICATE,
            }),
            ProxyMode::Reverse => Some(Self {
                credential_header: AUTHORIZATION,
                status: StatusCode::UNAUTHORIZED,
                challenge_header: WWW_AUTHENTICATE,
            }),
            ProxyMode::Transparent | ProxyMode::Socks5 => None,
        }
    }

    fn response(&self) -> Response {
        let mut response = Response::new(self.status);
        response.headers.insert(self.challenge_header.clone(), HeaderValue::from_static(CHALLENGE_VALUE));
        response.headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response.body = Bytes::from_static(self.status.canonical_reason().unwrap_or("").as_bytes());
        response
    }
}

fn stamp_identity(flow: &mut Flow, credential: &Credential) {
    flow.metadata.insert(
        METADATA_KEY.to_string(),
        serde_json::json!({
            "username": credential.username,
            "password": credential.password,
        }),
    );
}
