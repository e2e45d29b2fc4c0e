//! The minimal HTTP flow model the authentication hooks operate on.
//! The surrounding proxy owns the real flows and adapts them to these types.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use crate::log_utils;


static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(0);


/// Opaque handle of a client connection, stable for the connection lifetime
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// A client connection as seen by the proxy
#[derive(Clone, Debug)]
pub struct ClientConnection {
    id: ConnectionId,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    /// Header names are matched case-insensitively
    pub headers: HeaderMap,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A single request/response exchange over a client connection
#[derive(Debug)]
pub struct Flow {
    id: u64,
    pub client_conn: ClientConnection,
    pub request: Request,
    /// Once set, the proxy must answer with it instead of forwarding the request
    pub response: Option<Response>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl ClientConnection {
    /// Make a connection with a fresh process-unique identifier
    pub fn new() -> Self {
        Self::with_id(ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn with_id(id: ConnectionId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl Flow {
    pub fn new(client_conn: ClientConnection, request: Request) -> Self {
        Self {
            id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
            client_conn,
            request,
            response: None,
            metadata: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The logging prefix of the flow: `CLIENT=<conn>/FLOW=<flow>`
    pub fn log_id(&self) -> log_utils::IdChain<u64> {
        log_utils::IdChain::from(log_utils::IdItem::new(
            log_utils::CLIENT_ID_FMT, self.client_conn.id().get(),
        )).extended(log_utils::IdItem::new(log_utils::FLOW_ID_FMT, self.id))
    }
}
