//! Connection parameters handed to `connect()` as an immutable snapshot.

use secrecy::SecretString;
use std::time::Duration;

/// How long a tool invocation stays visible when no newer one replaces it.
///
/// The wire protocol has no "tool finished" event, so this is a display
/// heuristic rather than a protocol guarantee.
pub const DEFAULT_TOOL_VISIBILITY: Duration = Duration::from_secs(2);
/// Upper bound on offer/answer/ICE before the attempt is abandoned.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Everything a single connection attempt needs to know.
///
/// A snapshot is read once per `connect()` and never re-read mid-session.
#[derive(Debug)]
pub struct ConnectionConfig {
    /// Signaling endpoint. `ws://`/`wss://` selects WebSocket signaling,
    /// `http://`/`https://` selects the HTTP offer endpoint.
    pub endpoint_url: String,
    pub credential_key: Option<SecretString>,
    pub ice_servers: Vec<String>,
    pub tool_visibility: Duration,
    pub negotiation_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            credential_key: None,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            tool_visibility: DEFAULT_TOOL_VISIBILITY,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    pub fn with_credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_tool_visibility(mut self, window: Duration) -> Self {
        self.tool_visibility = window;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

/// Supplies connection parameters.
///
/// Implementations may read files or the environment; the session only calls
/// [`ConfigProvider::snapshot`] once per connect trigger.
pub trait ConfigProvider: Send + Sync {
    type Error: std::fmt::Display;

    fn snapshot(&self) -> Result<ConnectionConfig, Self::Error>;
}
