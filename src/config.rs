//! Server and client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signaling::{DEFAULT_RELAY_PORT, DEFAULT_SIGNALING_PORT};

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_ROOM_CAPACITY: usize = 2;
pub const DEFAULT_FALLBACK_DEADLINE: Duration = Duration::from_millis(5000);

const PUBLIC_STUN_URLS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_host: String,
    pub signaling_port: u16,
    pub relay_port: u16,
    pub room_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            signaling_port: DEFAULT_SIGNALING_PORT,
            relay_port: DEFAULT_RELAY_PORT,
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Reads `BIND_HOST`, `WS_SIGNAL_PORT`, `WS_RELAY_PORT` and `ROOM_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_host: lookup("BIND_HOST").unwrap_or(defaults.bind_host),
            signaling_port: parse_or("WS_SIGNAL_PORT", &lookup, defaults.signaling_port),
            relay_port: parse_or("WS_RELAY_PORT", &lookup, defaults.relay_port),
            room_capacity: parse_or("ROOM_CAPACITY", &lookup, defaults.room_capacity).max(1),
        }
    }

    pub fn signaling_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.signaling_port)
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.relay_port)
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
    }
}

/// NAT-traversal server descriptor handed to the direct-session primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Public STUN list used when no configuration is available.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun(PUBLIC_STUN_URLS)]
}

/// Source of the ICE server list, looked up once per session.
pub trait IceServerSource {
    type Error: std::fmt::Display;

    fn ice_servers(&self) -> Result<Vec<IceServer>, Self::Error>;
}

/// Fixed ICE list, e.g. from a config file.
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

impl IceServerSource for StaticIceServers {
    type Error = std::convert::Infallible;

    fn ice_servers(&self) -> Result<Vec<IceServer>, Self::Error> {
        Ok(self.0.clone())
    }
}

/// Looks up the ICE list, falling back to the public default on error or
/// when the source has nothing to offer.
pub fn resolve_ice_servers<S: IceServerSource>(source: &S) -> Vec<IceServer> {
    match source.ice_servers() {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => {
            debug!("ICE source is empty, using public defaults");
            default_ice_servers()
        }
        Err(e) => {
            warn!("ICE lookup failed ({}), using public defaults", e);
            default_ice_servers()
        }
    }
}

/// Object-safe view of an [`IceServerSource`] with the fallback applied.
trait IceLookup: Send + Sync {
    fn lookup(&self) -> Vec<IceServer>;
}

impl<S: IceServerSource + Send + Sync> IceLookup for S {
    fn lookup(&self) -> Vec<IceServer> {
        resolve_ice_servers(self)
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    /// `ws://host:port` of the signaling endpoint
    pub signaling_url: String,
    /// `ws://host:port` of the relay endpoint
    pub relay_url: String,
    /// How long direct negotiation may take before falling back to the relay
    pub fallback_deadline: Duration,
    ice_source: Arc<dyn IceLookup>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("signaling_url", &self.signaling_url)
            .field("relay_url", &self.relay_url)
            .field("fallback_deadline", &self.fallback_deadline)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(signaling_url: impl Into<String>, relay_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            relay_url: relay_url.into(),
            fallback_deadline: DEFAULT_FALLBACK_DEADLINE,
            ice_source: Arc::new(StaticIceServers(default_ice_servers())),
        }
    }

    pub fn with_fallback_deadline(mut self, deadline: Duration) -> Self {
        self.fallback_deadline = deadline;
        self
    }

    /// Replaces the ICE source; it is asked again on every session start.
    pub fn with_ice_source<S>(mut self, source: S) -> Self
    where
        S: IceServerSource + Send + Sync + 'static,
    {
        self.ice_source = Arc::new(source);
        self
    }

    /// Looks up the ICE servers now, falling back to the public defaults.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_source.lookup()
    }
}
