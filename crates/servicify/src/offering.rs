//! What gets offered to the registry.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

use crate::target::TargetKind;

/// Heartbeats the registry may miss before it can treat an offering as dead.
pub const GRACE_BEATS: u32 = 3;

/// The default host a service endpoint binds.
pub const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";

/// What a caller asks to offer. Unset fields are filled in at offer time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferSpec {
    pub name: String,
    pub version: String,
    /// Defaults to [`DEFAULT_SERVICE_HOST`].
    pub host: Option<String>,
    /// `None` means "pick an ephemeral port".
    pub port: Option<u16>,
}

impl OfferSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host: None,
            port: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_SERVICE_HOST)
    }
}

/// Identifies a running service and how to call it. Fixed once the endpoint is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: TargetKind,
}

/// A service spec as the registry knows it.
///
/// `seq` increases with every offer sent for this offering, so a registry can
/// discard a heartbeat that arrives after a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    #[serde(flatten)]
    pub spec: ServiceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub load: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub expires: u64,
    #[serde(default)]
    pub seq: u64,
}

impl Offering {
    /// An unregistered offering with no load yet.
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            id: None,
            load: 0,
            expires: 0,
            seq: 0,
        }
    }

    /// Prepares the next offer: new load, new expiry, next sequence number.
    pub fn refresh(&mut self, load: u64, now: SystemTime, interval: Duration) {
        self.load = load;
        self.expires = expires_at(now, interval);
        self.seq += 1;
    }
}

/// `now + GRACE_BEATS × interval`, in milliseconds since the Unix epoch.
pub fn expires_at(now: SystemTime, interval: Duration) -> u64 {
    unix_millis(now).saturating_add(interval.as_millis() as u64 * GRACE_BEATS as u64)
}

pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
