//! Device authentication
//!
//! Gates session creation. Two modes:
//! - Open: No authentication required
//! - Token: Bearer token authentication, with optional local/LAN bypass

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authentication mode for device sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No authentication required (development/trusted network)
    #[default]
    Open,

    /// Bearer token authentication
    Token,
}

impl AuthMode {
    /// Parse from string representation
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "token" | "bearer" => Self::Token,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Token => write!(f, "token"),
        }
    }
}

/// What a device presents when it connects
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Device identifier from the connection path
    pub device_id: String,

    /// Bearer token, if supplied
    pub token: Option<String>,

    /// Peer address, if known
    pub remote: Option<IpAddr>,
}

impl Credentials {
    /// Credentials for a device with no token or address
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Attach a bearer token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach the peer address
    #[must_use]
    pub const fn with_remote(mut self, remote: IpAddr) -> Self {
        self.remote = Some(remote);
        self
    }
}

/// Decides whether a device may open a session
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the presented credentials
    async fn authenticate(&self, credentials: &Credentials) -> bool;
}

/// Gateway authentication configuration
#[derive(Debug, Clone, Serialize)]
pub struct AuthConfig {
    /// Authentication mode
    pub mode: AuthMode,

    /// Bearer token (for Token mode)
    pub token: Option<String>,

    /// Allow unauthenticated access from local/LAN addresses
    pub allow_local_bypass: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Open,
            token: None,
            allow_local_bypass: false,
        }
    }
}

impl AuthConfig {
    /// Token-mode config with the given secret
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some(token.into()),
            allow_local_bypass: false,
        }
    }

    /// Check if an IP address should bypass authentication
    #[must_use]
    pub fn should_bypass(&self, ip: Option<IpAddr>) -> bool {
        if !self.allow_local_bypass {
            return false;
        }

        let Some(ip) = ip else {
            return false;
        };

        // Allow localhost
        if ip.is_loopback() {
            return true;
        }

        // Allow LAN addresses
        match ip {
            IpAddr::V4(v4) => {
                let [a, b, ..] = v4.octets();
                // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
                a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
            }
            IpAddr::V6(v6) => {
                // fe80::/10 (link-local)
                (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        }
    }

    /// Verify a bearer token (timing-safe comparison)
    #[must_use]
    pub fn verify_token(&self, provided: &str) -> bool {
        let Some(expected) = &self.token else {
            return false;
        };

        constant_time_eq(expected.as_bytes(), provided.as_bytes())
    }
}

#[async_trait]
impl Authenticator for AuthConfig {
    async fn authenticate(&self, credentials: &Credentials) -> bool {
        let allowed = match self.mode {
            AuthMode::Open => true,
            AuthMode::Token => {
                self.should_bypass(credentials.remote)
                    || credentials
                        .token
                        .as_deref()
                        .is_some_and(|t| self.verify_token(t))
            }
        };

        if allowed {
            tracing::debug!(device_id = %credentials.device_id, mode = %self.mode, "device authenticated");
        } else {
            tracing::warn!(
                device_id = %credentials.device_id,
                remote = ?credentials.remote,
                "device authentication failed"
            );
        }
        allowed
    }
}

/// Timing-safe byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
