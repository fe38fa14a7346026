//! Call configuration and validation
//!
//! Everything here is validated before a session is allowed to touch the
//! network; invalid configuration is a synchronous, fatal error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Default total outage tolerated by the reconnect loop
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Fixed additive step applied to the reconnect backoff after each failed attempt
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(2);
/// Upper bound of the random jitter added on top of the backoff step
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_secs(1);
/// RTC monitor sampling interval
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(4);
/// Keepalive / telemetry push interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Poll interval while waiting for a negotiation lock response
pub const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(100);
/// Absolute deadline for a negotiation lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Capacity of the pending remote ICE candidate queue
pub const DEFAULT_PENDING_CANDIDATES: usize = 20;

/// Client session configuration
///
/// `site_url` is the backend base address (http/https); the signaling
/// websocket address is derived from it with the scheme swapped to ws/wss
/// and trailing slashes stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Backend site address, `http(s)://host[:port][/path]`
    pub site_url: String,
    /// Authentication credential sent with the join payload
    pub token: String,
    /// Channel identifier of the call to join
    pub channel_id: String,
    /// Optional job/context identifier carried in the join payload
    pub job_id: Option<String>,
    /// STUN/TURN server URLs handed to the peer connection
    pub ice_servers: Vec<String>,
    /// Advertise support for the alternate codec set
    pub alt_codec: bool,
    /// Carry negotiation over the in-band data channel once it is open
    pub inband_signaling: bool,
    /// Run the periodic RTC health monitor
    pub health_monitor: bool,
    /// Total outage tolerated before the session is torn down, seconds
    pub reconnect_timeout_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            token: String::new(),
            channel_id: String::new(),
            job_id: None,
            ice_servers: Vec::new(),
            alt_codec: false,
            inband_signaling: true,
            health_monitor: true,
            reconnect_timeout_secs: DEFAULT_RECONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl CallConfig {
    /// Validate the configuration before any connection attempt
    pub fn validate(&self) -> Result<()> {
        if !self.site_url.starts_with("http://") && !self.site_url.starts_with("https://") {
            return Err(CallError::Config(format!(
                "site_url must be http or https, got '{}'",
                self.site_url
            )));
        }
        if self.token.is_empty() {
            return Err(CallError::Config("token must not be empty".to_string()));
        }
        validate_channel_id(&self.channel_id)?;
        if self.reconnect_timeout_secs == 0 {
            return Err(CallError::Config(
                "reconnect_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Signaling websocket address derived from `site_url`
    ///
    /// `http` maps to `ws`, `https` to `wss`; trailing slashes are stripped
    /// so path concatenation stays predictable.
    pub fn signaling_url(&self) -> Result<String> {
        self.validate()?;
        let stripped = self.site_url.trim_end_matches('/');
        let ws = if let Some(rest) = stripped.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = stripped.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            // validate() already rejected other schemes
            return Err(CallError::Config("unsupported scheme".to_string()));
        };
        Ok(format!("{ws}/signal"))
    }

    /// REST base address derived from `site_url` (trailing slashes stripped)
    pub fn rest_url(&self) -> String {
        self.site_url.trim_end_matches('/').to_string()
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}

/// Channel ids are backend-assigned, `[A-Za-z0-9-]`, 4..=64 chars
fn validate_channel_id(id: &str) -> Result<()> {
    if id.len() < 4 || id.len() > 64 {
        return Err(CallError::Config(format!(
            "channel_id must be 4..=64 chars, got {} ('{}')",
            id.len(),
            id
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(CallError::Config(format!(
            "channel_id contains invalid characters: '{id}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> CallConfig {
        CallConfig {
            site_url: "https://call.example.com".to_string(),
            token: "secret".to_string(),
            channel_id: "room-42ab".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let mut cfg = valid();
        cfg.site_url = "ftp://call.example.com".to_string();
        assert!(matches!(cfg.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_token() {
        let mut cfg = valid();
        cfg.token = String::new();
        assert!(matches!(cfg.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_rejects_malformed_channel() {
        let mut cfg = valid();
        cfg.channel_id = "x".to_string();
        assert!(cfg.validate().is_err());
        cfg.channel_id = "room 42".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_signaling_url_scheme_and_slash() {
        let mut cfg = valid();
        cfg.site_url = "https://call.example.com///".to_string();
        assert_eq!(
            cfg.signaling_url().unwrap(),
            "wss://call.example.com/signal"
        );
        cfg.site_url = "http://10.0.0.1:8080".to_string();
        assert_eq!(cfg.signaling_url().unwrap(), "ws://10.0.0.1:8080/signal");
    }
}
