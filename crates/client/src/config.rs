//! Session configuration

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Default keepalive interval; intermediary infrastructure tends to drop
/// idle WebSocket connections after 30-60s.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Default label for the per-peer chat data channel.
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "chat";

/// ICE server entry (STUN or TURN).
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// Username (TURN only)
    pub username: String,
    /// Credential (TURN only)
    pub credential: String,
}

impl IceServerConfig {
    /// STUN entry with no credentials.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Configuration for a room session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the signaling relay
    pub signaling_url: String,

    /// ICE servers used for every peer connection
    pub ice_servers: Vec<IceServerConfig>,

    /// Keepalive interval for the signaling channel
    pub ping_interval: Duration,

    /// Label used when opening the chat data channel
    pub data_channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/ws".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            ping_interval: DEFAULT_PING_INTERVAL,
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a config pointing at the given relay URL.
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ..Default::default()
        }
    }

    /// Set the ICE servers for this session.
    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the signaling keepalive interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the chat data channel label.
    pub fn with_data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = label.into();
        self
    }

    /// Build the peer connection configuration from the ICE server list.
    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.data_channel_label, "chat");
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn test_builder_methods() {
        let config = SessionConfig::new("ws://relay.example/ws")
            .with_ping_interval(Duration::from_secs(5))
            .with_data_channel_label("data");
        assert_eq!(config.signaling_url, "ws://relay.example/ws");
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.data_channel_label, "data");
    }

    #[test]
    fn test_rtc_configuration_carries_servers() {
        let config = SessionConfig::default().with_ice_servers(vec![
            IceServerConfig::stun("stun:stun.example:3478"),
            IceServerConfig {
                urls: vec!["turn:turn.example:3478".into()],
                username: "user".into(),
                credential: "secret".into(),
            },
        ]);
        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[1].username, "user");
    }
}
