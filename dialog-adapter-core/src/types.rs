//! Shared types: media kinds, lifecycle states, server parameters and
//! session configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

/// Connection state reported by a media transport (ICE + DTLS)
pub use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState as ConnectionState;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track (camera or screen share)
    Video,
}

impl MediaKind {
    /// Both kinds, audio first
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportDirection {
    /// Publishes local tracks
    Send,
    /// Receives remote tracks
    Recv,
}

impl TransportDirection {
    /// Human label used in diagnostics and server stats
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Recv => "Receive",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capture source of a local video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentHint {
    /// Webcam capture
    Camera,
    /// Desktop / window capture
    Screen,
}

/// Application tag attached to a local producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerTag {
    /// Microphone published through the primary transport
    Mic,
    /// Camera published through the primary transport
    Camera,
    /// Screen share (always published through the primary transport)
    ScreenShare,
}

impl ProducerTag {
    /// Media kind carried by producers with this tag
    #[must_use]
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Mic => MediaKind::Audio,
            Self::Camera | Self::ScreenShare => MediaKind::Video,
        }
    }

    /// Wire name of the tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::Camera => "camera",
            Self::ScreenShare => "screen-share",
        }
    }
}

/// Session controller lifecycle state
///
/// ```text
///  Disconnected ──► Connecting ──► Joining ──► Joined ◄──► Degraded
///        ▲               │            │          │            │
///        │               ▼            ▼          │            ▼
///        └──────────── Failed ◄───────┘          │       (failover)
///        └───────────────────────────────────────┘       Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No signaling channel
    Disconnected,
    /// Signaling channel is being opened
    Connecting,
    /// Channel open; joining the room and creating transports
    Joining,
    /// Fully joined
    Joined,
    /// Joined, but a transport or the signaling channel is recovering
    Degraded,
    /// Unrecoverable connection failure
    Failed,
}

impl SessionState {
    /// Whether moving from `self` to `to` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Joining)
                | (Joining, Joined)
                | (Joined, Degraded)
                | (Degraded, Joined)
                // Host failover reconnects from a degraded session
                | (Degraded, Connecting)
                | (Connecting, Failed)
                | (Joining, Failed)
                | (Degraded, Failed)
                | (Joined, Failed)
                | (Connecting, Disconnected)
                | (Joining, Disconnected)
                | (Joined, Disconnected)
                | (Degraded, Disconnected)
                | (Failed, Disconnected)
        )
    }

    /// Whether the session currently holds a joined room
    #[must_use]
    pub fn is_joined(self) -> bool {
        matches!(self, Self::Joined | Self::Degraded)
    }
}

/// One TURN listening port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTransport {
    /// TURN port on the media host
    pub port: u16,
}

/// TURN configuration handed out by host lookup
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Whether TURN should be offered at all
    pub enabled: bool,
    /// TURN username
    #[serde(default)]
    pub username: String,
    /// TURN credential
    #[serde(default)]
    pub credential: String,
    /// TURN listening ports
    #[serde(default)]
    pub transports: Vec<TurnTransport>,
}

/// Coordination server parameters returned by host lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerParams {
    /// Host name of the coordination/media server
    pub host: String,
    /// Signaling port
    pub port: u16,
    /// Optional TURN configuration
    #[serde(default)]
    pub turn: Option<TurnConfig>,
}

impl ServerParams {
    /// Signaling URL for this host, without room parameters
    #[must_use]
    pub fn server_url(&self) -> String {
        format!("wss://{}:{}", self.host, self.port)
    }
}

/// ICE transport policy applied to both media transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcePolicy {
    /// Use every candidate type
    #[default]
    All,
    /// Only relayed (TURN) candidates
    Relay,
}

impl From<IcePolicy> for RTCIceTransportPolicy {
    fn from(policy: IcePolicy) -> Self {
        match policy {
            IcePolicy::All => RTCIceTransportPolicy::All,
            IcePolicy::Relay => RTCIceTransportPolicy::Relay,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Never offer TURN over UDP
    pub force_tcp: bool,
    /// Only use relayed candidates
    pub force_turn: bool,
    /// Explicit ICE transport policy
    pub ice_transport_policy: IcePolicy,
    /// Emit RTC debug events to the telemetry sink
    pub verbose_diagnostics: bool,
    /// Reconnection attempts of the signaling channel itself
    pub signaling_retries: u32,
    /// Buffer size of each broadcast event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            force_tcp: false,
            force_turn: false,
            ice_transport_policy: IcePolicy::All,
            verbose_diagnostics: false,
            signaling_retries: 2,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Effective ICE transport policy for new transports
    #[must_use]
    pub fn effective_ice_policy(&self) -> IcePolicy {
        if self.force_turn {
            IcePolicy::Relay
        } else {
            self.ice_transport_policy
        }
    }
}

/// Parameters of a `connect` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Signaling URL (`wss://host:port`)
    pub server_url: String,
    /// Room to join
    pub room_id: String,
    /// Local participant
    pub client_id: crate::identity::PeerId,
    /// Host parameters used to derive ICE servers
    pub server_params: ServerParams,
}

impl ConnectParams {
    /// Build parameters whose signaling URL is derived from `server_params`
    #[must_use]
    pub fn for_host(
        room_id: impl Into<String>,
        client_id: crate::identity::PeerId,
        server_params: ServerParams,
    ) -> Self {
        Self {
            server_url: server_params.server_url(),
            room_id: room_id.into(),
            client_id,
            server_params,
        }
    }
}

/// A participant's stream of one kind became available or changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpdate {
    /// Participant
    pub peer: crate::identity::PeerId,
    /// Media kind
    pub kind: MediaKind,
}

/// Per-consumer quality statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Spatial layers offered by the producer
    pub spatial_layers: Option<u8>,
    /// Temporal layers offered by the producer
    pub temporal_layers: Option<u8>,
    /// Currently forwarded spatial layer (`None` while paused by the server)
    pub spatial_layer: Option<u8>,
    /// Currently forwarded temporal layer
    pub temporal_layer: Option<u8>,
    /// Last score payload reported by the server
    pub score: Option<serde_json::Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_path_is_legal() {
        assert!(SessionState::Joined.can_transition_to(SessionState::Degraded));
        assert!(SessionState::Degraded.can_transition_to(SessionState::Connecting));
        assert!(SessionState::Connecting.can_transition_to(SessionState::Joining));
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Joined));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Joined));
    }

    #[test]
    fn test_server_params_from_host_lookup_payload() {
        let json = r#"{
            "host": "dialog.example.com",
            "port": 4443,
            "turn": {"enabled": true, "username": "u", "credential": "c",
                     "transports": [{"port": 5349}]}
        }"#;
        let params: ServerParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.server_url(), "wss://dialog.example.com:4443");
        let turn = params.turn.unwrap();
        assert!(turn.enabled);
        assert_eq!(turn.transports, vec![TurnTransport { port: 5349 }]);
    }

    #[test]
    fn test_force_turn_overrides_policy() {
        let config = SessionConfig {
            force_turn: true,
            ..SessionConfig::default()
        };
        assert_eq!(config.effective_ice_policy(), IcePolicy::Relay);
        assert_eq!(
            SessionConfig::default().effective_ice_policy(),
            IcePolicy::All
        );
    }

    #[test]
    fn test_producer_tag_kind() {
        assert_eq!(ProducerTag::Mic.kind(), MediaKind::Audio);
        assert_eq!(ProducerTag::ScreenShare.kind(), MediaKind::Video);
        assert_eq!(
            serde_json::to_string(&ProducerTag::ScreenShare).unwrap(),
            "\"screen-share\""
        );
    }
}
