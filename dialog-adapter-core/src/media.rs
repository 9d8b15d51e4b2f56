//! Media engine capabilities, tracks and streams
//!
//! Connection establishment, codec negotiation and RTP handling belong to an
//! external media engine. The adapter drives it through the small capability
//! surface defined here: load router capabilities, create a transport,
//! produce a track, consume a track.
//!
//! # Architecture
//!
//! - [`MediaEngine`] creates [`MediaTransport`]s from server-issued
//!   parameters.
//! - A transport reports its DTLS handshake, publish requests and connection
//!   state through the [`TransportHandler`] it was created with.
//! - [`Producer`]s and [`Consumer`]s are handles to published and received
//!   tracks, each wrapping a [`MediaTrack`].

use crate::signaling::{SignalingError, TransportInfo};
use crate::types::{ConnectionState, ContentHint, MediaKind, TransportDirection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

/// Media-related errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Engine has not been loaded with router capabilities
    #[error("Media engine not loaded")]
    NotLoaded,

    /// Operation on a closed transport
    #[error("Transport closed")]
    TransportClosed,

    /// Error reported by the media engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Signaling round trip behind a transport event failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Local or remote media track
///
/// Clones share the enabled flag, so muting one handle mutes every handle to
/// the same track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    content_hint: Option<ContentHint>,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    /// New enabled track with a random id
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind)
    }

    /// New enabled track with a given id
    #[must_use]
    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            content_hint: None,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Attach a capture-source hint
    #[must_use]
    pub fn with_hint(mut self, hint: ContentHint) -> Self {
        self.content_hint = Some(hint);
        self
    }

    /// Track id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Capture-source hint
    #[must_use]
    pub fn content_hint(&self) -> Option<ContentHint> {
        self.content_hint
    }

    /// Whether this is a screen-capture video track
    #[must_use]
    pub fn is_screen(&self) -> bool {
        self.kind == MediaKind::Video && self.content_hint == Some(ContentHint::Screen)
    }

    /// Whether the track is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaTrack {}

/// Ordered collection of tracks handed to or returned by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Stream holding `tracks`
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Shared stream holding exactly one track
    #[must_use]
    pub fn single(track: MediaTrack) -> Arc<Self> {
        Arc::new(Self::new(vec![track]))
    }

    /// Stream id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First track of `kind`
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

/// One RTP encoding of a produced track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    /// Bitrate ceiling in bits per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    /// Discontinuous transmission
    #[serde(default)]
    pub dtx: bool,
    /// SVC scalability mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

/// Parameters of a produce call
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Track to publish
    pub track: MediaTrack,
    /// Simulcast encodings; empty lets the engine decide
    pub encodings: Vec<RtpEncoding>,
    /// Codec options
    pub codec_options: Option<Value>,
    /// Whether closing the producer stops the capture track
    pub stop_tracks: bool,
    /// Application data forwarded to the server
    pub app_data: Value,
}

impl ProduceOptions {
    /// Plain publish of `track` with an application tag
    #[must_use]
    pub fn tagged(track: MediaTrack, tag: &str) -> Self {
        Self {
            track,
            encodings: Vec::new(),
            codec_options: None,
            stop_tracks: true,
            app_data: json!({ "tag": tag }),
        }
    }

    /// Screen-share publish: two simulcast layers at 1.5 and 6 Mbps
    #[must_use]
    pub fn screen_share(track: MediaTrack) -> Self {
        Self {
            track,
            encodings: vec![
                RtpEncoding {
                    max_bitrate: Some(1_500_000),
                    dtx: true,
                    scalability_mode: None,
                },
                RtpEncoding {
                    max_bitrate: Some(6_000_000),
                    dtx: true,
                    scalability_mode: None,
                },
            ],
            codec_options: Some(json!({ "videoGoogleStartBitrate": 1000 })),
            stop_tracks: false,
            app_data: json!({ "share": true }),
        }
    }
}

/// Parameters of a consume call, taken from a `newConsumer` request
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    /// Consumer id
    pub id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters
    pub rtp_parameters: Value,
    /// Application data
    pub app_data: Value,
}

/// Parameters for instantiating a local transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Server-side transport parameters
    pub info: TransportInfo,
    /// ICE servers
    pub ice_servers: Vec<RTCIceServer>,
    /// ICE transport policy
    pub ice_transport_policy: RTCIceTransportPolicy,
}

/// Callbacks a transport raises towards the adapter
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// The transport needs its DTLS handshake completed server-side.
    /// Resolves once the server has accepted the parameters.
    async fn on_connect(&self, dtls_parameters: Value) -> Result<(), MediaError>;

    /// The transport wants to publish a track; returns the server producer id
    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, MediaError>;

    /// ICE/DTLS connection state changed
    fn on_connection_state_change(&self, state: ConnectionState);
}

/// Handle to a published local track
pub trait Producer: Send + Sync {
    /// Producer id
    fn id(&self) -> &str;
    /// Published track
    fn track(&self) -> &MediaTrack;
    /// Whether the producer is closed
    fn is_closed(&self) -> bool;
    /// Close locally
    fn close(&self);
}

/// Handle to a received remote track
pub trait Consumer: Send + Sync {
    /// Consumer id
    fn id(&self) -> &str;
    /// Remote producer id
    fn producer_id(&self) -> &str;
    /// Received track
    fn track(&self) -> &MediaTrack;
    /// Negotiated RTP parameters
    fn rtp_parameters(&self) -> &Value;
    /// Whether the consumer is closed
    fn is_closed(&self) -> bool;
    /// Close locally
    fn close(&self);
}

/// One unidirectional media transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Transport id (equals the server-side id)
    fn id(&self) -> &str;

    /// Direction
    fn direction(&self) -> TransportDirection;

    /// Current ICE/DTLS connection state
    fn connection_state(&self) -> ConnectionState;

    /// Whether the transport is closed
    fn is_closed(&self) -> bool;

    /// Close locally; closes every producer/consumer bound to it
    fn close(&self);

    /// Apply fresh ICE parameters
    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), MediaError>;

    /// Publish a track (send transports)
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>, MediaError>;

    /// Receive a remote track (recv transports)
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, MediaError>;
}

/// Client-side media engine (device)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load the router RTP capabilities
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), MediaError>;

    /// Whether [`MediaEngine::load`] has completed
    fn is_loaded(&self) -> bool;

    /// Local RTP capabilities, once loaded
    fn rtp_capabilities(&self) -> Option<Value>;

    /// Instantiate a local transport
    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}

/// Spatial/temporal layer counts of an SVC or simulcast encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalabilityMode {
    /// Spatial layers
    pub spatial_layers: u8,
    /// Temporal layers
    pub temporal_layers: u8,
}

impl Default for ScalabilityMode {
    fn default() -> Self {
        Self {
            spatial_layers: 1,
            temporal_layers: 1,
        }
    }
}

/// Parse a scalability mode such as `L3T3` or `S2T3_KEY`.
/// Missing or unrecognised modes yield one spatial and one temporal layer.
#[must_use]
pub fn parse_scalability_mode(mode: Option<&str>) -> ScalabilityMode {
    mode.and_then(parse_layers).unwrap_or_default()
}

fn parse_layers(mode: &str) -> Option<ScalabilityMode> {
    let rest = mode.strip_prefix(['L', 'S'])?;
    let (spatial, rest) = leading_layer_count(rest)?;
    let rest = rest.strip_prefix('T')?;
    let (temporal, _) = leading_layer_count(rest)?;
    Some(ScalabilityMode {
        spatial_layers: spatial,
        temporal_layers: temporal,
    })
}

// One or two digits, no leading zero
fn leading_layer_count(s: &str) -> Option<(u8, &str)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || digits > 2 || s.starts_with('0') {
        return None;
    }
    let value = s[..digits].parse().ok()?;
    Some((value, &s[digits..]))
}

/// Scalability mode of the first encoding in consumer RTP parameters
#[must_use]
pub fn scalability_mode_of(rtp_parameters: &Value) -> Option<&str> {
    rtp_parameters
        .get("encodings")?
        .get(0)?
        .get("scalabilityMode")?
        .as_str()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scalability_modes() {
        assert_eq!(
            parse_scalability_mode(Some("L3T3")),
            ScalabilityMode {
                spatial_layers: 3,
                temporal_layers: 3
            }
        );
        assert_eq!(
            parse_scalability_mode(Some("S2T3_KEY")),
            ScalabilityMode {
                spatial_layers: 2,
                temporal_layers: 3
            }
        );
        assert_eq!(parse_scalability_mode(Some("L10T2")).spatial_layers, 10);
        assert_eq!(parse_scalability_mode(None), ScalabilityMode::default());
        assert_eq!(parse_scalability_mode(Some("L0T1")), ScalabilityMode::default());
        assert_eq!(parse_scalability_mode(Some("X3T3")), ScalabilityMode::default());
        assert_eq!(parse_scalability_mode(Some("L3")), ScalabilityMode::default());
    }

    #[test]
    fn test_scalability_mode_from_rtp_parameters() {
        let params = json!({ "encodings": [{ "ssrc": 1, "scalabilityMode": "S3T3" }] });
        assert_eq!(scalability_mode_of(&params), Some("S3T3"));
        assert_eq!(scalability_mode_of(&json!({ "encodings": [] })), None);
    }

    #[test]
    fn test_track_clones_share_enabled_flag() {
        let track = MediaTrack::new(MediaKind::Audio);
        let other = track.clone();
        other.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track, other);
    }

    #[test]
    fn test_screen_share_options() {
        let track = MediaTrack::new(MediaKind::Video).with_hint(ContentHint::Screen);
        assert!(track.is_screen());
        let options = ProduceOptions::screen_share(track);
        assert_eq!(options.encodings.len(), 2);
        assert_eq!(options.encodings[1].max_bitrate, Some(6_000_000));
        assert!(!options.stop_tracks);
        assert_eq!(options.app_data, json!({ "share": true }));
        assert_eq!(
            serde_json::to_value(&options.encodings[0]).unwrap(),
            json!({ "maxBitrate": 1_500_000, "dtx": true })
        );
    }

    #[test]
    fn test_single_track_stream() {
        let stream = MediaStream::single(MediaTrack::new(MediaKind::Video));
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.track(MediaKind::Audio).is_none());
        assert!(stream.track(MediaKind::Video).is_some());
    }
}
