//! Signaling channel to the coordination server
//!
//! The wire transport (a WebSocket speaking a request/response/notification
//! protocol) lives outside this crate behind [`SignalingConnector`] and
//! [`SignalingChannel`]. This module owns the typed view of that protocol:
//! method names, inbound requests and notifications, and the
//! [`SignalingHandler`] wrapper that issues the client-side requests.

use crate::identity::PeerId;
use crate::types::MediaKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Method names of the signaling protocol
pub mod methods {
    /// Router RTP capabilities used to load the media engine
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    /// Join the room
    pub const JOIN: &str = "join";
    /// Allocate a server-side transport
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    /// Complete the DTLS handshake of a transport
    pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
    /// Release a server-side transport
    pub const CLOSE_WEBRTC_TRANSPORT: &str = "closeWebRtcTransport";
    /// Publish a track
    pub const PRODUCE: &str = "produce";
    /// Release a server-side producer
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    /// Fresh ICE parameters for an existing transport
    pub const RESTART_ICE: &str = "restartIce";
    /// Ask the server to resend every active remote producer
    pub const REFRESH_CONSUMERS: &str = "refreshConsumers";
    /// Server-side transport stats
    pub const GET_TRANSPORT_STATS: &str = "getTransportStats";
    /// Server-side producer stats
    pub const GET_PRODUCER_STATS: &str = "getProducerStats";
    /// Server-side consumer stats
    pub const GET_CONSUMER_STATS: &str = "getConsumerStats";
    /// Remove a participant from the room
    pub const KICK: &str = "kick";
    /// Block a participant
    pub const BLOCK: &str = "block";
    /// Unblock a participant
    pub const UNBLOCK: &str = "unblock";

    /// Server request: a remote producer is ready to be consumed
    pub const NEW_CONSUMER: &str = "newConsumer";
}

/// Signaling errors
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// Channel is not open
    #[error("Signaling channel not connected")]
    NotConnected,

    /// Server answered with an error
    #[error("Request {method} rejected ({code}): {reason}")]
    Rejected {
        /// Method that was rejected
        method: String,
        /// Error code from the server
        code: u16,
        /// Error description
        reason: String,
    },

    /// Response payload did not have the expected shape
    #[error("Invalid response to {method}: {reason}")]
    InvalidResponse {
        /// Method whose response failed to decode
        method: String,
        /// Decoder error
        reason: String,
    },

    /// Invalid signaling URL
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl From<url::ParseError> for SignalingError {
    fn from(err: url::ParseError) -> Self {
        SignalingError::InvalidUrl(err.to_string())
    }
}

/// Answer to an inbound server request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Request accepted, with optional response data
    Accepted(Value),
    /// Request rejected
    Rejected {
        /// Error code
        code: u16,
        /// Error description
        reason: String,
    },
}

/// One-shot acknowledgement handle for an inbound server request
///
/// Consuming `accept`/`reject` answers the request; dropping an unanswered
/// responder rejects it, so every server request is answered exactly once.
#[derive(Debug)]
pub struct RequestResponder {
    method: String,
    tx: Option<oneshot::Sender<RequestOutcome>>,
}

impl RequestResponder {
    /// Create a responder and the receiver the channel awaits to learn the
    /// outcome
    pub fn new(method: impl Into<String>) -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                method: method.into(),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// Accept the request
    pub fn accept(mut self, data: Value) {
        self.answer(RequestOutcome::Accepted(data));
    }

    /// Reject the request
    pub fn reject(mut self, code: u16, reason: impl Into<String>) {
        self.answer(RequestOutcome::Rejected {
            code,
            reason: reason.into(),
        });
    }

    fn answer(&mut self, outcome: RequestOutcome) {
        if let Some(tx) = self.tx.take() {
            if tx.send(outcome).is_err() {
                tracing::debug!(method = %self.method, "Request answered after channel went away");
            }
        }
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!(method = %self.method, "Server request dropped unanswered, rejecting");
            self.answer(RequestOutcome::Rejected {
                code: 500,
                reason: "request not handled".to_string(),
            });
        }
    }
}

/// Request initiated by the server
#[derive(Debug)]
pub struct ServerRequest {
    /// Method name
    pub method: String,
    /// Request payload
    pub data: Value,
    /// Acknowledgement handle
    pub responder: RequestResponder,
}

/// Notification pushed by the server
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name
    pub method: String,
    /// Notification payload
    pub data: Value,
}

/// Event surfaced by a signaling channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// Channel opened (also after an internal reconnect)
    Open,
    /// Connection dropped; the channel may still reconnect on its own
    Disconnected,
    /// A connection attempt failed
    Failed {
        /// Attempt number
        attempt: u32,
    },
    /// Channel closed for good without the adapter asking for it
    Close,
    /// Server request awaiting acknowledgement
    Request(ServerRequest),
    /// Server notification
    Notification(Notification),
}

/// Request side of an open signaling channel
///
/// Implementations must resolve request responses independently of the
/// event receiver, because request handlers may issue requests of their own
/// while an inbound server request is still being processed.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its response
    async fn request(&self, method: &str, data: Value) -> Result<Value, SignalingError>;

    /// Whether the channel is currently open
    fn is_connected(&self) -> bool;

    /// Close the channel. No further events are delivered.
    fn close(&self);
}

/// Factory for signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Start connecting to `url`, retrying the socket up to `retries` times.
    /// Returns immediately; [`ChannelEvent::Open`] reports readiness.
    async fn connect(
        &self,
        url: &Url,
        retries: u32,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<ChannelEvent>), SignalingError>;
}

/// Payload of a `newConsumer` server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    /// Owner of the remote producer
    pub peer_id: PeerId,
    /// Remote producer id
    pub producer_id: String,
    /// Consumer id allocated by the server
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters for the local consumer
    pub rtp_parameters: Value,
    /// Application data of the remote producer
    #[serde(default)]
    pub app_data: Value,
    /// Whether the remote producer is paused
    #[serde(default)]
    pub producer_paused: bool,
}

/// Typed server request
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequestKind {
    /// A remote producer is ready to be consumed
    NewConsumer(NewConsumer),
}

impl ServerRequestKind {
    /// Decode a server request
    ///
    /// # Errors
    ///
    /// Returns error if the method is unknown or the payload malformed
    pub fn parse(method: &str, data: &Value) -> Result<Self, SignalingError> {
        match method {
            methods::NEW_CONSUMER => serde_json::from_value(data.clone())
                .map(Self::NewConsumer)
                .map_err(|e| invalid(method, &e)),
            other => Err(SignalingError::InvalidResponse {
                method: other.to_string(),
                reason: "unknown server request".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerPayload {
    peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerPayload {
    consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayersPayload {
    consumer_id: String,
    #[serde(default)]
    spatial_layer: Option<u8>,
    #[serde(default)]
    temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScorePayload {
    consumer_id: String,
    score: Value,
}

/// Typed server notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    /// A participant joined
    NewPeer(Value),
    /// A participant left
    PeerClosed {
        /// Departed participant
        peer_id: PeerId,
    },
    /// The server closed a consumer
    ConsumerClosed {
        /// Closed consumer
        consumer_id: String,
    },
    /// A participant was blocked
    PeerBlocked {
        /// Blocked participant
        peer_id: PeerId,
    },
    /// A participant was unblocked
    PeerUnblocked {
        /// Unblocked participant
        peer_id: PeerId,
    },
    /// Downlink bandwidth estimate
    DownlinkBwe(Value),
    /// Forwarded simulcast/SVC layers of a consumer changed
    ConsumerLayersChanged {
        /// Affected consumer
        consumer_id: String,
        /// New spatial layer, `None` when paused
        spatial_layer: Option<u8>,
        /// New temporal layer, `None` when paused
        temporal_layer: Option<u8>,
    },
    /// Quality score of a consumer
    ConsumerScore {
        /// Affected consumer
        consumer_id: String,
        /// Score payload
        score: Value,
    },
}

impl ServerNotification {
    /// Decode a notification
    ///
    /// # Errors
    ///
    /// Returns error if the method is unknown or the payload malformed
    pub fn parse(notification: &Notification) -> Result<Self, SignalingError> {
        let method = notification.method.as_str();
        let data = &notification.data;
        let decoded = match method {
            "newPeer" => Ok(Self::NewPeer(data.clone())),
            "peerClosed" => decode::<PeerPayload>(data).map(|p| Self::PeerClosed { peer_id: p.peer_id }),
            "consumerClosed" => decode::<ConsumerPayload>(data).map(|p| Self::ConsumerClosed {
                consumer_id: p.consumer_id,
            }),
            "peerBlocked" => decode::<PeerPayload>(data).map(|p| Self::PeerBlocked { peer_id: p.peer_id }),
            "peerUnblocked" => {
                decode::<PeerPayload>(data).map(|p| Self::PeerUnblocked { peer_id: p.peer_id })
            }
            "downlinkBwe" => Ok(Self::DownlinkBwe(data.clone())),
            "consumerLayersChanged" => {
                decode::<LayersPayload>(data).map(|p| Self::ConsumerLayersChanged {
                    consumer_id: p.consumer_id,
                    spatial_layer: p.spatial_layer,
                    temporal_layer: p.temporal_layer,
                })
            }
            "consumerScore" => decode::<ScorePayload>(data).map(|p| Self::ConsumerScore {
                consumer_id: p.consumer_id,
                score: p.score,
            }),
            other => {
                return Err(SignalingError::InvalidResponse {
                    method: other.to_string(),
                    reason: "unknown notification".to_string(),
                })
            }
        };
        decoded.map_err(|e| invalid(method, &e))
    }
}

fn decode<T: DeserializeOwned>(data: &Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data.clone())
}

fn invalid(method: &str, err: &serde_json::Error) -> SignalingError {
    SignalingError::InvalidResponse {
        method: method.to_string(),
        reason: err.to_string(),
    }
}

/// Server-side transport parameters returned by `createWebRtcTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    /// Transport id
    pub id: String,
    /// ICE parameters
    pub ice_parameters: Value,
    /// ICE candidates
    pub ice_candidates: Value,
    /// DTLS parameters
    pub dtls_parameters: Value,
    /// SCTP parameters
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ProduceResponse {
    id: String,
}

/// Typed request helpers over a [`SignalingChannel`]
#[derive(Clone)]
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingHandler {
    /// Wrap an open channel
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    /// Whether the underlying channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Close the underlying channel
    pub fn close(&self) {
        self.channel.close();
    }

    /// Access the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }

    /// Send a raw request
    ///
    /// # Errors
    ///
    /// Returns error if the channel is closed or the server rejects it
    #[tracing::instrument(skip(self, data))]
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, SignalingError> {
        tracing::trace!("Sending signaling request");
        self.channel.request(method, data).await
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, data: Value) -> Result<R, SignalingError> {
        let response = self.request(method, data).await?;
        serde_json::from_value(response).map_err(|e| invalid(method, &e))
    }

    /// Router RTP capabilities
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn router_rtp_capabilities(&self) -> Result<Value, SignalingError> {
        self.request(methods::GET_ROUTER_RTP_CAPABILITIES, Value::Null).await
    }

    /// Join the room
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn join(
        &self,
        display_name: &PeerId,
        rtp_capabilities: Value,
        token: Option<String>,
    ) -> Result<Value, SignalingError> {
        self.request(
            methods::JOIN,
            json!({
                "displayName": display_name,
                "rtpCapabilities": rtp_capabilities,
                "token": token,
            }),
        )
        .await
    }

    /// Allocate a server-side transport
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    pub async fn create_webrtc_transport(
        &self,
        producing: bool,
        consuming: bool,
    ) -> Result<TransportInfo, SignalingError> {
        self.call(
            methods::CREATE_WEBRTC_TRANSPORT,
            json!({ "producing": producing, "consuming": consuming }),
        )
        .await
    }

    /// Complete the DTLS handshake of a transport
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), SignalingError> {
        self.request(
            methods::CONNECT_WEBRTC_TRANSPORT,
            json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters }),
        )
        .await
        .map(|_| ())
    }

    /// Release a server-side transport
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn close_webrtc_transport(&self, transport_id: &str) -> Result<(), SignalingError> {
        self.request(
            methods::CLOSE_WEBRTC_TRANSPORT,
            json!({ "transportId": transport_id }),
        )
        .await
        .map(|_| ())
    }

    /// Publish a track; returns the server producer id
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, SignalingError> {
        let response: ProduceResponse = self
            .call(
                methods::PRODUCE,
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                    "appData": app_data,
                }),
            )
            .await?;
        Ok(response.id)
    }

    /// Release a server-side producer
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn close_producer(&self, producer_id: &str) -> Result<(), SignalingError> {
        self.request(methods::CLOSE_PRODUCER, json!({ "producerId": producer_id }))
            .await
            .map(|_| ())
    }

    /// Fresh ICE parameters for a transport
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn restart_ice(&self, transport_id: &str) -> Result<Value, SignalingError> {
        self.request(methods::RESTART_ICE, json!({ "transportId": transport_id }))
            .await
    }

    /// Ask the server to resend `newConsumer` for every active producer
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn refresh_consumers(&self) -> Result<(), SignalingError> {
        self.request(methods::REFRESH_CONSUMERS, Value::Null)
            .await
            .map(|_| ())
    }

    /// Server-side transport stats
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn transport_stats(&self, transport_id: &str) -> Result<Value, SignalingError> {
        self.request(methods::GET_TRANSPORT_STATS, json!({ "transportId": transport_id }))
            .await
    }

    /// Server-side producer stats
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn producer_stats(&self, producer_id: &str) -> Result<Value, SignalingError> {
        self.request(methods::GET_PRODUCER_STATS, json!({ "producerId": producer_id }))
            .await
    }

    /// Server-side consumer stats
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn consumer_stats(&self, consumer_id: &str) -> Result<Value, SignalingError> {
        self.request(methods::GET_CONSUMER_STATS, json!({ "consumerId": consumer_id }))
            .await
    }

    /// Remove a participant from the room
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn kick(
        &self,
        room_id: &str,
        peer: &PeerId,
        token: Option<String>,
    ) -> Result<(), SignalingError> {
        self.request(
            methods::KICK,
            json!({ "room_id": room_id, "user_id": peer, "token": token }),
        )
        .await
        .map(|_| ())
    }

    /// Block a participant
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn block(&self, peer: &PeerId) -> Result<(), SignalingError> {
        self.request(methods::BLOCK, json!({ "whom": peer }))
            .await
            .map(|_| ())
    }

    /// Unblock a participant
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn unblock(&self, peer: &PeerId) -> Result<(), SignalingError> {
        self.request(methods::UNBLOCK, json!({ "whom": peer }))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn notification(method: &str, data: Value) -> Notification {
        Notification {
            method: method.to_string(),
            data,
        }
    }

    #[tokio::test]
    async fn test_responder_accepts_once() {
        let (responder, rx) = RequestResponder::new(methods::NEW_CONSUMER);
        responder.accept(json!({ "ok": true }));
        assert_eq!(rx.await.unwrap(), RequestOutcome::Accepted(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_dropped_responder_rejects() {
        let (responder, rx) = RequestResponder::new(methods::NEW_CONSUMER);
        drop(responder);
        match rx.await.unwrap() {
            RequestOutcome::Rejected { code, .. } => assert_eq!(code, 500),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_parse_new_consumer_request() {
        let data = json!({
            "peerId": "alice",
            "producerId": "prod-1",
            "id": "cons-1",
            "kind": "video",
            "rtpParameters": { "encodings": [{ "scalabilityMode": "L3T3" }] },
            "type": "simulcast",
            "appData": { "share": true },
            "producerPaused": false
        });
        let ServerRequestKind::NewConsumer(consumer) =
            ServerRequestKind::parse(methods::NEW_CONSUMER, &data).unwrap();
        assert_eq!(consumer.peer_id, PeerId::new("alice"));
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.app_data, json!({ "share": true }));
    }

    #[test]
    fn test_parse_unknown_request_fails() {
        assert!(ServerRequestKind::parse("mystery", &Value::Null).is_err());
    }

    #[test]
    fn test_parse_notifications() {
        assert_eq!(
            ServerNotification::parse(&notification("peerClosed", json!({ "peerId": "bob" }))).unwrap(),
            ServerNotification::PeerClosed {
                peer_id: PeerId::new("bob")
            }
        );
        assert_eq!(
            ServerNotification::parse(&notification(
                "consumerLayersChanged",
                json!({ "consumerId": "c1", "spatialLayer": null, "temporalLayer": 2 })
            ))
            .unwrap(),
            ServerNotification::ConsumerLayersChanged {
                consumer_id: "c1".to_string(),
                spatial_layer: None,
                temporal_layer: Some(2),
            }
        );
        assert_eq!(
            ServerNotification::parse(&notification("downlinkBwe", json!({ "desiredBitrate": 1 })))
                .unwrap(),
            ServerNotification::DownlinkBwe(json!({ "desiredBitrate": 1 }))
        );
    }

    #[test]
    fn test_parse_malformed_notification() {
        let err = ServerNotification::parse(&notification("consumerScore", json!({}))).unwrap_err();
        assert!(matches!(err, SignalingError::InvalidResponse { ref method, .. } if method == "consumerScore"));
        assert!(ServerNotification::parse(&notification("activeSpeaker", Value::Null)).is_err());
    }

    #[test]
    fn test_transport_info_decoding() {
        let info: TransportInfo = serde_json::from_value(json!({
            "id": "t1",
            "iceParameters": {},
            "iceCandidates": [],
            "dtlsParameters": {}
        }))
        .unwrap();
        assert_eq!(info.id, "t1");
        assert_eq!(info.sctp_parameters, None);
    }
}
