//! Send and receive media transports
//!
//! [`TransportManager`] owns at most one send and one receive transport. It
//! allocates them through signaling, wires their handshake and publish
//! callbacks back onto signaling requests, and recovers them when ICE fails:
//! an open transport gets an ICE restart, a closed one is recreated from
//! scratch.

use crate::ice::ice_servers;
use crate::media::{MediaEngine, MediaError, MediaTransport, TransportHandler, TransportOptions};
use crate::registry::Registry;
use crate::signaling::{SignalingError, SignalingHandler};
use crate::telemetry::{RtcEmitter, RtcLevel, RtcTag};
use crate::types::{ConnectionState, IcePolicy, MediaKind, ServerParams, SessionConfig, TransportDirection};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Transport configuration applied to newly created transports
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// ICE servers
    pub ice_servers: Vec<RTCIceServer>,
    /// ICE transport policy
    pub ice_transport_policy: IcePolicy,
}

impl TransportConfig {
    /// Derive the configuration for a host
    #[must_use]
    pub fn for_host(params: &ServerParams, config: &SessionConfig) -> Self {
        Self {
            ice_servers: ice_servers(params, config.force_tcp),
            ice_transport_policy: config.effective_ice_policy(),
        }
    }
}

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// No signaling channel is attached
    #[error("Signaling channel not attached")]
    NoSignaling,

    /// No transport exists in that direction
    #[error("No {0} transport")]
    Missing(TransportDirection),

    /// Signaling request failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Media engine error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Server-side stats of one transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportStatsReport {
    /// `Send` or `Receive`
    pub name: String,
    /// `getTransportStats` payload
    pub stats: Value,
    /// `getProducerStats` payloads keyed by producer id
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub producers: BTreeMap<String, Value>,
    /// `getConsumerStats` payloads keyed by consumer id
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub consumers: BTreeMap<String, Value>,
}

/// Result of a server stats query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerStats {
    /// Reports keyed by transport id
    Transports(BTreeMap<String, TransportStatsReport>),
    /// A request failed
    Error {
        /// Error description
        error: String,
    },
}

/// Owner of the send and receive transports
pub struct TransportManager {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<Registry>,
    emitter: RtcEmitter,
    signaling: Mutex<Option<SignalingHandler>>,
    config: Mutex<TransportConfig>,
    send: Mutex<Option<Arc<dyn MediaTransport>>>,
    recv: Mutex<Option<Arc<dyn MediaTransport>>>,
    this: Weak<Self>,
}

impl TransportManager {
    /// Create a manager without a signaling channel
    pub fn new(engine: Arc<dyn MediaEngine>, registry: Arc<Registry>, emitter: RtcEmitter) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            registry,
            emitter,
            signaling: Mutex::new(None),
            config: Mutex::new(TransportConfig::default()),
            send: Mutex::new(None),
            recv: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Bind to a signaling channel and transport configuration
    pub fn attach(&self, signaling: SignalingHandler, config: TransportConfig) {
        *self.signaling.lock() = Some(signaling);
        *self.config.lock() = config;
    }

    /// Unbind from the signaling channel
    pub fn detach(&self) -> Option<SignalingHandler> {
        self.signaling.lock().take()
    }

    /// Media engine
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Current transport configuration
    #[must_use]
    pub fn config(&self) -> TransportConfig {
        self.config.lock().clone()
    }

    /// Current transport in `direction`, if any
    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<dyn MediaTransport>> {
        self.slot(direction).lock().clone()
    }

    /// Whether an open transport exists in `direction`
    #[must_use]
    pub fn is_open(&self, direction: TransportDirection) -> bool {
        self.transport(direction).is_some_and(|t| !t.is_closed())
    }

    fn slot(&self, direction: TransportDirection) -> &Mutex<Option<Arc<dyn MediaTransport>>> {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    fn connected_signaling(&self) -> Option<SignalingHandler> {
        self.signaling.lock().clone().filter(SignalingHandler::is_connected)
    }

    /// Allocate and instantiate the send transport
    ///
    /// # Errors
    ///
    /// Returns error if signaling or the media engine fails
    pub async fn create_send_transport(&self) -> Result<Arc<dyn MediaTransport>, TransportError> {
        self.create(TransportDirection::Send).await
    }

    /// Allocate and instantiate the receive transport
    ///
    /// # Errors
    ///
    /// Returns error if signaling or the media engine fails
    pub async fn create_recv_transport(&self) -> Result<Arc<dyn MediaTransport>, TransportError> {
        self.create(TransportDirection::Recv).await
    }

    /// Close the send transport locally, then release it server-side
    pub async fn close_send_transport(&self) {
        self.close(TransportDirection::Send).await;
    }

    /// Close the receive transport locally, then release it server-side
    pub async fn close_recv_transport(&self) {
        self.close(TransportDirection::Recv).await;
    }

    #[tracing::instrument(skip(self))]
    async fn create(&self, direction: TransportDirection) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let signaling = self.signaling.lock().clone().ok_or(TransportError::NoSignaling)?;
        let info = signaling
            .create_webrtc_transport(
                direction == TransportDirection::Send,
                direction == TransportDirection::Recv,
            )
            .await?;
        let config = self.config();
        let handler = Arc::new(TransportWiring {
            direction,
            transport_id: info.id.clone(),
            signaling,
            emitter: self.emitter.clone(),
            manager: self.this.clone(),
        });
        let options = TransportOptions {
            info,
            ice_servers: config.ice_servers,
            ice_transport_policy: config.ice_transport_policy.into(),
        };

        let transport = self.engine.create_transport(direction, options, handler).await?;
        tracing::info!(transport_id = transport.id(), "{} transport created", direction);

        let previous = self.slot(direction).lock().replace(transport.clone());
        if let Some(previous) = previous {
            previous.close();
            self.drop_bound(direction);
        }
        Ok(transport)
    }

    #[tracing::instrument(skip(self))]
    async fn close(&self, direction: TransportDirection) {
        let Some(transport) = self.slot(direction).lock().take() else {
            return;
        };
        if !transport.is_closed() {
            transport.close();
        }
        self.drop_bound(direction);
        self.emitter
            .emit(RtcLevel::Info, RtcTag::Rtc, || format!("{direction} transport [close]"));

        if let Some(signaling) = self.connected_signaling() {
            if let Err(e) = signaling.close_webrtc_transport(transport.id()).await {
                tracing::warn!(transport_id = transport.id(), error = %e, "Failed to release server transport");
            }
        }
    }

    /// Close both transports locally without informing the server
    pub fn close_local(&self) {
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            if let Some(transport) = self.slot(direction).lock().take() {
                transport.close();
                self.drop_bound(direction);
            }
        }
    }

    fn drop_bound(&self, direction: TransportDirection) {
        match direction {
            TransportDirection::Send => {
                self.registry.clear_producers();
            }
            TransportDirection::Recv => {
                self.registry.clear_consumers();
            }
        }
    }

    /// Close and recreate the transport in `direction`. A recreated receive
    /// transport asks the server to resend every active producer.
    ///
    /// # Errors
    ///
    /// Returns error if creation or the refresh request fails
    pub async fn recreate(&self, direction: TransportDirection) -> Result<(), TransportError> {
        self.emitter
            .emit(RtcLevel::Log, RtcTag::Rtc, || format!("Recreating {direction} transport"));
        self.close(direction).await;
        self.create(direction).await?;
        if direction == TransportDirection::Recv {
            let signaling = self.signaling.lock().clone().ok_or(TransportError::NoSignaling)?;
            signaling.refresh_consumers().await?;
        }
        Ok(())
    }

    /// Recover the transport in `direction` after an ICE failure: restart ICE
    /// on an open transport, recreate a closed or missing one. No-op while
    /// signaling is disconnected. Failures are logged, never propagated.
    pub async fn restart_ice(&self, direction: TransportDirection) {
        let Some(signaling) = self.connected_signaling() else {
            tracing::debug!(%direction, "Skipping ICE restart, signaling disconnected");
            return;
        };

        let result = match self.transport(direction).filter(|t| !t.is_closed()) {
            Some(transport) => self.ice_restart(&signaling, transport).await,
            None => self.recreate(direction).await,
        };

        if let Err(e) = result {
            self.emitter.emit(RtcLevel::Error, RtcTag::Rtc, || {
                format!("{direction} transport [recreate] failed: {e}")
            });
        }
    }

    async fn ice_restart(
        &self,
        signaling: &SignalingHandler,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<(), TransportError> {
        let direction = transport.direction();
        self.emitter
            .emit(RtcLevel::Log, RtcTag::Rtc, || format!("Restarting {direction} transport ICE"));
        let ice_parameters = signaling.restart_ice(transport.id()).await?;
        transport.restart_ice(ice_parameters).await?;
        Ok(())
    }

    fn on_state_change(&self, direction: TransportDirection, transport_id: &str, state: ConnectionState) {
        let level = match state {
            ConnectionState::Failed | ConnectionState::Disconnected => RtcLevel::Error,
            _ => RtcLevel::Info,
        };
        self.emitter.emit(level, RtcTag::Rtc, || {
            format!("{direction} transport [connectionstatechange]: {state}")
        });

        if state != ConnectionState::Failed {
            return;
        }
        let stale = self
            .transport(direction)
            .is_some_and(|current| current.id() != transport_id);
        if stale {
            tracing::debug!(transport_id, "Ignoring failure of replaced transport");
            return;
        }
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { manager.restart_ice(direction).await });
    }

    /// Server-side stats of both transports and everything bound to them.
    /// `None` while signaling is disconnected.
    pub async fn server_stats(&self) -> Option<ServerStats> {
        let signaling = self.connected_signaling()?;
        match self.collect_stats(&signaling).await {
            Ok(reports) => Some(ServerStats::Transports(reports)),
            Err(e) => {
                let error = format!("Error getting the server status: {e}");
                self.emitter.emit(RtcLevel::Error, RtcTag::Adapter, || error.clone());
                Some(ServerStats::Error { error })
            }
        }
    }

    async fn collect_stats(
        &self,
        signaling: &SignalingHandler,
    ) -> Result<BTreeMap<String, TransportStatsReport>, SignalingError> {
        let mut reports = BTreeMap::new();
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let Some(transport) = self.transport(direction).filter(|t| !t.is_closed()) else {
                continue;
            };
            let mut report = TransportStatsReport {
                name: direction.label().to_string(),
                stats: signaling.transport_stats(transport.id()).await?,
                producers: BTreeMap::new(),
                consumers: BTreeMap::new(),
            };
            match direction {
                TransportDirection::Send => {
                    for id in self.registry.producer_ids() {
                        let stats = signaling.producer_stats(&id).await?;
                        report.producers.insert(id, stats);
                    }
                }
                TransportDirection::Recv => {
                    for id in self.registry.consumer_ids() {
                        let stats = signaling.consumer_stats(&id).await?;
                        report.consumers.insert(id, stats);
                    }
                }
            }
            reports.insert(transport.id().to_string(), report);
        }
        Ok(reports)
    }
}

/// Per-transport callbacks, bound to the signaling channel that allocated
/// the transport
struct TransportWiring {
    direction: TransportDirection,
    transport_id: String,
    signaling: SignalingHandler,
    emitter: RtcEmitter,
    manager: Weak<TransportManager>,
}

#[async_trait]
impl TransportHandler for TransportWiring {
    async fn on_connect(&self, dtls_parameters: Value) -> Result<(), MediaError> {
        let direction = self.direction;
        self.emitter
            .emit(RtcLevel::Info, RtcTag::Rtc, || format!("{direction} transport [connect]"));
        self.signaling
            .connect_webrtc_transport(&self.transport_id, dtls_parameters)
            .await?;
        Ok(())
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, MediaError> {
        let direction = self.direction;
        self.emitter
            .emit(RtcLevel::Info, RtcTag::Rtc, || format!("{direction} transport [produce]: {kind}"));
        self.signaling
            .produce(&self.transport_id, kind, rtp_parameters, app_data)
            .await
            .map_err(|e| {
                self.emitter
                    .emit(RtcLevel::Error, RtcTag::Signaling, || format!("[produce] error: {e}"));
                MediaError::from(e)
            })
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_state_change(self.direction, &self.transport_id, state);
        }
    }
}
