//! Session controller
//!
//! Sequences connect, join, publish/consume, recovery and disconnect for one
//! participant in one room.
//!
//! ```text
//! connect ─► open signaling ─► load engine ─► send + recv transports ─► join
//!         ─► join alternate backend ─► re-apply local stream ─► Joined
//! ```
//!
//! After joining, one event pump per signaling channel handles server
//! requests and notifications. An unexpected channel close hands over to
//! host failover, which reconnects against a different host or fails the
//! session.

use crate::backend::{BackendBridge, BackendConnector, BackendError};
use crate::environment::SessionEnvironment;
use crate::ice::signaling_url;
use crate::identity::PeerId;
use crate::media::{
    ConsumeOptions, MediaEngine, MediaError, MediaStream, MediaTrack, ProduceOptions, Producer,
};
use crate::pending::{PendingError, PendingRequests, PendingStream, TrackSource};
use crate::registry::Registry;
use crate::signaling::{
    ChannelEvent, NewConsumer, Notification, RequestResponder, ServerNotification, ServerRequest,
    ServerRequestKind, SignalingConnector, SignalingError, SignalingHandler,
};
use crate::telemetry::{RtcEmitter, RtcLevel, RtcTag};
use crate::transport::{ServerStats, TransportConfig, TransportError, TransportManager};
use crate::types::{
    ConnectParams, ConsumerStats, ContentHint, MediaKind, ProducerTag, SessionConfig, SessionState,
    StreamUpdate, TransportDirection,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// `connect` called on a live session
    #[error("Session already connected")]
    AlreadyConnected,

    /// Operation needs a connected session
    #[error("Session not connected")]
    NotConnected,

    /// Signaling channel closed before the room was joined
    #[error("Signaling channel closed before join")]
    ChannelClosed,

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Alternate backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Pending request error
    #[error("Media request error: {0}")]
    Pending(#[from] PendingError),

    /// `disconnect` was called while connecting
    #[error("Session closed while connecting")]
    Closed,
}

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Room joined (initially or after failover)
    Connected,
    /// Unrecoverable connection failure
    FatalError(String),
}

/// Microphone state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicState {
    /// Whether the local microphone is live
    pub enabled: bool,
}

/// Moderation action observable by the surrounding UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModerationEvent {
    /// Participant blocked
    Blocked(PeerId),
    /// Participant unblocked
    Unblocked(PeerId),
    /// Participant kicked from the room
    Kicked(PeerId),
}

struct EventChannels {
    connection: broadcast::Sender<ConnectionEvent>,
    streams: broadcast::Sender<StreamUpdate>,
    mic: broadcast::Sender<MicState>,
    moderation: broadcast::Sender<ModerationEvent>,
}

impl EventChannels {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            connection: broadcast::channel(capacity).0,
            streams: broadcast::channel(capacity).0,
            mic: broadcast::channel(capacity).0,
            moderation: broadcast::channel(capacity).0,
        }
    }
}

/// Top-level adapter for one participant
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    env: SessionEnvironment,
    connector: Arc<dyn SignalingConnector>,
    emitter: RtcEmitter,
    state: watch::Sender<SessionState>,
    /// Bumped by every `disconnect`; an in-flight connect from an older
    /// epoch gives up quietly
    shutdown: watch::Sender<u64>,
    params: Mutex<Option<ConnectParams>>,
    signaling: Mutex<Option<SignalingHandler>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    failover: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<Registry>,
    pending: Arc<PendingRequests>,
    transports: Arc<TransportManager>,
    backend: Arc<BackendBridge>,
    local_stream: Mutex<Option<Arc<MediaStream>>>,
    events: EventChannels,
    this: Weak<Inner>,
}

impl SessionController {
    /// Create a disconnected session
    pub fn new(
        config: SessionConfig,
        env: SessionEnvironment,
        connector: Arc<dyn SignalingConnector>,
        engine: Arc<dyn MediaEngine>,
        backend: Option<Arc<dyn BackendConnector>>,
    ) -> Self {
        let emitter = RtcEmitter::new(env.telemetry.clone(), config.verbose_diagnostics);
        let events = EventChannels::new(config.event_capacity);
        let registry = Arc::new(Registry::new());
        let pending = Arc::new(PendingRequests::new());
        let transports = TransportManager::new(engine, registry.clone(), emitter.clone());
        let backend = BackendBridge::new(
            backend,
            pending.clone(),
            registry.clone(),
            events.streams.clone(),
            emitter.clone(),
        );

        let inner = Arc::new_cyclic(|this| Inner {
            config,
            env,
            connector,
            emitter,
            state: watch::channel(SessionState::Disconnected).0,
            shutdown: watch::channel(0).0,
            params: Mutex::new(None),
            signaling: Mutex::new(None),
            pump: Mutex::new(None),
            failover: Mutex::new(None),
            registry,
            pending,
            transports,
            backend,
            local_stream: Mutex::new(None),
            events,
            this: this.clone(),
        });
        Self { inner }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Connection lifecycle events
    #[must_use]
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.connection.subscribe()
    }

    /// Stream availability updates
    #[must_use]
    pub fn subscribe_streams(&self) -> broadcast::Receiver<StreamUpdate> {
        self.inner.events.streams.subscribe()
    }

    /// Microphone state changes
    #[must_use]
    pub fn subscribe_mic(&self) -> broadcast::Receiver<MicState> {
        self.inner.events.mic.subscribe()
    }

    /// Block/unblock/kick notifications
    #[must_use]
    pub fn subscribe_moderation(&self) -> broadcast::Receiver<ModerationEvent> {
        self.inner.events.moderation.subscribe()
    }

    /// Connect and join. Resolves once the room is joined; a failure emits
    /// [`ConnectionEvent::FatalError`] and is not retried.
    ///
    /// # Errors
    ///
    /// Returns error if the session is already live or any join step fails
    #[tracing::instrument(skip(self, params), fields(room_id = %params.room_id, client_id = %params.client_id))]
    pub async fn connect(&self, params: ConnectParams) -> Result<(), SessionError> {
        if !matches!(self.state(), SessionState::Disconnected | SessionState::Failed) {
            return Err(SessionError::AlreadyConnected);
        }
        self.inner.connect(params).await
    }

    /// Tear down the session. Idempotent. Outstanding media requests are
    /// rejected with [`PendingError::SessionClosed`].
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shutdown.send_modify(|epoch| *epoch += 1);
        for task in [inner.pump.lock().take(), inner.failover.lock().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        inner.cleanup_local_state().await;
        if let Some(signaling) = inner.take_signaling() {
            if signaling.is_connected() {
                signaling.close();
                inner
                    .emitter
                    .emit(RtcLevel::Info, RtcTag::Signaling, || "[close]".to_string());
            }
        }
        inner.pending.reject_all(PendingError::SessionClosed);
        inner.transition(SessionState::Disconnected);
    }

    /// Stream holding participant `peer`'s track of `kind`. Resolves at once
    /// when the track is already available, otherwise when it arrives from
    /// either backend, or to `None` when the participant leaves first.
    /// Fails with [`PendingError::SessionClosed`] unless the session is live.
    pub fn get_media_stream(&self, peer: &PeerId, kind: MediaKind) -> PendingStream {
        let inner = &self.inner;
        if matches!(self.state(), SessionState::Disconnected | SessionState::Failed) {
            return futures::future::ready(Err(PendingError::SessionClosed))
                .boxed()
                .shared();
        }
        if inner.is_local(peer) {
            let local = LocalTracks {
                backend: &inner.backend,
                registry: &inner.registry,
            };
            inner.pending.get(peer, kind, &[&local as &dyn TrackSource])
        } else {
            inner
                .pending
                .get(peer, kind, &[inner.backend.as_ref() as &dyn TrackSource, inner.registry.as_ref()])
        }
    }

    /// Publish a captured local stream. Audio goes to the microphone path,
    /// screen video to screen share, camera video to the camera path; kinds
    /// absent from `stream` are switched off. The stream is re-applied after
    /// every (re)join.
    ///
    /// # Errors
    ///
    /// Returns error if publishing a track fails
    pub async fn set_local_media_stream(&self, stream: Arc<MediaStream>) -> Result<(), SessionError> {
        *self.inner.local_stream.lock() = Some(stream.clone());
        self.inner.apply_local_stream(stream).await
    }

    /// Publish a camera track
    ///
    /// # Errors
    ///
    /// Returns error if publishing fails
    pub async fn enable_camera(&self, track: &MediaTrack) -> Result<(), SessionError> {
        self.inner.publish_local(ProducerTag::Camera, track).await
    }

    /// Stop sending camera video
    pub async fn disable_camera(&self) {
        self.inner.disable_camera().await;
    }

    /// Publish a screen-share track through the primary transport
    ///
    /// # Errors
    ///
    /// Returns error if there is no send transport or publishing fails
    pub async fn enable_share(&self, track: &MediaTrack) -> Result<(), SessionError> {
        self.inner.enable_share(track).await
    }

    /// Close the screen-share producer
    pub async fn disable_share(&self) {
        self.inner.disable_share().await;
    }

    /// React to a local capture track ending. Closes the screen share when
    /// it carried `track`.
    pub async fn handle_share_track_ended(&self, track: &MediaTrack) {
        let sharing = self
            .inner
            .registry
            .producer(ProducerTag::ScreenShare)
            .is_some_and(|p| p.track() == track);
        if sharing {
            self.inner
                .emitter
                .emit(RtcLevel::Info, RtcTag::Rtc, || "Desktop Share track ended".to_string());
            self.inner.disable_share().await;
        }
    }

    /// Mute or unmute the local microphone and emit [`MicState`]
    pub fn enable_microphone(&self, enabled: bool) {
        self.inner.enable_microphone(enabled);
    }

    /// Flip the local microphone
    pub fn toggle_microphone(&self) {
        self.inner.enable_microphone(!self.inner.is_mic_enabled());
    }

    /// Mute the local microphone without emitting an event
    pub fn disable_microphone(&self) {
        self.inner.disable_microphone();
    }

    /// Whether the local microphone is live
    #[must_use]
    pub fn is_mic_enabled(&self) -> bool {
        self.inner.is_mic_enabled()
    }

    /// Remove a participant from the room
    ///
    /// # Errors
    ///
    /// Returns error if signaling is unavailable or the server refuses
    pub async fn kick(&self, peer: &PeerId) -> Result<(), SessionError> {
        let inner = &self.inner;
        let signaling = inner.connected_signaling()?;
        let room_id = inner.params.lock().as_ref().map(|p| p.room_id.clone()).unwrap_or_default();
        signaling.kick(&room_id, peer, inner.env.tokens.token()).await?;
        let _ = inner.events.moderation.send(ModerationEvent::Kicked(peer.clone()));
        Ok(())
    }

    /// Block a participant and mute their streams
    ///
    /// # Errors
    ///
    /// Returns error if signaling is unavailable or the server refuses
    pub async fn block(&self, peer: &PeerId) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.connected_signaling()?.block(peer).await?;
        inner.registry.block(peer.clone());
        inner.backend.mute_remote(peer);
        let _ = inner.events.moderation.send(ModerationEvent::Blocked(peer.clone()));
        Ok(())
    }

    /// Unblock a participant and unmute their streams
    ///
    /// # Errors
    ///
    /// Returns error if signaling is unavailable or the server refuses
    pub async fn unblock(&self, peer: &PeerId) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.connected_signaling()?.unblock(peer).await?;
        inner.registry.unblock(peer);
        inner.backend.unmute_remote(peer);
        let _ = inner.events.moderation.send(ModerationEvent::Unblocked(peer.clone()));
        Ok(())
    }

    /// Whether `peer` is blocked by the local user
    #[must_use]
    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.inner.registry.is_blocked(peer)
    }

    /// Server-side transport, producer and consumer stats; `None` while
    /// signaling is disconnected
    pub async fn get_server_stats(&self) -> Option<ServerStats> {
        self.inner.transports.server_stats().await
    }

    /// Per-consumer quality statistics
    #[must_use]
    pub fn consumer_stats(&self) -> HashMap<String, ConsumerStats> {
        self.inner.registry.consumer_stats()
    }

    /// Last downlink bandwidth estimate from the server
    #[must_use]
    pub fn downlink_bwe(&self) -> Option<Value> {
        self.inner.registry.downlink_bwe()
    }
}

impl Inner {
    fn is_local(&self, peer: &PeerId) -> bool {
        self.params.lock().as_ref().is_some_and(|p| &p.client_id == peer)
    }

    fn local_peer(&self) -> Option<PeerId> {
        self.params.lock().as_ref().map(|p| p.client_id.clone())
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if *state == to {
                return false;
            }
            if !state.can_transition_to(to) {
                tracing::warn!(from = ?state, to = ?to, "Invalid session state transition");
                return false;
            }
            tracing::debug!(from = ?state, to = ?to, "Session state transition");
            *state = to;
            applied = true;
            true
        });
        applied
    }

    fn connected_signaling(&self) -> Result<SignalingHandler, SessionError> {
        self.signaling
            .lock()
            .clone()
            .filter(SignalingHandler::is_connected)
            .ok_or(SessionError::NotConnected)
    }

    fn take_signaling(&self) -> Option<SignalingHandler> {
        self.transports.detach();
        self.signaling.lock().take()
    }

    async fn connect(&self, params: ConnectParams) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown.subscribe();
        let epoch = *shutdown.borrow_and_update();
        self.transition(SessionState::Connecting);
        *self.params.lock() = Some(params.clone());

        let joined = tokio::select! {
            biased;
            _ = shutdown.changed() => Err(SessionError::Closed),
            joined = self.open_and_join(&params) => joined,
        };
        if *self.shutdown.borrow() != epoch {
            tracing::debug!("Connect abandoned by disconnect");
            return Err(SessionError::Closed);
        }

        match joined {
            Ok(events) => {
                self.transition(SessionState::Joined);
                self.spawn_pump(events);
                let _ = self.events.connection.send(ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.emitter
                    .emit(RtcLevel::Warn, RtcTag::Adapter, || format!("Error during connect: {e}"));
                if let Some(signaling) = self.take_signaling() {
                    signaling.close();
                }
                self.cleanup_local_state().await;
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn open_and_join(
        &self,
        params: &ConnectParams,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, SessionError> {
        let url = signaling_url(&params.server_url, &params.room_id, &params.client_id)
            .map_err(SignalingError::from)?;
        let (channel, mut events) = self
            .connector
            .connect(&url, self.config.signaling_retries)
            .await?;
        let signaling = SignalingHandler::new(channel);
        *self.signaling.lock() = Some(signaling.clone());
        self.transports.attach(
            signaling.clone(),
            TransportConfig::for_host(&params.server_params, &self.config),
        );

        self.await_open(&mut events).await?;
        self.transition(SessionState::Joining);
        self.join_room(&signaling, params).await?;
        Ok(events)
    }

    async fn await_open(&self, events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Result<(), SessionError> {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    self.emitter
                        .emit(RtcLevel::Info, RtcTag::Signaling, || "Open".to_string());
                    return Ok(());
                }
                ChannelEvent::Close => break,
                ChannelEvent::Request(request) => {
                    request.responder.reject(503, "room not joined");
                }
                other => self.handle_channel_event(other).await,
            }
        }
        Err(SessionError::ChannelClosed)
    }

    #[tracing::instrument(skip_all)]
    async fn join_room(&self, signaling: &SignalingHandler, params: &ConnectParams) -> Result<(), SessionError> {
        let engine = self.transports.engine().clone();
        let router_rtp_capabilities = signaling.router_rtp_capabilities().await?;
        engine.load(router_rtp_capabilities).await?;

        self.transports.create_send_transport().await?;
        self.transports.create_recv_transport().await?;

        let rtp_capabilities = engine.rtp_capabilities().ok_or(MediaError::NotLoaded)?;
        signaling
            .join(&params.client_id, rtp_capabilities, self.env.tokens.token())
            .await?;
        tracing::info!("Joined room");

        self.backend
            .join(self.env.tokens.as_ref(), &params.room_id, &params.client_id)
            .await;

        let local_stream = self.local_stream.lock().clone();
        if let Some(stream) = local_stream {
            self.apply_local_stream(stream).await?;
        }
        Ok(())
    }

    fn spawn_pump(&self, events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let pump = tokio::spawn(run_pump(self.this.clone(), events));
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                self.emitter
                    .emit(RtcLevel::Info, RtcTag::Signaling, || "Open".to_string());
                if self.state() == SessionState::Degraded {
                    self.rejoin().await;
                }
            }
            ChannelEvent::Disconnected => {
                self.emitter
                    .emit(RtcLevel::Info, RtcTag::Signaling, || "Disconnected".to_string());
                self.cleanup_local_state().await;
                self.transition(SessionState::Degraded);
            }
            ChannelEvent::Failed { attempt } => {
                self.emitter.emit(RtcLevel::Error, RtcTag::Signaling, || {
                    format!("Failed: {attempt}, retrying...")
                });
            }
            ChannelEvent::Close => {
                self.emitter
                    .emit(RtcLevel::Error, RtcTag::Signaling, || "Closed".to_string());
            }
            ChannelEvent::Request(request) => self.handle_request(request).await,
            ChannelEvent::Notification(notification) => self.handle_notification(&notification),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn rejoin(&self) {
        let signaling = self.signaling.lock().clone();
        let params = self.params.lock().clone();
        let (Some(signaling), Some(params)) = (signaling, params) else {
            return;
        };
        match self.join_room(&signaling, &params).await {
            Ok(()) => {
                self.transition(SessionState::Joined);
                let _ = self.events.connection.send(ConnectionEvent::Connected);
            }
            Err(e) => {
                self.emitter
                    .emit(RtcLevel::Warn, RtcTag::Adapter, || format!("Error during rejoin: {e}"));
                self.fail(e.to_string());
            }
        }
    }

    async fn handle_request(&self, request: ServerRequest) {
        let ServerRequest {
            method,
            data,
            responder,
        } = request;
        self.emitter.emit(RtcLevel::Info, RtcTag::Signaling, || {
            format!("Request [{method}]: {}", data.get("id").unwrap_or(&Value::Null))
        });

        match ServerRequestKind::parse(&method, &data) {
            Ok(ServerRequestKind::NewConsumer(new_consumer)) => {
                self.handle_new_consumer(new_consumer, responder).await;
            }
            Err(e) => {
                tracing::warn!(method = %method, error = %e, "Rejecting server request");
                responder.reject(400, e.to_string());
            }
        }
    }

    async fn handle_new_consumer(&self, new_consumer: NewConsumer, responder: RequestResponder) {
        let NewConsumer {
            peer_id,
            producer_id,
            id,
            kind,
            rtp_parameters,
            mut app_data,
            ..
        } = new_consumer;

        let Some(recv) = self
            .transports
            .transport(TransportDirection::Recv)
            .filter(|t| !t.is_closed())
        else {
            self.emitter
                .emit(RtcLevel::Error, RtcTag::Adapter, || "newConsumer without receive transport".to_string());
            responder.reject(500, "no receive transport");
            return;
        };

        if let Value::Object(map) = &mut app_data {
            map.insert("peerId".to_string(), Value::String(peer_id.to_string()));
        } else {
            app_data = serde_json::json!({ "peerId": peer_id });
        }

        let consumer = match recv
            .consume(ConsumeOptions {
                id,
                producer_id,
                kind,
                rtp_parameters,
                app_data,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.emitter
                    .emit(RtcLevel::Error, RtcTag::Adapter, || format!("Error: {e}"));
                responder.reject(500, e.to_string());
                return;
            }
        };

        let current = self.transports.transport(TransportDirection::Recv);
        if recv.is_closed() || current.map_or(true, |t| t.id() != recv.id()) {
            self.emitter.emit(RtcLevel::Warn, RtcTag::Adapter, || {
                format!("Receive transport closed while consuming {}", consumer.id())
            });
            consumer.close();
            responder.reject(500, "transport closed");
            return;
        }

        self.registry.add_consumer(peer_id.clone(), consumer.clone());
        // The server resumes the consumer once acknowledged
        responder.accept(Value::Null);

        self.pending.resolve(&peer_id, consumer.track());
        let _ = self.events.streams.send(StreamUpdate { peer: peer_id, kind });
    }

    fn handle_notification(&self, notification: &Notification) {
        let parsed = match ServerNotification::parse(notification) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(method = %notification.method, error = %e, "Ignoring notification");
                return;
            }
        };

        match parsed {
            ServerNotification::NewPeer(_) => {}
            ServerNotification::PeerClosed { peer_id } => {
                self.registry.remove_peer_consumers(&peer_id);
                if self.pending.resolve_peer_departed(&peer_id) > 0 {
                    tracing::info!(peer = %peer_id, "Peer left before its media stream was resolved");
                }
            }
            ServerNotification::ConsumerClosed { consumer_id } => {
                self.registry.remove_consumer(&consumer_id);
            }
            ServerNotification::PeerBlocked { peer_id } => {
                self.backend.mute_remote(&peer_id);
                let _ = self.events.moderation.send(ModerationEvent::Blocked(peer_id));
            }
            ServerNotification::PeerUnblocked { peer_id } => {
                self.backend.unmute_remote(&peer_id);
                let _ = self.events.moderation.send(ModerationEvent::Unblocked(peer_id));
            }
            ServerNotification::DownlinkBwe(bwe) => self.registry.set_downlink_bwe(bwe),
            ServerNotification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.registry
                    .update_layers(&consumer_id, spatial_layer, temporal_layer);
            }
            ServerNotification::ConsumerScore { consumer_id, score } => {
                self.registry.update_score(&consumer_id, score);
            }
        }
    }

    /// Close local transports and leave the alternate backend, without
    /// telling the server
    async fn cleanup_local_state(&self) {
        self.transports.close_local();
        self.backend.teardown().await;
    }

    fn fail(&self, reason: String) {
        self.transition(SessionState::Failed);
        let _ = self
            .events
            .connection
            .send(ConnectionEvent::FatalError(reason.clone()));
        self.pending.reject_all(PendingError::ConnectionFailed(reason));
    }

    async fn apply_local_stream(&self, stream: Arc<MediaStream>) -> Result<(), SessionError> {
        if self.transports.transport(TransportDirection::Send).is_none() {
            tracing::error!("Local media stream set before a send transport existed");
            return Ok(());
        }
        self.emitter
            .emit(RtcLevel::Info, RtcTag::Rtc, || "Creating missing producers".to_string());

        let local = self.local_peer();
        let mut saw_audio = false;
        let mut saw_video = false;
        for track in stream.tracks() {
            match track.kind() {
                MediaKind::Audio => {
                    saw_audio = true;
                    self.publish_local(ProducerTag::Mic, track).await?;
                    self.emit_mic_state();
                }
                MediaKind::Video => {
                    saw_video = true;
                    match track.content_hint() {
                        Some(ContentHint::Screen) => {
                            self.disable_camera().await;
                            self.enable_share(track).await?;
                        }
                        Some(ContentHint::Camera) => {
                            self.disable_share().await;
                            self.publish_local(ProducerTag::Camera, track).await?;
                        }
                        None => {}
                    }
                }
            }
            if let Some(local) = &local {
                self.pending.resolve(local, track);
            }
        }

        if !saw_audio {
            self.disable_microphone();
        }
        if !saw_video {
            self.disable_camera().await;
            self.disable_share().await;
        }
        Ok(())
    }

    /// Camera and microphone go through the alternate backend while it is
    /// active, through the send transport otherwise
    async fn publish_local(&self, tag: ProducerTag, track: &MediaTrack) -> Result<(), SessionError> {
        if self.backend.is_active() {
            self.backend.publish_track(track).await?;
            return Ok(());
        }

        if self.registry.producer(tag).is_some_and(|p| p.track() == track) {
            return Ok(());
        }
        let send = self
            .transports
            .transport(TransportDirection::Send)
            .filter(|t| !t.is_closed())
            .ok_or(TransportError::Missing(TransportDirection::Send))?;
        let producer = send
            .produce(ProduceOptions::tagged(track.clone(), tag.as_str()))
            .await?;
        if let Some(previous) = self.registry.take_producer(tag) {
            self.close_producer(previous).await;
        }
        self.registry.set_producer(tag, producer);
        Ok(())
    }

    async fn disable_camera(&self) {
        if self.backend.is_active() {
            self.backend.mute_local(MediaKind::Video);
        } else if let Some(producer) = self.registry.take_producer(ProducerTag::Camera) {
            self.close_producer(producer).await;
        }
    }

    async fn enable_share(&self, track: &MediaTrack) -> Result<(), SessionError> {
        let send = self
            .transports
            .transport(TransportDirection::Send)
            .filter(|t| !t.is_closed())
            .ok_or(TransportError::Missing(TransportDirection::Send))?;
        let producer = send.produce(ProduceOptions::screen_share(track.clone())).await?;
        if let Some(previous) = self.registry.take_producer(ProducerTag::ScreenShare) {
            self.close_producer(previous).await;
        }
        self.registry.set_producer(ProducerTag::ScreenShare, producer);
        Ok(())
    }

    async fn disable_share(&self) {
        if let Some(producer) = self.registry.take_producer(ProducerTag::ScreenShare) {
            self.close_producer(producer).await;
        }
    }

    /// Close locally, then release server-side on a best-effort basis
    async fn close_producer(&self, producer: Arc<dyn Producer>) {
        producer.close();
        if !self.transports.is_open(TransportDirection::Send) {
            return;
        }
        let Ok(signaling) = self.connected_signaling() else {
            return;
        };
        if let Err(e) = signaling.close_producer(producer.id()).await {
            tracing::warn!(producer_id = producer.id(), error = %e, "Failed to release server producer");
        }
    }

    fn local_audio_track(&self) -> Option<MediaTrack> {
        self.backend
            .local_track(MediaKind::Audio)
            .or_else(|| self.registry.producer(ProducerTag::Mic).map(|p| p.track().clone()))
    }

    fn is_mic_enabled(&self) -> bool {
        self.local_audio_track().is_some_and(|t| t.is_enabled())
    }

    fn enable_microphone(&self, enabled: bool) {
        let Some(track) = self.local_audio_track() else {
            tracing::error!("Tried to toggle mic but there is no local audio track");
            return;
        };
        if enabled != track.is_enabled() {
            if self.backend.local_track(MediaKind::Audio).is_some() {
                if enabled {
                    self.backend.unmute_local(MediaKind::Audio);
                } else {
                    self.backend.mute_local(MediaKind::Audio);
                }
            } else {
                track.set_enabled(enabled);
            }
            tracing::debug!(enabled, "Microphone toggled");
        }
        self.emit_mic_state();
    }

    fn disable_microphone(&self) {
        if self.backend.local_track(MediaKind::Audio).is_some() {
            self.backend.mute_local(MediaKind::Audio);
        } else if let Some(producer) = self.registry.producer(ProducerTag::Mic) {
            producer.track().set_enabled(false);
        }
    }

    fn emit_mic_state(&self) {
        let _ = self.events.mic.send(MicState {
            enabled: self.is_mic_enabled(),
        });
    }

    /// Host failover after an unexpected signaling close. Boxed because it
    /// re-enters `connect`, which spawns the next pump.
    fn failover(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.transition(SessionState::Degraded);
            self.cleanup_local_state().await;
            if let Some(signaling) = self.take_signaling() {
                signaling.close();
            }

            let Some(params) = self.params.lock().clone() else {
                return;
            };
            let server_params = match self.env.host_resolver.resolve_host(&params.room_id).await {
                Ok(server_params) => server_params,
                Err(e) => {
                    tracing::error!(error = %e, "Host lookup failed");
                    self.fail(format!("host lookup failed: {e}"));
                    return;
                }
            };

            let server_url = server_params.server_url();
            if server_url == params.server_url {
                tracing::error!(server_url = %server_url, "Reconnect failed, host unchanged");
                self.fail("reconnect failed: host unchanged".to_string());
                return;
            }

            tracing::info!(server_url = %server_url, "Server changed, reconnecting");
            let next = ConnectParams {
                server_url,
                room_id: params.room_id,
                client_id: params.client_id,
                server_params,
            };
            if let Err(e) = self.connect(next).await {
                tracing::error!(error = %e, "Failover reconnect failed");
            }
        }
        .boxed()
    }
}

async fn run_pump(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let ChannelEvent::Close = event {
            // Intentional shutdowns abort the pump first, so this close was
            // not requested locally
            inner.handle_channel_event(ChannelEvent::Close).await;
            let failover = tokio::spawn(inner.clone().failover());
            *inner.failover.lock() = Some(failover);
            return;
        }
        inner.handle_channel_event(event).await;
    }
}

/// Local participant's tracks: alternate-backend local stream first, then
/// primary producers
struct LocalTracks<'a> {
    backend: &'a BackendBridge,
    registry: &'a Registry,
}

impl TrackSource for LocalTracks<'_> {
    fn lookup_track(&self, _peer: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
        self.backend.local_track(kind).or_else(|| {
            let tags: &[ProducerTag] = match kind {
                MediaKind::Audio => &[ProducerTag::Mic],
                MediaKind::Video => &[ProducerTag::Camera, ProducerTag::ScreenShare],
            };
            tags.iter()
                .find_map(|tag| self.registry.producer(*tag))
                .map(|p| p.track().clone())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::MediaTransport;
    use crate::signaling::{methods, RequestOutcome};
    use crate::testing::{
        eventually, FakeBackend, FakeHostResolver, FakeMediaEngine, FakeTokens, ScriptedConnector,
    };
    use crate::types::{ServerParams, TurnConfig, TurnTransport};
    use futures::FutureExt;
    use serde_json::json;

    struct Harness {
        session: SessionController,
        connector: Arc<ScriptedConnector>,
        engine: Arc<FakeMediaEngine>,
        hosts: Arc<FakeHostResolver>,
        backend: Arc<FakeBackend>,
    }

    fn server_params(host: &str, turn: Option<TurnConfig>) -> ServerParams {
        ServerParams {
            host: host.to_string(),
            port: 4443,
            turn,
        }
    }

    fn params(host: &str) -> ConnectParams {
        ConnectParams::for_host("room-1", PeerId::new("me"), server_params(host, None))
    }

    fn harness(with_backend: bool) -> Harness {
        let connector = Arc::new(ScriptedConnector::new());
        let engine = Arc::new(FakeMediaEngine::new());
        let hosts = Arc::new(FakeHostResolver::new(server_params("b.example.com", None)));
        let backend = Arc::new(FakeBackend::new());
        let env = SessionEnvironment::new(hosts.clone(), Arc::new(FakeTokens::default()));
        let session = SessionController::new(
            SessionConfig::default(),
            env,
            connector.clone(),
            engine.clone(),
            with_backend.then(|| backend.clone() as Arc<dyn BackendConnector>),
        );
        Harness {
            session,
            connector,
            engine,
            hosts,
            backend,
        }
    }

    /// Records the server request's answer at the moment a waiter is woken
    struct AckOnWake {
        outcome: Mutex<tokio::sync::oneshot::Receiver<RequestOutcome>>,
        seen: Mutex<Option<Option<RequestOutcome>>>,
    }

    impl futures::task::ArcWake for AckOnWake {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            let answered = arc_self.outcome.lock().try_recv().ok();
            arc_self.seen.lock().get_or_insert(answered);
        }
    }

    fn new_consumer(peer: &str, id: &str, kind: &str) -> Value {
        json!({
            "peerId": peer,
            "producerId": format!("p-{id}"),
            "id": id,
            "kind": kind,
            "rtpParameters": { "encodings": [{ "scalabilityMode": "L3T3" }] },
            "appData": {},
            "producerPaused": false
        })
    }

    #[tokio::test]
    async fn test_connect_join_sequence() {
        let h = harness(false);
        let mut connection = h.session.subscribe_connection();
        h.session.connect(params("a.example.com")).await.unwrap();

        assert_eq!(h.session.state(), SessionState::Joined);
        assert_eq!(connection.recv().await.unwrap(), ConnectionEvent::Connected);
        let channel = h.connector.channel(0);
        assert_eq!(
            channel.methods(),
            vec![
                methods::GET_ROUTER_RTP_CAPABILITIES,
                methods::CREATE_WEBRTC_TRANSPORT,
                methods::CREATE_WEBRTC_TRANSPORT,
                methods::JOIN,
            ]
        );
        let url = h.connector.urls()[0].to_string();
        assert!(url.starts_with("wss://a.example.com:4443"));
        assert!(url.contains("roomId=room-1"));
        assert!(url.contains("peerId=me"));
        assert!(matches!(
            h.session.connect(params("a.example.com")).await,
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_ice_servers_follow_turn_config() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        assert!(h.engine.ice_server_counts().iter().all(|count| *count == 2));

        let h = harness(false);
        let turn = TurnConfig {
            enabled: true,
            username: "u".to_string(),
            credential: "c".to_string(),
            transports: vec![TurnTransport { port: 3478 }],
        };
        let with_turn = ConnectParams::for_host(
            "room-1",
            PeerId::new("me"),
            server_params("a.example.com", Some(turn)),
        );
        h.session.connect(with_turn).await.unwrap();
        assert_eq!(h.engine.ice_server_counts(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_join_failure_is_fatal() {
        let h = harness(false);
        let channel = h.connector.prepare();
        channel.fail(methods::JOIN, "room full");
        let mut connection = h.session.subscribe_connection();

        let result = h.session.connect(params("a.example.com")).await;
        assert!(matches!(result, Err(SessionError::Signaling(_))));
        assert_eq!(h.session.state(), SessionState::Failed);
        assert!(matches!(
            connection.recv().await.unwrap(),
            ConnectionEvent::FatalError(_)
        ));
        assert_eq!(h.connector.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_new_consumer_acknowledged_before_resolution() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let alice = PeerId::new("alice");
        let mut streams = h.session.subscribe_streams();

        let mut waiting = h.session.get_media_stream(&alice, MediaKind::Video);
        let outcome = channel.server_request(methods::NEW_CONSUMER, new_consumer("alice", "c1", "video"));
        let ack = Arc::new(AckOnWake {
            outcome: Mutex::new(outcome),
            seen: Mutex::new(None),
        });
        let waker = futures::task::waker(ack.clone());
        let mut cx = std::task::Context::from_waker(&waker);
        assert!(waiting.poll_unpin(&mut cx).is_pending());

        assert!(eventually(|| ack.seen.lock().is_some()).await);
        assert_eq!(
            ack.seen.lock().clone().unwrap(),
            Some(RequestOutcome::Accepted(Value::Null))
        );
        let stream = waiting.await.unwrap().unwrap();
        assert_eq!(stream.tracks()[0].kind(), MediaKind::Video);
        assert_eq!(
            streams.recv().await.unwrap(),
            StreamUpdate {
                peer: alice.clone(),
                kind: MediaKind::Video
            }
        );

        let stats = h.session.consumer_stats();
        assert_eq!(stats["c1"].spatial_layers, Some(3));

        // Already present: resolves without waiting
        let again = h.session.get_media_stream(&alice, MediaKind::Video);
        assert!(again.now_or_never().unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_new_consumer_rejected_when_receive_transport_closes() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let recv = h
            .engine
            .transports()
            .into_iter()
            .find(|t| t.direction() == TransportDirection::Recv)
            .unwrap();
        recv.close_after_consume(true);
        let waiting = h.session.get_media_stream(&PeerId::new("alice"), MediaKind::Video);

        let outcome = channel.server_request(methods::NEW_CONSUMER, new_consumer("alice", "c1", "video"));
        assert_eq!(
            outcome.await.unwrap(),
            RequestOutcome::Rejected {
                code: 500,
                reason: "transport closed".to_string()
            }
        );
        assert!(h.session.consumer_stats().is_empty());
        assert!(waiting.now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_opening_is_not_fatal() {
        let h = harness(false);
        h.connector.hold_open(true);
        let mut connection = h.session.subscribe_connection();
        let connecting = tokio::spawn({
            let session = h.session.clone();
            async move { session.connect(params("a.example.com")).await }
        });
        assert!(eventually(|| h.connector.channels().len() == 1).await);
        assert_eq!(h.session.state(), SessionState::Connecting);
        let waiting = h.session.get_media_stream(&PeerId::new("ivy"), MediaKind::Audio);

        h.session.disconnect().await;

        assert!(matches!(connecting.await.unwrap(), Err(SessionError::Closed)));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(waiting.await, Err(PendingError::SessionClosed));
        assert!(connection.try_recv().is_err());
        assert!(h.connector.channel(0).requests().is_empty());
    }

    #[tokio::test]
    async fn test_media_request_on_idle_session_fails_at_once() {
        let h = harness(false);
        let stream = h.session.get_media_stream(&PeerId::new("jo"), MediaKind::Audio);
        assert_eq!(
            stream.now_or_never().unwrap(),
            Err(PendingError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_stream_without_signaling() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let sent = channel.methods().len();
        let bob = PeerId::new("bob");

        let first = h.session.get_media_stream(&bob, MediaKind::Audio);
        let second = h.session.get_media_stream(&bob, MediaKind::Audio);
        assert_eq!(channel.methods().len(), sent);

        let outcome = channel.server_request(methods::NEW_CONSUMER, new_consumer("bob", "a1", "audio"));
        assert!(matches!(outcome.await.unwrap(), RequestOutcome::Accepted(_)));

        let (a, b) = tokio::join!(first, second);
        assert!(Arc::ptr_eq(&a.unwrap().unwrap(), &b.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn test_peer_closed_resolves_pending_to_none() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let carol = PeerId::new("carol");

        let audio = h.session.get_media_stream(&carol, MediaKind::Audio);
        let video = h.session.get_media_stream(&carol, MediaKind::Video);
        channel.notify("peerClosed", json!({ "peerId": "carol" }));

        assert_eq!(audio.await, Ok(None));
        assert_eq!(video.await, Ok(None));
    }

    #[tokio::test]
    async fn test_stats_notifications_update_consumers() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let outcome = channel.server_request(methods::NEW_CONSUMER, new_consumer("dave", "v1", "video"));
        outcome.await.unwrap();

        channel.notify("consumerLayersChanged", json!({ "consumerId": "v1", "spatialLayer": 1, "temporalLayer": 2 }));
        channel.notify("consumerScore", json!({ "consumerId": "ghost", "score": { "score": 1 } }));
        channel.notify("downlinkBwe", json!({ "desiredBitrate": 500000 }));

        assert!(eventually(|| h.session.downlink_bwe().is_some()).await);
        let stats = h.session.consumer_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["v1"].spatial_layer, Some(1));
        assert_eq!(stats["v1"].temporal_layer, Some(2));

        channel.notify("consumerClosed", json!({ "consumerId": "v1" }));
        assert!(eventually(|| h.session.consumer_stats().is_empty()).await);
    }

    #[tokio::test]
    async fn test_block_then_unblock() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let mut moderation = h.session.subscribe_moderation();
        let eve = PeerId::new("eve");

        h.session.block(&eve).await.unwrap();
        h.session.unblock(&eve).await.unwrap();

        assert!(!h.session.is_blocked(&eve));
        assert_eq!(moderation.recv().await.unwrap(), ModerationEvent::Blocked(eve.clone()));
        assert_eq!(moderation.recv().await.unwrap(), ModerationEvent::Unblocked(eve.clone()));
        let channel = h.connector.channel(0);
        assert_eq!(channel.requests_for(methods::BLOCK), vec![json!({ "whom": "eve" })]);
    }

    #[tokio::test]
    async fn test_kick_sends_room_and_token() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let mut moderation = h.session.subscribe_moderation();

        h.session.kick(&PeerId::new("mallory")).await.unwrap();
        let channel = h.connector.channel(0);
        assert_eq!(
            channel.requests_for(methods::KICK),
            vec![json!({ "room_id": "room-1", "user_id": "mallory", "token": "token" })]
        );
        assert_eq!(
            moderation.recv().await.unwrap(),
            ModerationEvent::Kicked(PeerId::new("mallory"))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let pending = h.session.get_media_stream(&PeerId::new("frank"), MediaKind::Audio);
        let sent = channel.methods().len();

        h.session.disconnect().await;
        h.session.disconnect().await;

        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(channel.close_count(), 1);
        assert_eq!(channel.methods().len(), sent);
        assert!(h.engine.transports().iter().all(|t| t.is_closed()));
        assert_eq!(pending.await, Err(PendingError::SessionClosed));
        // No failover after an intentional close
        assert_eq!(h.hosts.calls(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_close_fails_over_to_new_host() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let pending = h.session.get_media_stream(&PeerId::new("gina"), MediaKind::Audio);
        let mut connection = h.session.subscribe_connection();

        h.connector.channel(0).close_unexpectedly();

        assert_eq!(connection.recv().await.unwrap(), ConnectionEvent::Connected);
        assert_eq!(h.session.state(), SessionState::Joined);
        assert_eq!(h.hosts.calls(), 1);
        let urls = h.connector.urls();
        assert_eq!(urls.len(), 2);
        assert!(urls[1].as_str().starts_with("wss://b.example.com:4443"));
        assert!(h.engine.transports()[..2].iter().all(|t| t.is_closed()));
        assert!(h.session.inner.pending.is_pending(&PeerId::new("gina"), MediaKind::Audio));
        drop(pending);
    }

    #[tokio::test]
    async fn test_failover_to_same_host_is_fatal() {
        let h = harness(false);
        h.hosts.set(server_params("a.example.com", None));
        h.session.connect(params("a.example.com")).await.unwrap();
        let pending = h.session.get_media_stream(&PeerId::new("hal"), MediaKind::Video);
        let mut connection = h.session.subscribe_connection();

        h.connector.channel(0).close_unexpectedly();

        assert!(matches!(
            connection.recv().await.unwrap(),
            ConnectionEvent::FatalError(_)
        ));
        assert_eq!(h.session.state(), SessionState::Failed);
        assert!(matches!(pending.await, Err(PendingError::ConnectionFailed(_))));
        assert_eq!(h.connector.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_disconnect_rejoins_on_open() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();
        let channel = h.connector.channel(0);
        let mut state = h.session.subscribe_state();

        channel.disconnect_transiently();
        state.wait_for(|s| *s == SessionState::Degraded).await.unwrap();
        assert!(h.engine.transports().iter().all(|t| t.is_closed()));

        channel.reopen();
        state.wait_for(|s| *s == SessionState::Joined).await.unwrap();
        assert_eq!(channel.requests_for(methods::JOIN).len(), 2);
        assert_eq!(h.connector.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_local_stream_through_backend() {
        let h = harness(true);
        h.session.connect(params("a.example.com")).await.unwrap();
        let me = PeerId::new("me");
        let mut mic = h.session.subscribe_mic();
        let waiting = h.session.get_media_stream(&me, MediaKind::Audio);

        let audio = MediaTrack::new(MediaKind::Audio);
        let screen = MediaTrack::new(MediaKind::Video).with_hint(ContentHint::Screen);
        h.session
            .set_local_media_stream(Arc::new(MediaStream::new(vec![audio.clone(), screen.clone()])))
            .await
            .unwrap();

        assert_eq!(mic.recv().await.unwrap(), MicState { enabled: true });
        assert_eq!(waiting.await.unwrap().unwrap().tracks(), &[audio.clone()]);
        assert!(h.session.is_mic_enabled());

        let channel = h.connector.channel(0);
        let produced = channel.requests_for(methods::PRODUCE);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0]["appData"], json!({ "share": true }));

        h.session.toggle_microphone();
        assert_eq!(mic.recv().await.unwrap(), MicState { enabled: false });
        assert!(!h.session.is_mic_enabled());

        h.session.handle_share_track_ended(&screen).await;
        assert_eq!(channel.requests_for(methods::CLOSE_PRODUCER).len(), 1);
        assert!(h
            .session
            .get_media_stream(&me, MediaKind::Video)
            .now_or_never()
            .is_none());
        assert!(h.backend.calls().contains(&"publish".to_string()));
    }

    #[tokio::test]
    async fn test_local_stream_without_backend_uses_primary_path() {
        let h = harness(false);
        h.session.connect(params("a.example.com")).await.unwrap();

        let audio = MediaTrack::new(MediaKind::Audio);
        let camera = MediaTrack::new(MediaKind::Video).with_hint(ContentHint::Camera);
        h.session
            .set_local_media_stream(Arc::new(MediaStream::new(vec![audio, camera])))
            .await
            .unwrap();

        let channel = h.connector.channel(0);
        let tags: Vec<Value> = channel
            .requests_for(methods::PRODUCE)
            .into_iter()
            .map(|r| r["appData"]["tag"].clone())
            .collect();
        assert_eq!(tags, vec![json!("mic"), json!("camera")]);

        // Dropping video closes the camera producer
        let audio_only = MediaStream::new(vec![MediaTrack::new(MediaKind::Audio)]);
        h.session
            .set_local_media_stream(Arc::new(audio_only))
            .await
            .unwrap();
        assert_eq!(channel.requests_for(methods::CLOSE_PRODUCER).len(), 2);
    }

    #[tokio::test]
    async fn test_local_stream_reapplied_after_join() {
        let h = harness(false);
        let audio = MediaTrack::new(MediaKind::Audio);
        h.session
            .set_local_media_stream(Arc::new(MediaStream::new(vec![audio])))
            .await
            .unwrap();
        h.session.connect(params("a.example.com")).await.unwrap();

        let channel = h.connector.channel(0);
        assert_eq!(channel.requests_for(methods::PRODUCE).len(), 1);
    }

    #[tokio::test]
    async fn test_server_stats_when_connected() {
        let h = harness(false);
        assert!(h.session.get_server_stats().await.is_none());
        h.session.connect(params("a.example.com")).await.unwrap();

        let Some(ServerStats::Transports(reports)) = h.session.get_server_stats().await else {
            unreachable!("stats available while connected");
        };
        let mut names: Vec<&str> = reports.values().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Receive", "Send"]);
    }
}
