//! In-memory fakes for the crate's injected dependencies
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! downstream test suites. The fakes answer immediately and record what they
//! were asked to do.

use crate::backend::{
    BackendClient, BackendConnector, BackendError, BackendEvent, BackendLocalStream, BackendRemoteStream,
};
use crate::environment::{BackendCredentials, HostResolver, TokenProvider};
use crate::identity::PeerId;
use crate::media::{
    ConsumeOptions, Consumer, MediaEngine, MediaError, MediaTrack, MediaTransport, ProduceOptions, Producer,
    TransportHandler, TransportOptions,
};
use crate::signaling::{
    methods, ChannelEvent, Notification, RequestOutcome, RequestResponder, ServerRequest, SignalingChannel,
    SignalingConnector, SignalingError,
};
use crate::types::{ConnectionState, MediaKind, ServerParams, TransportDirection};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Poll `check` until it holds, for roughly two seconds
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}

#[derive(Default)]
struct Script {
    requests: Vec<(String, Value)>,
    overrides: HashMap<String, Result<Value, String>>,
    transports: usize,
    producers: usize,
}

/// Signaling channel answering from a script
///
/// Unscripted methods get a plausible default: router capabilities,
/// numbered transports and producers, an empty object for `restartIce`, and
/// `null` for everything else.
pub struct ScriptedChannel {
    open: AtomicBool,
    closes: AtomicUsize,
    script: Mutex<Script>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl ScriptedChannel {
    /// Closed channel with an empty script
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            open: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            script: Mutex::new(Script::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Mark the channel open or closed without emitting events
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Answer `method` with `response` from now on
    pub fn respond(&self, method: &str, response: Value) {
        self.script.lock().overrides.insert(method.to_string(), Ok(response));
    }

    /// Reject `method` with `reason` from now on
    pub fn fail(&self, method: &str, reason: &str) {
        self.script
            .lock()
            .overrides
            .insert(method.to_string(), Err(reason.to_string()));
    }

    /// Event receiver; `None` once taken
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.rx.lock().take()
    }

    /// Push a raw channel event
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    /// Deliver a server request; the receiver yields the client's answer
    pub fn server_request(&self, method: &str, data: Value) -> oneshot::Receiver<RequestOutcome> {
        let (responder, outcome) = RequestResponder::new(method);
        self.emit(ChannelEvent::Request(ServerRequest {
            method: method.to_string(),
            data,
            responder,
        }));
        outcome
    }

    /// Deliver a server notification
    pub fn notify(&self, method: &str, data: Value) {
        self.emit(ChannelEvent::Notification(Notification {
            method: method.to_string(),
            data,
        }));
    }

    /// Drop the connection for good, as if the server went away
    pub fn close_unexpectedly(&self) {
        self.set_open(false);
        self.emit(ChannelEvent::Close);
    }

    /// Drop the connection while the channel keeps retrying
    pub fn disconnect_transiently(&self) {
        self.set_open(false);
        self.emit(ChannelEvent::Disconnected);
    }

    /// Reconnect after [`Self::disconnect_transiently`]
    pub fn reopen(&self) {
        self.set_open(true);
        self.emit(ChannelEvent::Open);
    }

    /// Every request sent while open, in order
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.script.lock().requests.clone()
    }

    /// Methods of every request sent while open, in order
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.script.lock().requests.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Payloads of every `method` request
    #[must_use]
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Wait until at least `count` `method` requests were sent
    pub async fn wait_for_requests(&self, method: &str, count: usize) -> bool {
        eventually(|| self.requests_for(method).len() >= count).await
    }

    /// How often the client closed the channel
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn answer(&self, method: &str, data: Value) -> Result<Value, SignalingError> {
        let mut script = self.script.lock();
        script.requests.push((method.to_string(), data));
        if let Some(scripted) = script.overrides.get(method) {
            return scripted.clone().map_err(|reason| SignalingError::Rejected {
                method: method.to_string(),
                code: 500,
                reason,
            });
        }
        let response = match method {
            methods::GET_ROUTER_RTP_CAPABILITIES => json!({ "codecs": [], "headerExtensions": [] }),
            methods::CREATE_WEBRTC_TRANSPORT => {
                script.transports += 1;
                json!({
                    "id": format!("transport-{}", script.transports),
                    "iceParameters": {},
                    "iceCandidates": [],
                    "dtlsParameters": {}
                })
            }
            methods::PRODUCE => {
                script.producers += 1;
                json!({ "id": format!("producer-{}", script.producers) })
            }
            methods::RESTART_ICE => json!({}),
            _ => Value::Null,
        };
        Ok(response)
    }
}

#[async_trait]
impl SignalingChannel for ScriptedChannel {
    async fn request(&self, method: &str, data: Value) -> Result<Value, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.answer(method, data)
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.set_open(false);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`ScriptedChannel`]s that open immediately unless
/// held
#[derive(Default)]
pub struct ScriptedConnector {
    hold_open: AtomicBool,
    prepared: Mutex<VecDeque<Arc<ScriptedChannel>>>,
    channels: Mutex<Vec<Arc<ScriptedChannel>>>,
    urls: Mutex<Vec<Url>>,
}

impl ScriptedConnector {
    /// Connector without prepared channels
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel used by the next connect, for scripting it in advance
    pub fn prepare(&self) -> Arc<ScriptedChannel> {
        let channel = ScriptedChannel::new();
        self.prepared.lock().push_back(channel.clone());
        channel
    }

    /// Leave the following channels connecting: no `Open` event is emitted
    /// until [`ScriptedChannel::reopen`]
    pub fn hold_open(&self, hold: bool) {
        self.hold_open.store(hold, Ordering::SeqCst);
    }

    /// Channel handed out by the `index`-th connect
    ///
    /// # Panics
    ///
    /// Panics if fewer connects happened
    #[must_use]
    pub fn channel(&self, index: usize) -> Arc<ScriptedChannel> {
        self.channels.lock()[index].clone()
    }

    /// Every channel handed out, in order
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<ScriptedChannel>> {
        self.channels.lock().clone()
    }

    /// URL of every connect, in order
    #[must_use]
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl SignalingConnector for ScriptedConnector {
    async fn connect(
        &self,
        url: &Url,
        _retries: u32,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<ChannelEvent>), SignalingError> {
        self.urls.lock().push(url.clone());
        let channel = self.prepared.lock().pop_front().unwrap_or_else(ScriptedChannel::new);
        self.channels.lock().push(channel.clone());
        let events = channel
            .take_events()
            .ok_or_else(|| SignalingError::TransportError("channel reused".to_string()))?;
        if !self.hold_open.load(Ordering::SeqCst) {
            channel.set_open(true);
            channel.emit(ChannelEvent::Open);
        }
        let channel: Arc<dyn SignalingChannel> = channel;
        Ok((channel, events))
    }
}

/// Producer that only tracks its closed flag
pub struct FakeProducer {
    id: String,
    track: MediaTrack,
    closed: AtomicBool,
}

impl FakeProducer {
    /// Open producer
    pub fn new(id: impl Into<String>, track: MediaTrack) -> Self {
        Self {
            id: id.into(),
            track,
            closed: AtomicBool::new(false),
        }
    }
}

impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Consumer that only tracks its closed flag
pub struct FakeConsumer {
    id: String,
    producer_id: String,
    track: MediaTrack,
    rtp_parameters: Value,
    closed: AtomicBool,
}

impl FakeConsumer {
    /// Open consumer
    pub fn new(
        id: impl Into<String>,
        producer_id: impl Into<String>,
        track: MediaTrack,
        rtp_parameters: Value,
    ) -> Self {
        Self {
            id: id.into(),
            producer_id: producer_id.into(),
            track,
            rtp_parameters,
            closed: AtomicBool::new(false),
        }
    }
}

impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn rtp_parameters(&self) -> &Value {
        &self.rtp_parameters
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport that connects on first use and produces through its handler
pub struct FakeTransport {
    id: String,
    direction: TransportDirection,
    handler: Arc<dyn TransportHandler>,
    state: Mutex<ConnectionState>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
    close_on_consume: AtomicBool,
    ice_restarts: Mutex<Vec<Value>>,
    produced: Mutex<Vec<ProduceOptions>>,
}

impl FakeTransport {
    /// Report a connection state change to the handler
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.handler.on_connection_state_change(state);
    }

    /// Close the transport right after the next successful consume, as if
    /// it went away while the consumer was being set up
    pub fn close_after_consume(&self, close: bool) {
        self.close_on_consume.store(close, Ordering::SeqCst);
    }

    /// ICE parameters of every restart, in order
    #[must_use]
    pub fn ice_restarts(&self) -> Vec<Value> {
        self.ice_restarts.lock().clone()
    }

    /// Wait until at least `count` ICE restarts happened
    pub async fn wait_for_ice_restarts(&self, count: usize) -> bool {
        eventually(|| self.ice_restarts.lock().len() >= count).await
    }

    /// Options of every successful produce
    #[must_use]
    pub fn produced(&self) -> Vec<ProduceOptions> {
        self.produced.lock().clone()
    }

    async fn ensure_connected(&self) -> Result<(), MediaError> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.handler.on_connect(json!({ "role": "auto" })).await?;
            *connected = true;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            Err(MediaError::TransportClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Closed;
    }

    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.ice_restarts.lock().push(ice_parameters);
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>, MediaError> {
        self.ensure_open()?;
        self.ensure_connected().await?;
        let kind = options.track.kind();
        let rtp_parameters = json!({ "encodings": options.encodings });
        let id = self
            .handler
            .on_produce(kind, rtp_parameters, options.app_data.clone())
            .await?;
        let producer = Arc::new(FakeProducer::new(id, options.track.clone()));
        self.produced.lock().push(options);
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, MediaError> {
        self.ensure_open()?;
        self.ensure_connected().await?;
        let track = MediaTrack::with_id(options.id.clone(), options.kind);
        let consumer = Arc::new(FakeConsumer::new(
            options.id,
            options.producer_id,
            track,
            options.rtp_parameters,
        ));
        if self.close_on_consume.swap(false, Ordering::SeqCst) {
            self.close();
        }
        Ok(consumer)
    }
}

/// Media engine creating [`FakeTransport`]s
#[derive(Default)]
pub struct FakeMediaEngine {
    capabilities: Mutex<Option<Value>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    options: Mutex<Vec<TransportOptions>>,
    fail_create: AtomicBool,
}

impl FakeMediaEngine {
    /// Unloaded engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following transport creation fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Every transport created, in order
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    /// Options of every transport created, in order
    #[must_use]
    pub fn options(&self) -> Vec<TransportOptions> {
        self.options.lock().clone()
    }

    /// Number of ICE servers handed to each transport, in order
    #[must_use]
    pub fn ice_server_counts(&self) -> Vec<usize> {
        self.options.lock().iter().map(|o| o.ice_servers.len()).collect()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), MediaError> {
        *self.capabilities.lock() = Some(router_rtp_capabilities);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Option<Value> {
        self.capabilities.lock().clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("transport creation failed".to_string()));
        }
        let transport = Arc::new(FakeTransport {
            id: options.info.id.clone(),
            direction,
            handler,
            state: Mutex::new(ConnectionState::New),
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
            close_on_consume: AtomicBool::new(false),
            ice_restarts: Mutex::new(Vec::new()),
            produced: Mutex::new(Vec::new()),
        });
        self.options.lock().push(options);
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Local backend stream; muting disables the track
#[derive(Default)]
pub struct FakeLocalStream {
    tracks: Mutex<HashMap<MediaKind, MediaTrack>>,
}

#[async_trait]
impl BackendLocalStream for FakeLocalStream {
    fn track(&self, kind: MediaKind) -> Option<MediaTrack> {
        self.tracks.lock().get(&kind).cloned()
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), BackendError> {
        self.tracks.lock().insert(track.kind(), track);
        Ok(())
    }

    async fn replace_track(&self, track: MediaTrack) -> Result<(), BackendError> {
        self.tracks.lock().insert(track.kind(), track);
        Ok(())
    }

    fn mute(&self, kind: MediaKind) {
        if let Some(track) = self.tracks.lock().get(&kind) {
            track.set_enabled(false);
        }
    }

    fn unmute(&self, kind: MediaKind) {
        if let Some(track) = self.tracks.lock().get(&kind) {
            track.set_enabled(true);
        }
    }
}

/// Remote backend stream recording mute state per kind
pub struct FakeRemoteStream {
    user: PeerId,
    tracks: HashMap<MediaKind, MediaTrack>,
    muted: Mutex<HashSet<MediaKind>>,
}

impl FakeRemoteStream {
    /// Stream of `user` carrying the requested kinds
    pub fn new(user: PeerId, audio: bool, video: bool) -> Self {
        let tracks = MediaKind::ALL
            .into_iter()
            .zip([audio, video])
            .filter(|(_, present)| *present)
            .map(|(kind, _)| (kind, MediaTrack::new(kind)))
            .collect();
        Self {
            user,
            tracks,
            muted: Mutex::new(HashSet::new()),
        }
    }

    /// Whether `kind` is muted
    #[must_use]
    pub fn is_muted(&self, kind: MediaKind) -> bool {
        self.muted.lock().contains(&kind)
    }
}

impl BackendRemoteStream for FakeRemoteStream {
    fn user_id(&self) -> Option<PeerId> {
        (!self.user.is_empty()).then(|| self.user.clone())
    }

    fn track(&self, kind: MediaKind) -> Option<MediaTrack> {
        self.tracks.get(&kind).cloned()
    }

    fn mute(&self, kind: MediaKind) {
        self.muted.lock().insert(kind);
    }

    fn unmute(&self, kind: MediaKind) {
        self.muted.lock().remove(&kind);
    }
}

#[derive(Default)]
struct BackendShared {
    calls: Mutex<Vec<String>>,
    fail_join: AtomicBool,
    fail_leave: AtomicBool,
}

impl BackendShared {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

/// Backend connector whose clients log every call
#[derive(Default)]
pub struct FakeBackend {
    shared: Arc<BackendShared>,
    events: Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
}

impl FakeBackend {
    /// Backend that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room joins fail
    pub fn fail_join(&self, fail: bool) {
        self.shared.fail_join.store(fail, Ordering::SeqCst);
    }

    /// Make room leaves fail
    pub fn fail_leave(&self, fail: bool) {
        self.shared.fail_leave.store(fail, Ordering::SeqCst);
    }

    /// Client calls across every client, in order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().clone()
    }

    /// Raise an event on the most recent client. Returns `false` when no
    /// client is listening.
    pub fn emit(&self, event: BackendEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl BackendConnector for FakeBackend {
    async fn create_client(
        &self,
        _credentials: &BackendCredentials,
        _user: &PeerId,
    ) -> Result<(Arc<dyn BackendClient>, mpsc::UnboundedReceiver<BackendEvent>), BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        let client: Arc<dyn BackendClient> = Arc::new(FakeBackendClient {
            shared: self.shared.clone(),
        });
        Ok((client, rx))
    }
}

struct FakeBackendClient {
    shared: Arc<BackendShared>,
}

#[async_trait]
impl BackendClient for FakeBackendClient {
    async fn join(&self, room_id: &str) -> Result<(), BackendError> {
        if self.shared.fail_join.load(Ordering::SeqCst) {
            return Err(BackendError::Sdk("join refused".to_string()));
        }
        self.shared.record(format!("join:{room_id}"));
        Ok(())
    }

    async fn leave(&self) -> Result<(), BackendError> {
        self.shared.record("leave");
        if self.shared.fail_leave.load(Ordering::SeqCst) {
            return Err(BackendError::Sdk("leave refused".to_string()));
        }
        Ok(())
    }

    fn destroy(&self) {
        self.shared.record("destroy");
    }

    async fn create_local_stream(&self, _user: &PeerId) -> Result<Arc<dyn BackendLocalStream>, BackendError> {
        self.shared.record("create_local_stream");
        Ok(Arc::new(FakeLocalStream::default()))
    }

    async fn publish(&self, _stream: Arc<dyn BackendLocalStream>) -> Result<(), BackendError> {
        self.shared.record("publish");
        Ok(())
    }
}

/// Host resolver returning settable parameters
pub struct FakeHostResolver {
    params: Mutex<ServerParams>,
    calls: AtomicUsize,
}

impl FakeHostResolver {
    /// Resolver answering with `params`
    pub fn new(params: ServerParams) -> Self {
        Self {
            params: Mutex::new(params),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer with `params` from now on
    pub fn set(&self, params: ServerParams) {
        *self.params.lock() = params;
    }

    /// Number of lookups
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for FakeHostResolver {
    async fn resolve_host(&self, _room_id: &str) -> anyhow::Result<ServerParams> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.params.lock().clone())
    }
}

/// Token provider with a fixed token
#[derive(Debug, Clone)]
pub struct FakeTokens {
    /// Signaling token
    pub token: Option<String>,
    /// Refuse backend credentials
    pub fail_backend: bool,
}

impl Default for FakeTokens {
    fn default() -> Self {
        Self {
            token: Some("token".to_string()),
            fail_backend: false,
        }
    }
}

#[async_trait]
impl TokenProvider for FakeTokens {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn backend_credentials(&self, user: &PeerId) -> anyhow::Result<BackendCredentials> {
        if self.fail_backend {
            anyhow::bail!("no backend credentials for {user}");
        }
        Ok(BackendCredentials {
            sdk_app_id: 1_400_000_000,
            user_sig: format!("sig-{user}"),
        })
    }
}
