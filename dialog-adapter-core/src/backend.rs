//! Alternate delivery backend
//!
//! A second realtime service joined in parallel with the primary SFU, keyed
//! by the same room and participant identifiers. Remote streams it delivers
//! feed the same pending-request resolver as primary consumers, and local
//! camera/microphone publish through it while it is active.

use crate::environment::{BackendCredentials, TokenProvider};
use crate::identity::PeerId;
use crate::media::MediaTrack;
use crate::pending::{PendingRequests, TrackSource};
use crate::registry::Registry;
use crate::telemetry::{RtcEmitter, RtcLevel, RtcTag};
use crate::types::{MediaKind, StreamUpdate};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Alternate backend errors
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// No room joined on the backend
    #[error("Backend room not joined")]
    NotJoined,

    /// Credentials could not be obtained
    #[error("Backend credentials unavailable: {0}")]
    Credentials(String),

    /// Error reported by the backend SDK
    #[error("Backend error: {0}")]
    Sdk(String),
}

/// Remote stream delivered by the backend
pub trait BackendRemoteStream: Send + Sync {
    /// Owning participant, when the backend knows it
    fn user_id(&self) -> Option<PeerId>;
    /// Track of `kind`, if the stream carries one
    fn track(&self, kind: MediaKind) -> Option<MediaTrack>;
    /// Stop playing `kind`
    fn mute(&self, kind: MediaKind);
    /// Resume playing `kind`
    fn unmute(&self, kind: MediaKind);
}

/// Local stream published on the backend
///
/// Muting a kind disables its track.
#[async_trait]
pub trait BackendLocalStream: Send + Sync {
    /// Current track of `kind`
    fn track(&self, kind: MediaKind) -> Option<MediaTrack>;
    /// Add a track of a kind the stream does not carry yet
    async fn add_track(&self, track: MediaTrack) -> Result<(), BackendError>;
    /// Replace the track of the same kind
    async fn replace_track(&self, track: MediaTrack) -> Result<(), BackendError>;
    /// Mute `kind`
    fn mute(&self, kind: MediaKind);
    /// Unmute `kind`
    fn unmute(&self, kind: MediaKind);
}

/// Event raised by a backend client
#[derive(Clone)]
pub enum BackendEvent {
    /// A remote stream was added
    StreamAdded(Arc<dyn BackendRemoteStream>),
    /// A remote stream changed its tracks
    StreamUpdated(Arc<dyn BackendRemoteStream>),
    /// A remote stream was removed
    StreamRemoved(Arc<dyn BackendRemoteStream>),
    /// A participant left the backend room
    PeerLeave(PeerId),
    /// The published local stream ended
    LocalStreamEnded,
}

/// Joined-or-joinable backend client
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Join a room
    async fn join(&self, room_id: &str) -> Result<(), BackendError>;
    /// Leave the joined room
    async fn leave(&self) -> Result<(), BackendError>;
    /// Release the client handle
    fn destroy(&self);
    /// Create and initialise a local stream for `user`
    async fn create_local_stream(&self, user: &PeerId) -> Result<Arc<dyn BackendLocalStream>, BackendError>;
    /// Publish a local stream into the joined room
    async fn publish(&self, stream: Arc<dyn BackendLocalStream>) -> Result<(), BackendError>;
}

/// Factory for backend clients
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Create a client for `user` and the receiver of its events
    async fn create_client(
        &self,
        credentials: &BackendCredentials,
        user: &PeerId,
    ) -> Result<(Arc<dyn BackendClient>, mpsc::UnboundedReceiver<BackendEvent>), BackendError>;
}

#[derive(Default)]
struct BridgeState {
    client: Option<Arc<dyn BackendClient>>,
    user: Option<PeerId>,
    local: Option<Arc<dyn BackendLocalStream>>,
    remote: HashMap<PeerId, HashMap<MediaKind, Arc<dyn BackendRemoteStream>>>,
    events: Option<JoinHandle<()>>,
}

/// Session against the alternate backend
pub struct BackendBridge {
    connector: Option<Arc<dyn BackendConnector>>,
    pending: Arc<PendingRequests>,
    registry: Arc<Registry>,
    stream_updates: broadcast::Sender<StreamUpdate>,
    emitter: RtcEmitter,
    state: Mutex<BridgeState>,
    local_init: tokio::sync::Mutex<()>,
    this: Weak<Self>,
}

impl BackendBridge {
    /// Create a bridge. Without a connector the backend is never joined and
    /// every local publish goes through the primary transport.
    pub fn new(
        connector: Option<Arc<dyn BackendConnector>>,
        pending: Arc<PendingRequests>,
        registry: Arc<Registry>,
        stream_updates: broadcast::Sender<StreamUpdate>,
        emitter: RtcEmitter,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            pending,
            registry,
            stream_updates,
            emitter,
            state: Mutex::new(BridgeState::default()),
            local_init: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Whether a backend room is joined
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().client.is_some()
    }

    /// Join `room_id` as `user`. Failures are logged and leave the backend
    /// inactive; they never fail the session.
    #[tracing::instrument(skip(self, tokens))]
    pub async fn join(&self, tokens: &dyn TokenProvider, room_id: &str, user: &PeerId) -> bool {
        let Some(connector) = self.connector.clone() else {
            return false;
        };

        let credentials = match tokens.backend_credentials(user).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(error = %e, "Backend credentials unavailable");
                return false;
            }
        };

        let (client, events) = match connector.create_client(&credentials, user).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "Backend client creation failed");
                return false;
            }
        };
        if let Err(e) = client.join(room_id).await {
            tracing::error!(error = %e, "Backend join failed");
            release(client).await;
            return false;
        }
        tracing::debug!(room_id, user = %user, "Joined backend room");

        let task = self.spawn_event_loop(events);
        let previous = {
            let mut state = self.state.lock();
            let previous = state.client.replace(client);
            state.user = Some(user.clone());
            state.local = None;
            state.remote.clear();
            if let Some(old) = state.events.replace(task) {
                old.abort();
            }
            previous
        };
        if let Some(previous) = previous {
            release(previous).await;
        }
        true
    }

    fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<BackendEvent>) -> JoinHandle<()> {
        let bridge = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                bridge.handle_event(event);
            }
        })
    }

    /// Apply one backend event
    pub fn handle_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::StreamAdded(stream) => {
                self.store_remote(stream, false);
            }
            BackendEvent::StreamUpdated(stream) => {
                self.store_remote(stream, true);
            }
            BackendEvent::StreamRemoved(stream) => {
                let Some(user) = stream.user_id() else {
                    return;
                };
                let mut state = self.state.lock();
                if let Some(by_kind) = state.remote.get_mut(&user) {
                    for kind in MediaKind::ALL {
                        if stream.track(kind).is_some() {
                            by_kind.remove(&kind);
                        }
                    }
                    if by_kind.is_empty() {
                        state.remote.remove(&user);
                    }
                }
            }
            BackendEvent::PeerLeave(user) => {
                self.state.lock().remote.remove(&user);
            }
            BackendEvent::LocalStreamEnded => {
                self.state.lock().local = None;
                self.emitter
                    .emit(RtcLevel::Info, RtcTag::Backend, || "LocalStream closed".to_string());
            }
        }
    }

    fn store_remote(&self, stream: Arc<dyn BackendRemoteStream>, notify: bool) {
        let Some(user) = stream.user_id() else {
            return;
        };
        let kinds: Vec<(MediaKind, MediaTrack)> = MediaKind::ALL
            .into_iter()
            .filter_map(|kind| stream.track(kind).map(|track| (kind, track)))
            .collect();

        {
            let mut state = self.state.lock();
            let by_kind = state.remote.entry(user.clone()).or_default();
            for (kind, _) in &kinds {
                by_kind.insert(*kind, stream.clone());
            }
        }
        if self.registry.is_blocked(&user) {
            for (kind, _) in &kinds {
                stream.mute(*kind);
            }
        }

        for (kind, track) in kinds {
            self.pending.resolve(&user, &track);
            if notify {
                let _ = self.stream_updates.send(StreamUpdate {
                    peer: user.clone(),
                    kind,
                });
            }
        }
    }

    /// Stop playing every stream of `peer`
    pub fn mute_remote(&self, peer: &PeerId) {
        self.for_remote(peer, |stream, kind| stream.mute(kind));
    }

    /// Resume playing every stream of `peer`
    pub fn unmute_remote(&self, peer: &PeerId) {
        self.for_remote(peer, |stream, kind| stream.unmute(kind));
    }

    fn for_remote(&self, peer: &PeerId, apply: impl Fn(&dyn BackendRemoteStream, MediaKind)) {
        let streams: Vec<(MediaKind, Arc<dyn BackendRemoteStream>)> = self
            .state
            .lock()
            .remote
            .get(peer)
            .map(|by_kind| by_kind.iter().map(|(k, s)| (*k, s.clone())).collect())
            .unwrap_or_default();
        for (kind, stream) in streams {
            apply(stream.as_ref(), kind);
        }
    }

    /// Published local stream, creating and publishing it on first use
    ///
    /// # Errors
    ///
    /// Returns error if no backend room is joined or the backend fails
    pub async fn local_stream(&self) -> Result<Arc<dyn BackendLocalStream>, BackendError> {
        let _guard = self.local_init.lock().await;
        let (client, user) = {
            let state = self.state.lock();
            if let Some(local) = &state.local {
                return Ok(local.clone());
            }
            match (&state.client, &state.user) {
                (Some(client), Some(user)) => (client.clone(), user.clone()),
                _ => return Err(BackendError::NotJoined),
            }
        };

        let stream = client.create_local_stream(&user).await?;
        tracing::debug!("Backend local stream initialized");
        client.publish(stream.clone()).await?;
        tracing::debug!("Backend local stream published");
        self.state.lock().local = Some(stream.clone());
        Ok(stream)
    }

    /// Put `track` on the local stream, adding or replacing by kind, and
    /// unmute that kind
    ///
    /// # Errors
    ///
    /// Returns error if the local stream is unavailable or the backend fails
    pub async fn publish_track(&self, track: &MediaTrack) -> Result<(), BackendError> {
        let local = self.local_stream().await?;
        if local.track(track.kind()).is_some() {
            local.replace_track(track.clone()).await?;
        } else {
            local.add_track(track.clone()).await?;
        }
        if track.kind() == MediaKind::Video {
            local.unmute(MediaKind::Video);
        }
        Ok(())
    }

    /// Track of `kind` on the existing local stream
    #[must_use]
    pub fn local_track(&self, kind: MediaKind) -> Option<MediaTrack> {
        self.state.lock().local.as_ref().and_then(|local| local.track(kind))
    }

    /// Whether a local stream exists
    #[must_use]
    pub fn has_local_stream(&self) -> bool {
        self.state.lock().local.is_some()
    }

    /// Mute `kind` on the existing local stream, if it carries that kind
    pub fn mute_local(&self, kind: MediaKind) {
        let local = self.state.lock().local.clone();
        if let Some(local) = local.filter(|l| l.track(kind).is_some()) {
            local.mute(kind);
        }
    }

    /// Unmute `kind` on the existing local stream, if it carries that kind
    pub fn unmute_local(&self, kind: MediaKind) {
        let local = self.state.lock().local.clone();
        if let Some(local) = local.filter(|l| l.track(kind).is_some()) {
            local.unmute(kind);
        }
    }

    /// Leave the backend room and release the client. Always attempts the
    /// leave, releases the client even if leaving fails, never errors.
    pub async fn teardown(&self) {
        let client = {
            let mut state = self.state.lock();
            if let Some(events) = state.events.take() {
                events.abort();
            }
            state.user = None;
            state.local = None;
            state.remote.clear();
            state.client.take()
        };
        if let Some(client) = client {
            release(client).await;
            tracing::debug!("Left backend room");
        }
    }
}

async fn release(client: Arc<dyn BackendClient>) {
    if let Err(e) = client.leave().await {
        tracing::warn!(error = %e, "Backend leave failed");
    }
    client.destroy();
}

impl TrackSource for BackendBridge {
    fn lookup_track(&self, peer: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
        self.state
            .lock()
            .remote
            .get(peer)
            .and_then(|by_kind| by_kind.get(&kind))
            .and_then(|stream| stream.track(kind))
    }
}
