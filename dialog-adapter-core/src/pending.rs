//! Pending media-stream requests
//!
//! A request for participant P's track of kind K either resolves at once from
//! a [`TrackSource`] or parks a shared future in a map keyed by (P, K). Later
//! arrivals from any source resolve that entry exactly once; the first source
//! to deliver wins.

use crate::identity::PeerId;
use crate::media::{MediaStream, MediaTrack};
use crate::types::MediaKind;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a pending request was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PendingError {
    /// Session was torn down while the request was outstanding
    #[error("Session closed")]
    SessionClosed,

    /// Connection failed for good
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request was cancelled
    #[error("Request cancelled")]
    Cancelled,
}

/// Outcome of a media-stream request: the stream, or `None` when the
/// participant left without providing it
pub type StreamResult = Result<Option<Arc<MediaStream>>, PendingError>;

/// Cloneable future of a media-stream request
pub type PendingStream = Shared<BoxFuture<'static, StreamResult>>;

/// Provider of already-available tracks
///
/// Sources announce new tracks by calling [`PendingRequests::resolve`].
pub trait TrackSource: Send + Sync {
    /// Deliverable track of `kind` for `peer`, if any
    fn lookup_track(&self, peer: &PeerId, kind: MediaKind) -> Option<MediaTrack>;
}

struct PendingEntry {
    tx: oneshot::Sender<StreamResult>,
    stream: PendingStream,
}

/// Map of outstanding requests, at most one per (participant, kind)
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<PeerId, HashMap<MediaKind, PendingEntry>>>,
}

impl PendingRequests {
    /// Empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream for (peer, kind): immediately from the first source that has
    /// the track, otherwise from a new or existing pending entry
    pub fn get(&self, peer: &PeerId, kind: MediaKind, sources: &[&dyn TrackSource]) -> PendingStream {
        if let Some(track) = sources.iter().find_map(|s| s.lookup_track(peer, kind)) {
            tracing::trace!(peer = %peer, kind = %kind, "Track already available");
            return future::ready(Ok(Some(MediaStream::single(track))))
                .boxed()
                .shared();
        }
        self.request(peer, kind)
    }

    /// Await the track for (peer, kind), reusing an outstanding entry
    pub fn request(&self, peer: &PeerId, kind: MediaKind) -> PendingStream {
        let mut entries = self.entries.lock();
        let by_kind = entries.entry(peer.clone()).or_default();
        if let Some(entry) = by_kind.get(&kind) {
            return entry.stream.clone();
        }

        let (tx, rx) = oneshot::channel();
        let stream = rx
            .map(|result| result.unwrap_or(Err(PendingError::Cancelled)))
            .boxed()
            .shared();
        by_kind.insert(
            kind,
            PendingEntry {
                tx,
                stream: stream.clone(),
            },
        );
        tracing::debug!(peer = %peer, kind = %kind, "Media request pending");
        stream
    }

    /// Resolve the entry for (peer, track kind) with a single-track stream.
    /// Returns `false` when nothing was waiting.
    pub fn resolve(&self, peer: &PeerId, track: &MediaTrack) -> bool {
        let kind = track.kind();
        let Some(entry) = self.take(peer, kind) else {
            return false;
        };
        tracing::debug!(peer = %peer, kind = %kind, "Media request resolved");
        let _ = entry.tx.send(Ok(Some(MediaStream::single(track.clone()))));
        true
    }

    /// Resolve every request for a departed participant with "no track"
    pub fn resolve_peer_departed(&self, peer: &PeerId) -> usize {
        let Some(by_kind) = self.entries.lock().remove(peer) else {
            return 0;
        };
        let count = by_kind.len();
        for entry in by_kind.into_values() {
            let _ = entry.tx.send(Ok(None));
        }
        tracing::debug!(peer = %peer, count, "Pending requests closed for departed peer");
        count
    }

    /// Reject every outstanding request
    pub fn reject_all(&self, error: PendingError) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let mut count = 0;
        for (_, by_kind) in drained {
            for entry in by_kind.into_values() {
                let _ = entry.tx.send(Err(error.clone()));
                count += 1;
            }
        }
        if count > 0 {
            tracing::debug!(count, error = %error, "Rejected pending media requests");
        }
        count
    }

    /// Cancel the request for (peer, kind)
    pub fn cancel(&self, peer: &PeerId, kind: MediaKind) -> bool {
        match self.take(peer, kind) {
            Some(entry) => {
                let _ = entry.tx.send(Err(PendingError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Whether a request for (peer, kind) is outstanding
    #[must_use]
    pub fn is_pending(&self, peer: &PeerId, kind: MediaKind) -> bool {
        self.entries
            .lock()
            .get(peer)
            .is_some_and(|by_kind| by_kind.contains_key(&kind))
    }

    /// Whether any entry exists for `peer`
    #[must_use]
    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.entries.lock().contains_key(peer)
    }

    /// Number of outstanding requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    /// Whether nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn take(&self, peer: &PeerId, kind: MediaKind) -> Option<PendingEntry> {
        let mut entries = self.entries.lock();
        let by_kind = entries.get_mut(peer)?;
        let entry = by_kind.remove(&kind);
        if by_kind.is_empty() {
            entries.remove(peer);
        }
        entry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Fixed(PeerId, MediaTrack);

    impl TrackSource for Fixed {
        fn lookup_track(&self, peer: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
            (peer == &self.0 && kind == self.1.kind()).then(|| self.1.clone())
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_stream() {
        let pending = PendingRequests::new();
        let alice = PeerId::new("alice");
        let first = pending.request(&alice, MediaKind::Video);
        let second = pending.request(&alice, MediaKind::Video);
        assert_eq!(pending.len(), 1);

        let track = MediaTrack::new(MediaKind::Video);
        assert!(pending.resolve(&alice, &track));
        assert!(!pending.resolve(&alice, &track));

        let (a, b) = tokio::join!(first, second);
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tracks(), &[track]);
        assert!(!pending.has_peer(&alice));
    }

    #[tokio::test]
    async fn test_available_track_resolves_immediately() {
        let pending = PendingRequests::new();
        let alice = PeerId::new("alice");
        let source = Fixed(alice.clone(), MediaTrack::new(MediaKind::Audio));

        let stream = pending.get(&alice, MediaKind::Audio, &[&source]);
        let stream = stream.now_or_never().unwrap().unwrap().unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert!(pending.is_empty());

        let waiting = pending.get(&alice, MediaKind::Video, &[&source]);
        assert!(waiting.now_or_never().is_none());
        assert!(pending.is_pending(&alice, MediaKind::Video));
    }

    #[tokio::test]
    async fn test_peer_departure_resolves_to_none() {
        let pending = PendingRequests::new();
        let bob = PeerId::new("bob");
        let audio = pending.request(&bob, MediaKind::Audio);
        let video = pending.request(&bob, MediaKind::Video);

        assert_eq!(pending.resolve_peer_departed(&bob), 2);
        assert_eq!(audio.await, Ok(None));
        assert_eq!(video.await, Ok(None));
        assert!(!pending.has_peer(&bob));
        assert_eq!(pending.resolve_peer_departed(&bob), 0);
    }

    #[tokio::test]
    async fn test_reject_all_and_cancel() {
        let pending = PendingRequests::new();
        let a = pending.request(&PeerId::new("a"), MediaKind::Audio);
        let b = pending.request(&PeerId::new("b"), MediaKind::Video);
        let c = pending.request(&PeerId::new("c"), MediaKind::Video);

        assert!(pending.cancel(&PeerId::new("c"), MediaKind::Video));
        assert_eq!(c.await, Err(PendingError::Cancelled));

        assert_eq!(pending.reject_all(PendingError::SessionClosed), 2);
        assert_eq!(a.await, Err(PendingError::SessionClosed));
        assert_eq!(b.await, Err(PendingError::SessionClosed));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_waiter_is_woken_on_resolve() {
        let pending = PendingRequests::new();
        let alice = PeerId::new("alice");
        let mut waiting = tokio_test::task::spawn(pending.request(&alice, MediaKind::Audio));
        tokio_test::assert_pending!(waiting.poll());

        pending.resolve(&alice, &MediaTrack::new(MediaKind::Audio));
        assert!(waiting.is_woken());
        let stream = tokio_test::assert_ready!(waiting.poll());
        assert!(stream.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolving_one_kind_keeps_other() {
        let pending = PendingRequests::new();
        let carol = PeerId::new("carol");
        let _audio = pending.request(&carol, MediaKind::Audio);
        let video = pending.request(&carol, MediaKind::Video);

        assert!(pending.resolve(&carol, &MediaTrack::new(MediaKind::Video)));
        assert!(video.await.unwrap().is_some());
        assert!(pending.has_peer(&carol));
        assert!(pending.is_pending(&carol, MediaKind::Audio));
    }
}
