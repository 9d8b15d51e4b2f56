//! Dialog adapter - client-side session adapter for an SFU audio/video room
//!
//! This library drives one participant's membership in a room served by a
//! selective forwarding unit, with an optional alternate delivery backend for
//! camera and microphone. It features:
//!
//! - **Session lifecycle**: connect, join, transient recovery, host failover
//!   and disconnect as one explicit state machine
//! - **Transport recovery**: ICE restart on failure, transport recreation
//!   when a restart is impossible
//! - **Unified media requests**: `get_media_stream` resolves from whichever
//!   backend delivers a participant's track first
//! - **Moderation**: kick, block and unblock with local muting
//! - **Diagnostics**: structured `tracing` plus an optional debug-panel sink
//!
//! The signaling wire transport, the media engine and the alternate backend
//! SDK are injected through traits ([`SignalingConnector`], [`MediaEngine`],
//! [`BackendConnector`]).
//!
//! # Examples
//!
//! ```rust,no_run
//! use dialog_adapter_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     connector: Arc<dyn SignalingConnector>,
//! #     engine: Arc<dyn MediaEngine>,
//! #     env: SessionEnvironment,
//! #     params: ServerParams,
//! # ) -> anyhow::Result<()> {
//! let session = SessionController::new(SessionConfig::default(), env, connector, engine, None);
//!
//! // Join the room on the host returned by host lookup
//! session
//!     .connect(ConnectParams::for_host("room-42", PeerId::new("alice"), params))
//!     .await?;
//!
//! // Wait for another participant's audio
//! if let Some(stream) = session.get_media_stream(&PeerId::new("bob"), MediaKind::Audio).await? {
//!     println!("bob's audio: {}", stream.id());
//! }
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Shared types: media kinds, lifecycle states, configuration
pub mod types;

/// Participant identity
pub mod identity;

/// ICE server list and signaling URL construction
pub mod ice;

/// Signaling protocol and handlers
pub mod signaling;

/// Media engine abstraction: tracks, producers, consumers, transports
pub mod media;

/// Pending media-stream requests
pub mod pending;

/// Producer/consumer bookkeeping
pub mod registry;

/// Send/receive transport lifecycle and ICE recovery
pub mod transport;

/// Alternate delivery backend
pub mod backend;

/// Injected services: host lookup, auth tokens, telemetry sink
pub mod environment;

/// RTC debug events and tracing setup
pub mod telemetry;

/// Session controller
pub mod session;

/// In-memory fakes of the injected dependencies
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use backend::{BackendBridge, BackendConnector, BackendError, BackendEvent};
pub use environment::{BackendCredentials, HostResolver, SessionEnvironment, TokenProvider};
pub use identity::PeerId;
pub use media::{MediaEngine, MediaError, MediaStream, MediaTrack, MediaTransport};
pub use pending::{PendingError, PendingStream};
pub use session::{ConnectionEvent, MicState, ModerationEvent, SessionController, SessionError};
pub use signaling::{SignalingChannel, SignalingConnector, SignalingError, SignalingHandler};
pub use telemetry::{init_tracing, RtcEvent, RtcLevel, RtcTag, TelemetrySink};
pub use transport::{ServerStats, TransportConfig, TransportError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendConnector, BackendEvent};
    pub use crate::environment::{HostResolver, SessionEnvironment, TokenProvider};
    pub use crate::identity::PeerId;
    pub use crate::media::{MediaEngine, MediaStream, MediaTrack};
    pub use crate::session::{ConnectionEvent, MicState, ModerationEvent, SessionController};
    pub use crate::signaling::{SignalingChannel, SignalingConnector};
    pub use crate::telemetry::TelemetrySink;
    pub use crate::types::{
        ConnectParams, ContentHint, MediaKind, ServerParams, SessionConfig, SessionState,
    };
}
