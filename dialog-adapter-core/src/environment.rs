//! Services the session controller depends on but does not own
//!
//! Host lookup, auth tokens and the debug-panel sink are handed to the
//! controller at construction time.

use crate::identity::PeerId;
use crate::telemetry::{NullSink, TelemetrySink};
use crate::types::ServerParams;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Credentials for joining the alternate backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCredentials {
    /// Application identifier on the backend
    pub sdk_app_id: u64,
    /// Signature authorising the participant
    pub user_sig: String,
}

/// Looks up the coordination server currently assigned to a room
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Fetch fresh connection parameters for `room_id`
    async fn resolve_host(&self, room_id: &str) -> anyhow::Result<ServerParams>;
}

/// Issues auth material for the signaling server and the alternate backend
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current auth token, if the user is signed in
    fn token(&self) -> Option<String>;

    /// Credentials for the alternate backend on behalf of `user`
    async fn backend_credentials(&self, user: &PeerId) -> anyhow::Result<BackendCredentials>;
}

/// Injected dependencies of a session controller
#[derive(Clone)]
pub struct SessionEnvironment {
    /// Host lookup for failover
    pub host_resolver: Arc<dyn HostResolver>,
    /// Auth material
    pub tokens: Arc<dyn TokenProvider>,
    /// Debug-panel sink
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl SessionEnvironment {
    /// Environment without a debug panel
    pub fn new(host_resolver: Arc<dyn HostResolver>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            host_resolver,
            tokens,
            telemetry: Arc::new(NullSink),
        }
    }

    /// Attach a telemetry sink
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}
