//! Interfaces of the external collaborators.
//!
//! All calls are asynchronous and may interleave arbitrarily with local
//! edits and other poll ticks; the engine re-checks live state when a
//! response arrives rather than trusting anything captured at call time.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::ServiceError;
use crate::protocol::{DocumentId, RawSnapshot, ReplaceAck, ReplaceCommand};

/// Source of document snapshots.
pub trait SnapshotService: Send + Sync + 'static {
    fn get_document_content(
        &self,
        document_id: DocumentId,
        force_refresh: bool,
        include_presence: bool,
    ) -> BoxFuture<'_, Result<RawSnapshot, ServiceError>>;
}

/// Durable range-replace commands. Line numbers are 1-based and the range
/// is half-open.
pub trait CommandService: Send + Sync + 'static {
    fn replace_lines(&self, command: ReplaceCommand) -> BoxFuture<'_, Result<ReplaceAck, ServiceError>>;
}

/// Fire-and-forget liveness signal.
pub trait HeartbeatService: Send + Sync + 'static {
    fn send_heartbeat(&self, document_id: DocumentId) -> BoxFuture<'_, Result<(), ServiceError>>;
}

/// The three collaborators a session talks to.
#[derive(Clone)]
pub struct Backend {
    pub snapshots: Arc<dyn SnapshotService>,
    pub commands: Arc<dyn CommandService>,
    pub heartbeat: Arc<dyn HeartbeatService>,
}

impl Backend {
    pub fn new(
        snapshots: Arc<dyn SnapshotService>,
        commands: Arc<dyn CommandService>,
        heartbeat: Arc<dyn HeartbeatService>,
    ) -> Self {
        Self {
            snapshots,
            commands,
            heartbeat,
        }
    }

    /// One object serving all three roles.
    pub fn from_shared<T>(service: Arc<T>) -> Self
    where
        T: SnapshotService + CommandService + HeartbeatService,
    {
        Self {
            snapshots: service.clone(),
            commands: service.clone(),
            heartbeat: service,
        }
    }
}
