//! # linesync: Polling-based reconciliation for shared plain-text documents
//!
//! Keeps a local editing surface in step with a server-held document by
//! fetching full snapshots on a fixed interval and saving whole-document
//! replacements after a quiet period, without ever overwriting text the
//! local user is still typing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  snapshots  ┌─────────────────────┐   value/caret   ┌─────────┐
//! │ PollLoop │ ──────────► │ ReconciliationEngine│ ──────────────► │ Surface │
//! └──────────┘             │  ├ attribution      │                 └────┬────┘
//!                          │  ├ presence roster  │                      │
//!                          │  └ SaveDebouncer ◄──┼──── keystrokes ──────┘
//!                          └──────────┬──────────┘
//!                                     │ replaceLines (whole document)
//!                                     ▼
//!                              CommandService
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire types and content-shape normalization
//! - [`cursor`]: Caret and selection clamping
//! - [`attribution`]: Per-line author and lock badges
//! - [`presence`]: Roster aggregation and author colors
//! - [`debounce`]: Trailing-edge save debounce
//! - [`surface`]: Editing surface seam and a headless implementation
//! - [`engine`]: Apply decision, save lifecycle and derived status
//! - [`poll`]: Snapshot polling and heartbeats
//! - [`session`]: Per-document actor and registry
//! - [`service`]: Collaborator traits
//! - [`server`]: In-memory backend with fault injection
//! - [`config`]: Session timing configuration
//!
//! ## Conflict model
//!
//! Every save replaces the whole server document, so two participants
//! saving within one poll interval resolve as last writer wins.

pub mod attribution;
pub mod config;
pub mod cursor;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod poll;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod surface;

// Re-exports for convenience
pub use attribution::{LineAttributionTracker, LineBadge};
pub use config::SessionConfig;
pub use cursor::Selection;
pub use debounce::SaveDebouncer;
pub use engine::{
    ConnectionState, EngineState, LocalEditState, ReconciliationEngine, SaveError, SaveOutcome, SessionStatus,
    SnapshotOutcome, SyncPhase, Veto, DEFAULT_GRACE_PERIOD,
};
pub use error::{Result, ServiceError, SyncError};
pub use poll::{FetchResult, PollLoop, MAX_IN_FLIGHT_FETCHES};
pub use presence::{Activity, AuthorColor, PresenceAggregator, RosterEntry, PALETTE_SIZE};
pub use protocol::{
    CursorPosition, DocumentId, DocumentSnapshot, LineMap, LineNumber, ParticipantId, PresenceRecord, RawSnapshot,
    ReplaceAck, ReplaceCommand, WireContent,
};
pub use server::{ContentShape, MemoryServer, ServerStats};
pub use service::{Backend, CommandService, HeartbeatService, SnapshotService};
pub use session::{DocumentSession, SessionEvent, SessionRegistry};
pub use surface::{EditingSurface, MemorySurface};
