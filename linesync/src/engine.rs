//! Snapshot reconciliation.
//!
//! [`EngineState`] is the single owner of everything one open document
//! knows: the local buffer and save lifecycle, the debounce timer, line
//! attribution, the roster and connectivity. It never touches the editing
//! surface. [`ReconciliationEngine`] pairs it with an [`EditingSurface`]
//! and performs the surface side effects of applying a snapshot.
//!
//! ## Apply rule
//!
//! ```text
//! apply = !locally_focused
//!      && !is_saving
//!      && !has_unsaved_changes
//!      && now - last_save_completed_at > grace_period
//! ```
//!
//! A vetoed snapshot still refreshes attribution and presence; only its
//! content is dropped.
//!
//! ## Phases
//!
//! ```text
//!   Idle ──edit──▶ Editing ──debounce──▶ Saving ──ack──▶ GracePeriod ──▶ Idle
//!     ▲               ▲                                      │
//!     └───────────────┴──────────────── edit ────────────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::attribution::{LineAttributionTracker, LineBadge};
use crate::cursor;
use crate::debounce::SaveDebouncer;
use crate::error::ServiceError;
use crate::presence::{PresenceAggregator, RosterEntry};
use crate::protocol::{
    line_count_of, DocumentId, DocumentSnapshot, LineNumber, ParticipantId, ReplaceAck, ReplaceCommand,
};
use crate::surface::EditingSurface;

/// Default window after a save during which snapshots are distrusted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(2000);

/// Connectivity as last observed by the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Derived save-lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Editing,
    Saving,
    GracePeriod,
}

/// Why a snapshot's content was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Veto {
    LocalFocus,
    Saving,
    UnsavedChanges,
    GracePeriod,
}

/// What happened to one incoming snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Content written to the surface.
    Applied { caret_preserved: bool },
    /// Content accepted but identical to the surface; nothing written.
    Unchanged,
    /// Content dropped, metadata refreshed.
    Deferred(Veto),
    /// Older than a snapshot already processed; dropped entirely.
    Stale { seq: u64, newest: u64 },
    /// Document closed.
    Ignored,
}

/// Result of feeding a save response back into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// `resave` asks the caller to send the next save right away.
    Saved { revision: u64, resave: bool },
    Failed(SaveError),
    /// Document closed, or no save was in flight.
    Ignored,
}

/// User-visible save failure. Work is never discarded; the user retries by
/// editing again or saving manually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveError {
    pub message: String,
    pub retryable: bool,
}

/// Local buffer and save lifecycle.
#[derive(Debug, Clone, Default)]
pub struct LocalEditState {
    pub buffer_text: String,
    pub has_unsaved_changes: bool,
    /// At most one save is in flight per document.
    pub is_saving: bool,
    pub last_save_completed_at: Option<Instant>,
}

/// Read-only view for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub document_id: DocumentId,
    pub connection: ConnectionState,
    pub phase: SyncPhase,
    pub has_unsaved_changes: bool,
    pub is_saving: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub save_error: Option<SaveError>,
    pub roster: Vec<RosterEntry>,
    pub badges: Vec<(LineNumber, LineBadge)>,
    pub closed: bool,
}

/// Everything one open document owns.
#[derive(Debug)]
pub struct EngineState {
    document_id: DocumentId,
    self_id: ParticipantId,
    grace_period: Duration,
    local: LocalEditState,
    /// Text the server is known to hold: last applied snapshot or
    /// acknowledged save.
    synced_text: String,
    /// Lines the server held in the newest snapshot or after our last save.
    server_line_count: usize,
    in_flight: Option<String>,
    /// The debounce fired while a save was already in flight.
    resave_requested: bool,
    newest_seq: Option<u64>,
    /// Fetch whose outcome last set `connection`.
    connection_seq: u64,
    debouncer: SaveDebouncer,
    attribution: LineAttributionTracker,
    presence: PresenceAggregator,
    roster: Vec<RosterEntry>,
    connection: ConnectionState,
    last_saved_at: Option<DateTime<Utc>>,
    save_error: Option<SaveError>,
    closed: bool,
}

impl EngineState {
    pub fn new(
        document_id: DocumentId,
        self_id: ParticipantId,
        grace_period: Duration,
        debouncer: SaveDebouncer,
        presence: PresenceAggregator,
    ) -> Self {
        Self {
            document_id,
            self_id,
            grace_period,
            local: LocalEditState::default(),
            synced_text: String::new(),
            server_line_count: 0,
            in_flight: None,
            resave_requested: false,
            newest_seq: None,
            connection_seq: 0,
            debouncer,
            attribution: LineAttributionTracker::new(),
            presence,
            roster: Vec::new(),
            connection: ConnectionState::Connecting,
            last_saved_at: None,
            save_error: None,
            closed: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn self_id(&self) -> &ParticipantId {
        &self.self_id
    }

    pub fn local(&self) -> &LocalEditState {
        &self.local
    }

    pub fn attribution(&self) -> &LineAttributionTracker {
        &self.attribution
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn debouncer(&self) -> &SaveDebouncer {
        &self.debouncer
    }

    pub fn save_error(&self) -> Option<&SaveError> {
        self.save_error.as_ref()
    }

    pub fn server_line_count(&self) -> usize {
        self.server_line_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ── Decision ─────────────────────────────────────────────────

    fn in_grace_period(&self, now: Instant) -> bool {
        self.local
            .last_save_completed_at
            .is_some_and(|done| now.saturating_duration_since(done) <= self.grace_period)
    }

    /// Evaluate the apply rule against live state.
    pub fn decide(&self, locally_focused: bool, now: Instant) -> Result<(), Veto> {
        if locally_focused {
            return Err(Veto::LocalFocus);
        }
        if self.local.is_saving {
            return Err(Veto::Saving);
        }
        if self.local.has_unsaved_changes {
            return Err(Veto::UnsavedChanges);
        }
        if self.in_grace_period(now) {
            return Err(Veto::GracePeriod);
        }
        Ok(())
    }

    pub fn should_apply(&self, locally_focused: bool, now: Instant) -> bool {
        self.decide(locally_focused, now).is_ok()
    }

    pub fn phase(&self, now: Instant) -> SyncPhase {
        if self.debouncer.is_armed() {
            SyncPhase::Editing
        } else if self.local.is_saving {
            SyncPhase::Saving
        } else if self.local.has_unsaved_changes {
            SyncPhase::Editing
        } else if self.in_grace_period(now) {
            SyncPhase::GracePeriod
        } else {
            SyncPhase::Idle
        }
    }

    // ── Snapshots ────────────────────────────────────────────────

    /// Ordering and metadata half of snapshot handling. `Err` carries the
    /// outcome for a snapshot that is ignored entirely.
    ///
    /// While a save is in flight or inside the grace period the snapshot may
    /// predate our save, so the line count from the acknowledged save wins.
    fn accept_metadata(&mut self, seq: u64, snapshot: &DocumentSnapshot, now: Instant) -> Result<(), SnapshotOutcome> {
        if self.closed {
            return Err(SnapshotOutcome::Ignored);
        }
        if let Some(newest) = self.newest_seq {
            if seq < newest {
                return Err(SnapshotOutcome::Stale { seq, newest });
            }
        }
        self.newest_seq = Some(seq);
        if !self.local.is_saving && !self.in_grace_period(now) {
            self.server_line_count = snapshot.server_line_count;
        }
        self.attribution.update(snapshot);
        self.roster = self.presence.aggregate(&snapshot.presence, &self.self_id);
        Ok(())
    }

    /// Record that `text` is now both on the surface and on the server.
    fn adopt_content(&mut self, text: String) {
        self.synced_text = text.clone();
        self.local.buffer_text = text;
        self.local.has_unsaved_changes = false;
    }

    // ── Local edits and saves ────────────────────────────────────

    /// A keystroke changed the buffer to `text`.
    pub fn on_local_edit(&mut self, text: String, now: Instant) {
        if self.closed {
            return;
        }
        self.local.has_unsaved_changes = text != self.synced_text;
        self.local.buffer_text = text;
        self.debouncer.on_local_edit(now);
    }

    /// Fire the debounce timer if due, returning the save to send.
    pub fn on_debounce_due(&mut self, now: Instant) -> Option<ReplaceCommand> {
        let edits = self.debouncer.fire_if_due(now)?;
        log::debug!("Debounce fired for {} after {edits} edits", self.document_id);
        self.begin_save()
    }

    /// Save immediately, bypassing the debounce.
    pub fn save_now(&mut self) -> Option<ReplaceCommand> {
        self.debouncer.cancel();
        self.begin_save()
    }

    /// Start a save of the whole buffer, unless one is in flight or there
    /// is nothing to save.
    pub fn begin_save(&mut self) -> Option<ReplaceCommand> {
        if self.closed {
            return None;
        }
        if self.local.is_saving {
            self.resave_requested = true;
            return None;
        }
        if !self.local.has_unsaved_changes {
            return None;
        }

        let text = self.local.buffer_text.clone();
        self.local.is_saving = true;
        self.in_flight = Some(text.clone());
        self.save_error = None;
        Some(ReplaceCommand::whole_document(self.document_id, self.server_line_count, text))
    }

    /// Feed the response of the in-flight save back in.
    pub fn complete_save(&mut self, result: Result<ReplaceAck, ServiceError>, now: Instant) -> SaveOutcome {
        if self.closed || !self.local.is_saving {
            return SaveOutcome::Ignored;
        }

        self.local.is_saving = false;
        let sent = self.in_flight.take().unwrap_or_default();
        let resave_requested = std::mem::take(&mut self.resave_requested);

        match result {
            Ok(ack) => {
                self.server_line_count = line_count_of(&sent);
                self.synced_text = sent;
                self.local.last_save_completed_at = Some(now);
                self.local.has_unsaved_changes = self.local.buffer_text != self.synced_text;
                self.last_saved_at = Some(Utc::now());
                SaveOutcome::Saved {
                    revision: ack.revision,
                    resave: resave_requested
                        && self.local.has_unsaved_changes
                        && !self.debouncer.is_armed(),
                }
            }
            Err(e) => {
                self.local.has_unsaved_changes = self.local.buffer_text != self.synced_text;
                let error = SaveError {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                };
                self.save_error = Some(error.clone());
                SaveOutcome::Failed(error)
            }
        }
    }

    // ── Connectivity ─────────────────────────────────────────────

    /// Returns `true` if the state changed.
    pub fn set_connection(&mut self, connection: ConnectionState) -> bool {
        if self.closed || self.connection == connection {
            return false;
        }
        self.connection = connection;
        true
    }

    /// Record the outcome of fetch number `seq`. A fetch older than the one
    /// that last set connectivity cannot change it. Returns `true` if the
    /// state changed.
    pub fn record_fetch(&mut self, seq: u64, succeeded: bool) -> bool {
        if self.closed || seq < self.connection_seq {
            return false;
        }
        self.connection_seq = seq;
        let connection = if succeeded {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_connection(connection)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Close the document. Every later call is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
        self.debouncer.cancel();
        self.resave_requested = false;
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        SessionStatus {
            document_id: self.document_id,
            connection: self.connection,
            phase: self.phase(now),
            has_unsaved_changes: self.local.has_unsaved_changes,
            is_saving: self.local.is_saving,
            last_saved_at: self.last_saved_at,
            save_error: self.save_error.clone(),
            roster: self.roster.clone(),
            badges: self.attribution.badges(),
            closed: self.closed,
        }
    }
}

/// [`EngineState`] bound to the surface it writes into.
pub struct ReconciliationEngine<S: EditingSurface> {
    state: EngineState,
    surface: S,
}

impl<S: EditingSurface> ReconciliationEngine<S> {
    pub fn new(state: EngineState, surface: S) -> Self {
        Self { state, surface }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Focus by someone who can type. Read-only observers do not count.
    pub fn is_locally_focused(&self) -> bool {
        self.surface.has_focus() && !self.surface.is_read_only()
    }

    /// Install the initial document content regardless of focus.
    pub fn load(&mut self, snapshot: &DocumentSnapshot) -> SnapshotOutcome {
        if let Err(outcome) = self.state.accept_metadata(0, snapshot, Instant::now()) {
            return outcome;
        }
        self.write_content(snapshot.text())
    }

    /// Handle snapshot number `seq` arriving at `now`.
    pub fn on_snapshot_received(&mut self, seq: u64, snapshot: &DocumentSnapshot, now: Instant) -> SnapshotOutcome {
        if let Err(outcome) = self.state.accept_metadata(seq, snapshot, now) {
            return outcome;
        }

        if let Err(veto) = self.state.decide(self.is_locally_focused(), now) {
            return SnapshotOutcome::Deferred(veto);
        }

        self.write_content(snapshot.text())
    }

    fn write_content(&mut self, text: String) -> SnapshotOutcome {
        if self.surface.value() == text {
            self.state.adopt_content(text);
            return SnapshotOutcome::Unchanged;
        }

        let caret = self.surface.has_focus().then(|| self.surface.selection());
        self.surface.set_value(&text);
        if let Some(selection) = caret {
            let len = text.chars().count();
            self.surface.set_selection(cursor::clamp(selection, len));
        }
        self.state.adopt_content(text);

        SnapshotOutcome::Applied {
            caret_preserved: caret.is_some(),
        }
    }

    pub fn on_local_edit(&mut self, text: String, now: Instant) {
        self.state.on_local_edit(text, now);
    }

    pub fn on_debounce_due(&mut self, now: Instant) -> Option<ReplaceCommand> {
        self.state.on_debounce_due(now)
    }

    pub fn save_now(&mut self) -> Option<ReplaceCommand> {
        self.state.save_now()
    }

    pub fn complete_save(&mut self, result: Result<ReplaceAck, ServiceError>, now: Instant) -> SaveOutcome {
        self.state.complete_save(result, now)
    }

    pub fn close(&mut self) {
        self.state.close();
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        self.state.status(now)
    }
}
