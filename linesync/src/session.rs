//! Open-document sessions.
//!
//! A [`DocumentSession`] is a handle onto an actor task that owns the
//! [`ReconciliationEngine`] for one document together with its poll loop,
//! heartbeat and debounce timer. Every mutation of engine state happens on
//! that one task, so snapshot application, keystrokes and save completions
//! are strictly serialized.
//!
//! ```text
//!  host ──local_edit/save_now/refresh/close──▶ ┌──────────────┐
//!                                              │ session task │──▶ surface
//!  PollLoop ──────────(seq, snapshot)────────▶ │   (engine)   │
//!  save task ─────────(ack | error)──────────▶ └──────┬───────┘
//!                                                     │
//!                              watch<SessionStatus> ◀─┴─▶ mpsc<SessionEvent>
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::SessionConfig;
use crate::debounce::SaveDebouncer;
use crate::engine::{
    ConnectionState, EngineState, ReconciliationEngine, SaveError, SaveOutcome, SessionStatus, SnapshotOutcome, Veto,
};
use crate::error::{Result, ServiceError, SyncError};
use crate::poll::{FetchResult, PollLoop};
use crate::presence::PresenceAggregator;
use crate::protocol::{DocumentId, ParticipantId, ReplaceAck, ReplaceCommand};
use crate::service::{Backend, CommandService};
use crate::surface::EditingSurface;

/// Discrete notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Remote content was written to the surface.
    ContentApplied { caret_preserved: bool },
    /// Remote content was held back.
    ContentDeferred(Veto),
    /// A snapshot had an unrecognized content shape and was discarded.
    SnapshotRejected(String),
    SaveStarted,
    SaveCompleted { revision: u64 },
    SaveFailed(SaveError),
    ConnectionChanged(ConnectionState),
}

enum Command {
    LocalEdit(String),
    SaveNow,
    Close(oneshot::Sender<()>),
}

/// Handle to one open document.
pub struct DocumentSession {
    document_id: DocumentId,
    commands: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    refresh: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl DocumentSession {
    /// Load the document and start polling it.
    ///
    /// The initial load installs the content regardless of focus. Its
    /// failure is terminal: nothing is spawned and the caller decides
    /// whether to try again.
    pub async fn open<S: EditingSurface>(
        document_id: DocumentId,
        self_id: ParticipantId,
        surface: S,
        backend: Backend,
        config: &SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let raw = backend
            .snapshots
            .get_document_content(document_id, false, true)
            .await
            .map_err(|source| SyncError::InitialLoad { document_id, source })?;
        let snapshot = raw.normalize()?;

        let state = EngineState::new(
            document_id,
            self_id,
            config.grace_period(),
            SaveDebouncer::new(config.save_debounce()),
            PresenceAggregator::new(config.palette_size),
        );
        let mut engine = ReconciliationEngine::new(state, surface);
        engine.load(&snapshot);
        engine.state_mut().set_connection(ConnectionState::Connected);

        let (fetch_tx, fetch_rx) = mpsc::channel(16);
        let poll = PollLoop::spawn(
            document_id,
            backend.snapshots.clone(),
            backend.heartbeat.clone(),
            config.poll_interval(),
            config.heartbeat_interval(),
            fetch_tx,
        );

        let (command_tx, command_rx) = mpsc::channel(256);
        let (save_tx, save_rx) = mpsc::channel(4);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (status_tx, status_rx) = watch::channel(engine.status(Instant::now()));

        log::info!(
            "Opened document {document_id} ({} lines)",
            engine.state().server_line_count()
        );

        let actor = SessionTask {
            engine,
            commands: backend.commands.clone(),
            poll,
            command_rx,
            fetch_rx,
            refresh_rx,
            save_tx,
            save_rx,
            event_tx,
            status_tx,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            document_id,
            commands: command_tx,
            status_rx,
            event_rx: Some(event_rx),
            refresh: refresh_tx,
            task,
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Latest derived status.
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Report that the surface value is now `text` after a keystroke.
    pub async fn local_edit(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::LocalEdit(text.into())).await
    }

    /// Save immediately instead of waiting for the debounce.
    pub async fn save_now(&self) -> Result<()> {
        self.send(Command::SaveNow).await
    }

    /// Fetch a fresh snapshot now. Requests made while one is already
    /// queued are merged.
    pub fn refresh(&self) -> Result<()> {
        match self.refresh.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SyncError::Closed(self.document_id)),
        }
    }

    /// Close the document: stop polling, heartbeats and the debounce
    /// timer. A save in flight may still reach the server but its result
    /// is ignored. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Closed(self.document_id))
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionTask<S: EditingSurface> {
    engine: ReconciliationEngine<S>,
    commands: Arc<dyn CommandService>,
    poll: PollLoop,
    command_rx: mpsc::Receiver<Command>,
    fetch_rx: mpsc::Receiver<FetchResult>,
    refresh_rx: mpsc::Receiver<()>,
    save_tx: mpsc::Sender<std::result::Result<ReplaceAck, ServiceError>>,
    save_rx: mpsc::Receiver<std::result::Result<ReplaceAck, ServiceError>>,
    event_tx: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
}

impl<S: EditingSurface> SessionTask<S> {
    async fn run(mut self) {
        let document_id = self.engine.state().document_id();

        loop {
            let deadline = self.engine.state().debouncer().deadline();

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::LocalEdit(text)) => self.on_local_edit(text),
                    Some(Command::SaveNow) => {
                        if let Some(command) = self.engine.save_now() {
                            self.start_save(command);
                        }
                    }
                    Some(Command::Close(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(fetched) = self.fetch_rx.recv() => self.on_fetch(fetched),
                Some(()) = self.refresh_rx.recv() => self.poll.refresh(),
                Some(result) = self.save_rx.recv() => self.on_save_finished(result),
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(command) = self.engine.on_debounce_due(Instant::now()) {
                        self.start_save(command);
                    }
                }
            }

            self.publish_status();
        }

        log::info!("Closed document {document_id}");
    }

    fn emit(&self, event: SessionEvent) {
        // A full channel drops the event rather than stalling the engine.
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::debug!("Event channel full, dropped {event:?}");
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.engine.status(Instant::now()));
    }

    fn record_fetch(&mut self, seq: u64, succeeded: bool) {
        if self.engine.state_mut().record_fetch(seq, succeeded) {
            let connection = self.engine.state().connection();
            log::info!("Document {} is {connection:?}", self.engine.state().document_id());
            self.emit(SessionEvent::ConnectionChanged(connection));
        }
    }

    fn on_local_edit(&mut self, text: String) {
        self.engine.on_local_edit(text, Instant::now());
        log::debug!(
            "Debounce re-armed for {} ({} pending edits)",
            self.engine.state().document_id(),
            self.engine.state().debouncer().pending_edits()
        );
    }

    fn on_fetch(&mut self, fetched: FetchResult) {
        let document_id = self.engine.state().document_id();
        let FetchResult { seq, result } = fetched;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Snapshot fetch #{seq} for {document_id} failed: {e}");
                self.record_fetch(seq, false);
                return;
            }
        };

        let snapshot = match raw.normalize() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Discarding snapshot #{seq} for {document_id}: {e}");
                self.emit(SessionEvent::SnapshotRejected(e.to_string()));
                return;
            }
        };
        self.record_fetch(seq, true);

        match self.engine.on_snapshot_received(seq, &snapshot, Instant::now()) {
            SnapshotOutcome::Applied { caret_preserved } => {
                log::info!("Applied snapshot #{seq} to {document_id}");
                self.emit(SessionEvent::ContentApplied { caret_preserved });
            }
            SnapshotOutcome::Deferred(veto) => {
                log::debug!("Deferred snapshot #{seq} for {document_id}: {veto:?}");
                self.emit(SessionEvent::ContentDeferred(veto));
            }
            SnapshotOutcome::Stale { seq, newest } => {
                log::debug!("Dropped stale snapshot #{seq} for {document_id} (newest #{newest})");
            }
            SnapshotOutcome::Unchanged | SnapshotOutcome::Ignored => {}
        }
    }

    fn start_save(&self, command: ReplaceCommand) {
        log::debug!(
            "Saving {} bytes over lines [{}, {}) of {}",
            command.text.len(),
            command.start_line,
            command.end_line_exclusive,
            command.document_id
        );
        self.emit(SessionEvent::SaveStarted);

        let commands = self.commands.clone();
        let results = self.save_tx.clone();
        tokio::spawn(async move {
            let result = commands.replace_lines(command).await;
            // The session may have closed meanwhile.
            let _ = results.send(result).await;
        });
    }

    fn on_save_finished(&mut self, result: std::result::Result<ReplaceAck, ServiceError>) {
        let document_id = self.engine.state().document_id();

        match self.engine.complete_save(result, Instant::now()) {
            SaveOutcome::Saved { revision, resave } => {
                log::info!("Saved {document_id} at revision {revision}");
                self.emit(SessionEvent::SaveCompleted { revision });
                if resave {
                    if let Some(command) = self.engine.state_mut().begin_save() {
                        self.start_save(command);
                    }
                }
            }
            SaveOutcome::Failed(error) => {
                log::warn!("Save of {document_id} failed: {}", error.message);
                self.emit(SessionEvent::SaveFailed(error));
            }
            SaveOutcome::Ignored => {}
        }
    }

    fn shutdown(&mut self) {
        self.engine.close();
        self.poll.stop();
        self.publish_status();
    }
}

/// Open sessions keyed by document.
pub struct SessionRegistry {
    self_id: ParticipantId,
    backend: Backend,
    config: SessionConfig,
    sessions: HashMap<DocumentId, DocumentSession>,
}

impl SessionRegistry {
    pub fn new(self_id: ParticipantId, backend: Backend, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            self_id,
            backend,
            config,
            sessions: HashMap::new(),
        })
    }

    /// Open `document_id` bound to `surface`. A document can be open at
    /// most once.
    pub async fn open<S: EditingSurface>(
        &mut self,
        document_id: DocumentId,
        surface: S,
    ) -> Result<&mut DocumentSession> {
        if self.sessions.contains_key(&document_id) {
            return Err(SyncError::AlreadyOpen(document_id));
        }

        let session = DocumentSession::open(
            document_id,
            self.self_id.clone(),
            surface,
            self.backend.clone(),
            &self.config,
        )
        .await?;

        Ok(self.sessions.entry(document_id).or_insert(session))
    }

    pub fn get(&self, document_id: DocumentId) -> Option<&DocumentSession> {
        self.sessions.get(&document_id)
    }

    pub fn get_mut(&mut self, document_id: DocumentId) -> Option<&mut DocumentSession> {
        self.sessions.get_mut(&document_id)
    }

    /// Close and forget one document. Returns `false` if it was not open.
    pub async fn close(&mut self, document_id: DocumentId) -> Result<bool> {
        match self.sessions.remove(&document_id) {
            Some(session) => {
                session.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn close_all(&mut self) -> Result<()> {
        for (_, session) in self.sessions.drain() {
            session.close().await?;
        }
        Ok(())
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
