//! In-memory document server implementing all three collaborator traits.
//!
//! Architecture:
//! ```text
//! MemoryServer::handle("alice") ──┐
//!                                 ├── Arc<RwLock<ServerState>>
//! MemoryServer::handle("bob")   ──┘        │
//!                                          ├── documents: lines, authors, locks, presence
//!                                          ├── faults: offline / failing saves / held saves
//!                                          └── stats + replace log
//! ```
//!
//! Every handle shares one state and carries the identity its replace
//! commands and heartbeats are attributed to. Used by the integration tests
//! and the demo binary; a real deployment talks to an HTTP backend instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};

use crate::error::ServiceError;
use crate::protocol::{
    DocumentId, LineMap, LineNumber, ParticipantId, PresenceRecord, RawSnapshot, ReplaceAck, ReplaceCommand,
};
use crate::service::{CommandService, HeartbeatService, SnapshotService};

/// Which of the accepted wire shapes snapshots are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentShape {
    #[default]
    Lines,
    NestedLines,
    Joined,
    NestedJoined,
    /// Not an accepted shape; for exercising the rejection path.
    Garbage,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub fetches: u64,
    pub failed_fetches: u64,
    pub replaces: u64,
    pub failed_replaces: u64,
    pub heartbeats: u64,
}

#[derive(Debug, Default)]
struct StoredDocument {
    lines: Vec<String>,
    authors: LineMap,
    locks: LineMap,
    presence: Vec<PresenceRecord>,
    revision: u64,
}

impl StoredDocument {
    fn from_text(text: &str, author: Option<&ParticipantId>) -> Self {
        let mut doc = Self::default();
        doc.replace(0, 0, text, author);
        doc
    }

    /// Replace 0-based lines `[start, end)` with the lines of `text`,
    /// attributing the new lines to `author` and shifting the rest.
    fn replace(&mut self, start: usize, end: usize, text: &str, author: Option<&ParticipantId>) {
        let new_lines: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            text.split('\n').map(str::to_string).collect()
        };
        let inserted = new_lines.len();
        let removed = end - start;
        self.lines.splice(start..end, new_lines);

        let shift = |map: &LineMap| -> LineMap {
            map.iter()
                .filter_map(|(&line, who)| {
                    let idx = (line as usize).checked_sub(1)?;
                    if idx < start {
                        Some((line, who.clone()))
                    } else if idx >= end {
                        let moved = idx - removed + inserted + 1;
                        LineNumber::try_from(moved).ok().map(|l| (l, who.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };
        self.authors = shift(&self.authors);
        self.locks = shift(&self.locks);

        if let Some(author) = author {
            for offset in 0..inserted {
                if let Ok(line) = LineNumber::try_from(start + offset + 1) {
                    self.authors.insert(line, author.clone());
                }
            }
        }
        self.revision += 1;
    }

    fn upsert_presence(&mut self, record: PresenceRecord) {
        match self.presence.iter_mut().find(|r| r.participant_id == record.participant_id) {
            Some(existing) => *existing = record,
            None => self.presence.push(record),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    documents: HashMap<DocumentId, StoredDocument>,
    shape: ContentShape,
    omit_authorship: bool,
    offline: bool,
    failing_saves: u32,
    save_gate: Option<Arc<Semaphore>>,
    fetch_gate: Option<Arc<Semaphore>>,
    replace_log: Vec<ReplaceCommand>,
    stats: ServerStats,
}

/// Handle onto a shared in-memory server.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    identity: ParticipantId,
    state: Arc<RwLock<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// New empty server; the returned handle acts as `"server"`.
    pub fn new() -> Self {
        Self {
            identity: ParticipantId::from("server"),
            state: Arc::new(RwLock::new(ServerState::default())),
        }
    }

    /// Another handle onto the same server acting as `participant`.
    pub fn handle(&self, participant: impl Into<String>) -> Self {
        Self {
            identity: ParticipantId::new(participant),
            state: self.state.clone(),
        }
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    // ── Document setup and direct edits ──────────────────────────

    pub async fn create_document(&self, text: &str) -> DocumentId {
        let id = DocumentId::new();
        self.insert_document(id, text).await;
        id
    }

    pub async fn insert_document(&self, id: DocumentId, text: &str) {
        let doc = StoredDocument::from_text(text, Some(&self.identity));
        self.state.write().await.documents.insert(id, doc);
    }

    /// Whole-document replace performed by this handle's participant,
    /// bypassing fault injection.
    pub async fn write(&self, id: DocumentId, text: &str) {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(&id) {
            let len = doc.lines.len();
            doc.replace(0, len, text, Some(&self.identity));
        }
    }

    pub async fn content(&self, id: DocumentId) -> Option<String> {
        let state = self.state.read().await;
        state.documents.get(&id).map(|doc| doc.lines.join("\n"))
    }

    pub async fn authors(&self, id: DocumentId) -> LineMap {
        let state = self.state.read().await;
        state.documents.get(&id).map(|doc| doc.authors.clone()).unwrap_or_default()
    }

    pub async fn lock_line(&self, id: DocumentId, line: LineNumber) {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(&id) {
            doc.locks.insert(line, self.identity.clone());
        }
    }

    pub async fn unlock_line(&self, id: DocumentId, line: LineNumber) {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(&id) {
            doc.locks.remove(&line);
        }
    }

    /// Publish this participant's caret, replacing any previous record.
    pub async fn move_cursor(&self, id: DocumentId, line: LineNumber, column: u32) {
        let record = PresenceRecord::new(self.identity.as_str()).with_cursor(line, column);
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(&id) {
            doc.upsert_presence(record);
        }
    }

    pub async fn leave(&self, id: DocumentId) {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(&id) {
            doc.presence.retain(|r| r.participant_id != self.identity);
        }
    }

    // ── Fault injection ──────────────────────────────────────────

    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    pub async fn set_content_shape(&self, shape: ContentShape) {
        self.state.write().await.shape = shape;
    }

    /// Answer snapshots without a `lineAuthors` field.
    pub async fn set_omit_authorship(&self, omit: bool) {
        self.state.write().await.omit_authorship = omit;
    }

    /// Reject the next `count` replace commands.
    pub async fn fail_next_saves(&self, count: u32) {
        self.state.write().await.failing_saves = count;
    }

    /// Park replace commands until [`MemoryServer::release_saves`].
    pub async fn hold_saves(&self) {
        self.state.write().await.save_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub async fn release_saves(&self) {
        if let Some(gate) = self.state.write().await.save_gate.take() {
            gate.close();
        }
    }

    /// Park snapshot fetches until [`MemoryServer::release_fetches`].
    pub async fn hold_fetches(&self) {
        self.state.write().await.fetch_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub async fn release_fetches(&self) {
        if let Some(gate) = self.state.write().await.fetch_gate.take() {
            gate.close();
        }
    }

    // ── Inspection ───────────────────────────────────────────────

    pub async fn stats(&self) -> ServerStats {
        self.state.read().await.stats.clone()
    }

    pub async fn replace_log(&self) -> Vec<ReplaceCommand> {
        self.state.read().await.replace_log.clone()
    }

    async fn snapshot(&self, id: DocumentId, include_presence: bool) -> Result<RawSnapshot, ServiceError> {
        let gate = self.state.read().await.fetch_gate.clone();
        wait_at(gate).await;

        let mut state = self.state.write().await;
        if state.offline {
            state.stats.failed_fetches += 1;
            return Err(ServiceError::Transport("server unreachable".into()));
        }
        state.stats.fetches += 1;

        let shape = state.shape;
        let omit_authorship = state.omit_authorship;
        let doc = state.documents.get(&id).ok_or(ServiceError::NotFound(id))?;

        Ok(RawSnapshot {
            document_id: id,
            content: render_content(&doc.lines, shape),
            line_authors: (!omit_authorship).then(|| doc.authors.clone()),
            line_locks: Some(doc.locks.clone()),
            presence: include_presence.then(|| doc.presence.clone()),
        })
    }

    async fn apply_replace(&self, command: ReplaceCommand) -> Result<ReplaceAck, ServiceError> {
        let gate = self.state.read().await.save_gate.clone();
        wait_at(gate).await;

        let mut state = self.state.write().await;
        state.replace_log.push(command.clone());

        if state.offline {
            state.stats.failed_replaces += 1;
            return Err(ServiceError::Transport("server unreachable".into()));
        }
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            state.stats.failed_replaces += 1;
            return Err(ServiceError::Rejected {
                status: 503,
                message: "storage unavailable".into(),
            });
        }

        let doc = state
            .documents
            .get_mut(&command.document_id)
            .ok_or(ServiceError::NotFound(command.document_id))?;

        let len = doc.lines.len();
        let start = (command.start_line.max(1) - 1) as usize;
        let end = ((command.end_line_exclusive.max(1) - 1) as usize).min(len);
        if start > len || start > end {
            return Err(ServiceError::Rejected {
                status: 416,
                message: format!(
                    "range [{}, {}) outside document of {len} lines",
                    command.start_line, command.end_line_exclusive
                ),
            });
        }

        doc.replace(start, end, &command.text, Some(&self.identity));
        let revision = doc.revision;
        state.stats.replaces += 1;

        Ok(ReplaceAck {
            document_id: command.document_id,
            revision,
        })
    }

    async fn touch_presence(&self, id: DocumentId) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        if state.offline {
            return Err(ServiceError::Transport("server unreachable".into()));
        }
        state.stats.heartbeats += 1;

        let doc = state.documents.get_mut(&id).ok_or(ServiceError::NotFound(id))?;
        match doc.presence.iter_mut().find(|r| r.participant_id == self.identity) {
            Some(record) => record.last_activity = Utc::now(),
            None => doc.presence.push(PresenceRecord::new(self.identity.as_str())),
        }
        Ok(())
    }
}

fn render_content(lines: &[String], shape: ContentShape) -> Value {
    match shape {
        ContentShape::Lines => json!(lines),
        ContentShape::NestedLines => json!({ "content": lines }),
        ContentShape::Joined => json!(lines.join("\n")),
        ContentShape::NestedJoined => json!({ "content": lines.join("\n") }),
        ContentShape::Garbage => json!({ "body": lines.len() }),
    }
}

async fn wait_at(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        // Closed on release; the error just means "go ahead".
        let _ = gate.acquire().await;
    }
}

impl SnapshotService for MemoryServer {
    fn get_document_content(
        &self,
        document_id: DocumentId,
        _force_refresh: bool,
        include_presence: bool,
    ) -> BoxFuture<'_, Result<RawSnapshot, ServiceError>> {
        Box::pin(self.snapshot(document_id, include_presence))
    }
}

impl CommandService for MemoryServer {
    fn replace_lines(&self, command: ReplaceCommand) -> BoxFuture<'_, Result<ReplaceAck, ServiceError>> {
        Box::pin(self.apply_replace(command))
    }
}

impl HeartbeatService for MemoryServer {
    fn send_heartbeat(&self, document_id: DocumentId) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(self.touch_presence(document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(id: DocumentId, start: u32, end: u32, text: &str) -> ReplaceCommand {
        ReplaceCommand {
            document_id: id,
            start_line: start,
            end_line_exclusive: end,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_shapes_normalize_identically() {
        let server = MemoryServer::new();
        let id = server.create_document("a\nb").await;

        for shape in [ContentShape::Lines, ContentShape::NestedLines, ContentShape::Joined, ContentShape::NestedJoined] {
            server.set_content_shape(shape).await;
            let raw = server.get_document_content(id, true, true).await.unwrap();
            let snapshot = raw.normalize().unwrap();
            assert_eq!(snapshot.content_lines, vec!["a", "b"], "{shape:?}");
        }
    }

    #[tokio::test]
    async fn test_presence_only_when_requested() {
        let server = MemoryServer::new();
        let id = server.create_document("x").await;
        server.handle("bob").move_cursor(id, 1, 0).await;

        let raw = server.get_document_content(id, false, false).await.unwrap();
        assert!(raw.presence.is_none());
        let raw = server.get_document_content(id, false, true).await.unwrap();
        assert_eq!(raw.presence.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_whole_replace_last_writer_wins() {
        let server = MemoryServer::new();
        let id = server.create_document("one\ntwo").await;
        let alice = server.handle("alice");
        let bob = server.handle("bob");

        alice.replace_lines(cmd(id, 1, 3, "alice was here")).await.unwrap();
        bob.replace_lines(cmd(id, 1, 2, "bob was here")).await.unwrap();

        assert_eq!(server.content(id).await.unwrap(), "bob was here");
        assert_eq!(server.authors(id).await.get(&1), Some(&ParticipantId::from("bob")));
    }

    #[tokio::test]
    async fn test_partial_replace_shifts_attribution() {
        let server = MemoryServer::new();
        let id = server.create_document("a\nb\nc").await;
        server.handle("zed").lock_line(id, 3).await;

        let ack = server.handle("bob").replace_lines(cmd(id, 2, 3, "b1\nb2")).await.unwrap();
        assert_eq!(ack.revision, 2);
        assert_eq!(server.content(id).await.unwrap(), "a\nb1\nb2\nc");

        let authors = server.authors(id).await;
        assert_eq!(authors.get(&1).map(|p| p.as_str()), Some("server"));
        assert_eq!(authors.get(&3).map(|p| p.as_str()), Some("bob"));
        assert_eq!(authors.get(&4).map(|p| p.as_str()), Some("server"));

        let raw = server.get_document_content(id, false, false).await.unwrap();
        assert_eq!(raw.line_locks.unwrap().get(&4).map(|p| p.as_str()), Some("zed"));
    }

    #[tokio::test]
    async fn test_out_of_range_replace_rejected() {
        let server = MemoryServer::new();
        let id = server.create_document("a").await;
        let err = server.replace_lines(cmd(id, 5, 6, "x")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { status: 416, .. }));
    }

    #[tokio::test]
    async fn test_offline_and_failing_saves() {
        let server = MemoryServer::new();
        let id = server.create_document("a").await;

        server.set_offline(true).await;
        assert!(server.get_document_content(id, true, true).await.is_err());
        assert!(server.send_heartbeat(id).await.is_err());
        server.set_offline(false).await;

        server.fail_next_saves(1).await;
        assert!(server.replace_lines(cmd(id, 1, 2, "b")).await.is_err());
        assert!(server.replace_lines(cmd(id, 1, 2, "b")).await.is_ok());

        let stats = server.stats().await;
        assert_eq!(stats.failed_fetches, 1);
        assert_eq!(stats.failed_replaces, 1);
        assert_eq!(stats.replaces, 1);
    }

    #[tokio::test]
    async fn test_omit_authorship() {
        let server = MemoryServer::new();
        let id = server.create_document("a").await;
        server.set_omit_authorship(true).await;

        let raw = server.get_document_content(id, true, true).await.unwrap();
        assert!(raw.line_authors.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_registers_presence() {
        let server = MemoryServer::new();
        let id = server.create_document("a").await;
        server.handle("carol").send_heartbeat(id).await.unwrap();

        let raw = server.get_document_content(id, false, true).await.unwrap();
        let presence = raw.presence.unwrap();
        assert_eq!(presence[0].participant_id.as_str(), "carol");
        assert!(presence[0].cursor.is_none());
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let server = MemoryServer::new();
        let err = server.get_document_content(DocumentId::new(), false, false).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
