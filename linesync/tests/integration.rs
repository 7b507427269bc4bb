//! End-to-end session tests against the in-memory server.
//!
//! Time is paused, so poll ticks, debounce and grace periods advance
//! deterministically as the runtime goes idle.

use std::sync::Arc;

use linesync::{
    Backend, ConnectionState, ContentShape, DocumentId, DocumentSession, EditingSurface, MemoryServer, MemorySurface, Selection,
    SessionConfig, SessionEvent, SyncPhase, Veto,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

struct Client {
    surface: MemorySurface,
    session: DocumentSession,
    events: mpsc::Receiver<SessionEvent>,
    /// Every event observed so far.
    seen: Vec<SessionEvent>,
}

impl Client {
    async fn open(server: &MemoryServer, id: DocumentId, who: &str) -> Self {
        Self::open_with(server, id, who, SessionConfig::default()).await
    }

    async fn open_with(server: &MemoryServer, id: DocumentId, who: &str, config: SessionConfig) -> Self {
        let surface = MemorySurface::new();
        let backend = Backend::from_shared(Arc::new(server.handle(who)));
        let mut session = DocumentSession::open(id, who.into(), surface.clone(), backend, &config)
            .await
            .unwrap();
        let events = session.take_event_rx().unwrap();
        Self {
            surface,
            session,
            events,
            seen: Vec::new(),
        }
    }

    /// Type into the surface and report it, as a keystroke handler would.
    async fn type_text(&self, s: &str) {
        let text = self.surface.type_text(s);
        self.session.local_edit(text).await.unwrap();
    }

    async fn wait_for(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            self.seen.push(event.clone());
            if matches(&event) {
                return event;
            }
        }
    }
}

fn saved(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::SaveCompleted { .. })
}

fn applied(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ContentApplied { .. })
}

#[tokio::test(start_paused = true)]
async fn test_remote_snapshot_never_clobbers_typing() {
    let server = MemoryServer::new();
    let id = server.create_document("hello").await;
    let mut me = Client::open(&server, id, "me").await;
    me.surface.focus();

    server.handle("bob").write(id, "goodbye").await;
    for ch in " world".chars() {
        me.type_text(&ch.to_string()).await;
        sleep(Duration::from_millis(250)).await;
    }
    me.wait_for(saved).await;

    assert_eq!(me.surface.text(), "hello world");
    assert!(me.seen.contains(&SessionEvent::ContentDeferred(Veto::LocalFocus)));
    assert!(!me.seen.iter().any(applied));

    // Whole-document replace: our save overwrote bob's line.
    assert_eq!(server.content(id).await.unwrap(), "hello world");
}

#[tokio::test(start_paused = true)]
async fn test_edit_burst_coalesces_into_one_save() {
    let server = MemoryServer::new();
    let id = server.create_document("").await;
    let mut me = Client::open(&server, id, "me").await;

    for i in 0..10 {
        me.type_text(&i.to_string()).await;
        sleep(Duration::from_millis(100)).await;
    }
    me.wait_for(saved).await;
    sleep(Duration::from_secs(5)).await;

    let log = server.replace_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "0123456789");
    assert_eq!((log[0].start_line, log[0].end_line_exclusive), (1, 1));
    assert_eq!(server.content(id).await.unwrap(), "0123456789");
}

#[tokio::test(start_paused = true)]
async fn test_phases_follow_save_lifecycle() {
    let server = MemoryServer::new();
    let id = server.create_document("a").await;
    let mut me = Client::open(&server, id, "me").await;
    assert_eq!(me.session.status().phase, SyncPhase::Idle);

    server.hold_saves().await;
    me.type_text("b").await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(me.session.status().phase, SyncPhase::Editing);

    me.wait_for(|e| *e == SessionEvent::SaveStarted).await;
    assert_eq!(me.session.status().phase, SyncPhase::Saving);

    server.release_saves().await;
    me.wait_for(saved).await;
    let status = me.session.status();
    assert_eq!(status.phase, SyncPhase::GracePeriod);
    assert!(status.last_saved_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_marks_disconnected_then_recovers() {
    let server = MemoryServer::new();
    let id = server.create_document("x").await;
    let mut me = Client::open(&server, id, "me").await;
    assert_eq!(me.session.status().connection, ConnectionState::Connected);

    server.set_offline(true).await;
    me.wait_for(|e| *e == SessionEvent::ConnectionChanged(ConnectionState::Disconnected))
        .await;
    assert_eq!(me.session.status().connection, ConnectionState::Disconnected);

    // Still polling at the fixed interval.
    let failed = server.stats().await.failed_fetches;
    sleep(Duration::from_millis(3000)).await;
    assert!(server.stats().await.failed_fetches >= failed + 2);

    server.handle("bob").write(id, "back online").await;
    server.set_offline(false).await;
    me.wait_for(|e| *e == SessionEvent::ConnectionChanged(ConnectionState::Connected))
        .await;
    me.wait_for(applied).await;
    assert_eq!(me.surface.text(), "back online");
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_keeps_work_until_retry() {
    let server = MemoryServer::new();
    let id = server.create_document("draft").await;
    let mut me = Client::open(&server, id, "me").await;

    server.fail_next_saves(1).await;
    me.type_text("!").await;
    let failure = me.wait_for(|e| matches!(e, SessionEvent::SaveFailed(_))).await;
    match failure {
        SessionEvent::SaveFailed(error) => assert!(error.retryable),
        other => panic!("unexpected {other:?}"),
    }

    let status = me.session.status();
    assert!(status.has_unsaved_changes);
    assert!(status.save_error.is_some());

    // Remote edits stay out while our work is unsaved.
    server.handle("bob").write(id, "bob's version").await;
    me.wait_for(|e| *e == SessionEvent::ContentDeferred(Veto::UnsavedChanges))
        .await;
    assert_eq!(me.surface.text(), "draft!");

    // No automatic retry.
    assert_eq!(server.stats().await.replaces, 0);

    me.session.save_now().await.unwrap();
    me.wait_for(saved).await;
    assert_eq!(server.content(id).await.unwrap(), "draft!");
    let status = me.session.status();
    assert!(!status.has_unsaved_changes);
    assert!(status.save_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_save_in_flight() {
    let server = MemoryServer::new();
    let id = server.create_document("v1").await;
    let mut me = Client::open(&server, id, "me").await;

    server.hold_saves().await;
    me.type_text(" v2").await;
    me.wait_for(|e| *e == SessionEvent::SaveStarted).await;

    me.session.close().await.unwrap();
    let fetches = server.stats().await.fetches;

    server.release_saves().await;
    sleep(Duration::from_secs(10)).await;

    // The save reached the server but changed nothing locally.
    assert_eq!(server.content(id).await.unwrap(), "v1 v2");
    let status = me.session.status();
    assert!(status.closed);
    assert!(status.is_saving);
    assert!(me.session.is_closed());

    // Polling and heartbeats stopped with the session.
    let stats = server.stats().await;
    assert_eq!(stats.fetches, fetches);
    assert_eq!(stats.heartbeats, 0);
}

#[tokio::test(start_paused = true)]
async fn test_blank_lines_are_empty_document() {
    let server = MemoryServer::new();
    let id = server.create_document("\n\n").await;
    let mut me = Client::open(&server, id, "me").await;
    assert_eq!(me.surface.text(), "");

    me.type_text("first line").await;
    me.wait_for(saved).await;

    let log = server.replace_log().await;
    assert_eq!((log[0].start_line, log[0].end_line_exclusive), (1, 4));
    assert_eq!(server.content(id).await.unwrap(), "first line");
}

#[tokio::test(start_paused = true)]
async fn test_every_content_shape_applies() {
    let server = MemoryServer::new();
    let id = server.create_document("start").await;
    let mut me = Client::open(&server, id, "me").await;
    let bob = server.handle("bob");

    for (shape, text) in [
        (ContentShape::NestedLines, "nested\nlines"),
        (ContentShape::Joined, "joined\ntext"),
        (ContentShape::NestedJoined, "nested\njoined"),
        (ContentShape::Lines, "plain\nlines"),
    ] {
        server.set_content_shape(shape).await;
        bob.write(id, text).await;
        me.wait_for(applied).await;
        assert_eq!(me.surface.text(), text, "{shape:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_unrecognized_shape_discarded() {
    let server = MemoryServer::new();
    let id = server.create_document("kept").await;
    let mut me = Client::open(&server, id, "me").await;

    server.set_content_shape(ContentShape::Garbage).await;
    server.handle("bob").write(id, "lost").await;
    me.wait_for(|e| matches!(e, SessionEvent::SnapshotRejected(_))).await;

    assert_eq!(me.surface.text(), "kept");
    assert_eq!(me.session.status().connection, ConnectionState::Connected);
    assert!(!me
        .seen
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionChanged(_))));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_saves_last_writer_wins() {
    let server = MemoryServer::new();
    let id = server.create_document("draft").await;
    let mut alice = Client::open(&server, id, "alice").await;
    let mut bob = Client::open(&server, id, "bob").await;

    alice.type_text(" by alice").await;
    sleep(Duration::from_millis(100)).await;
    bob.type_text(" by bob").await;

    alice.wait_for(saved).await;
    bob.wait_for(saved).await;

    // Expected behavior, not a merge: bob saved last and replaced everything.
    assert_eq!(server.content(id).await.unwrap(), "draft by bob");
    assert_eq!(server.replace_log().await.len(), 2);

    // Once alice's grace period is over she converges on bob's text.
    alice.wait_for(applied).await;
    assert_eq!(alice.surface.text(), "draft by bob");
    assert!(alice
        .seen
        .contains(&SessionEvent::ContentDeferred(Veto::GracePeriod)));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_fetches_out_of_schedule() {
    let server = MemoryServer::new();
    let id = server.create_document("old").await;
    let config = SessionConfig {
        poll_interval_ms: 60_000,
        ..SessionConfig::default()
    };
    let mut me = Client::open_with(&server, id, "me", config).await;

    server.handle("bob").write(id, "new").await;
    me.session.refresh().unwrap();

    let started = tokio::time::Instant::now();
    me.wait_for(applied).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(me.surface.text(), "new");
}

#[tokio::test(start_paused = true)]
async fn test_read_only_observer_keeps_selection() {
    let server = MemoryServer::new();
    let id = server.create_document("hello world").await;
    let mut me = Client::open(&server, id, "me").await;
    me.surface.set_read_only(true);
    me.surface.focus();
    me.surface.select(Selection::new(0, 5));

    server.handle("bob").write(id, "HELLO world").await;
    let event = me.wait_for(applied).await;

    assert_eq!(event, SessionEvent::ContentApplied { caret_preserved: true });
    assert_eq!(me.surface.text(), "HELLO world");
    assert_eq!(me.surface.selection(), Selection::new(0, 5));
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_document_does_not_affect_another() {
    let server = MemoryServer::new();
    let healthy = server.create_document("a").await;
    let doomed = server.create_document("b").await;
    let mut first = Client::open(&server, healthy, "me").await;
    let mut second = Client::open(&server, doomed, "me").await;

    second.session.close().await.unwrap();
    server.handle("bob").write(healthy, "a2").await;
    first.wait_for(applied).await;

    assert_eq!(first.surface.text(), "a2");
    assert!(second.session.local_edit("ignored").await.is_err());
    assert!(second.events.recv().await.is_none());
}
