//! linesync demo: one local editor and one simulated collaborator sharing
//! a document on the in-memory server.
//!
//! Usage: `linesync [config.json]`. Set `RUST_LOG=debug` to see deferred
//! snapshots and debounce activity.

use std::error::Error;
use std::time::Duration;

use log::info;
use tokio::time::sleep;

use linesync::{
    Backend, DocumentId, EditingSurface, MemoryServer, MemorySurface, SessionConfig, SessionEvent, SessionRegistry,
    SessionStatus,
};

const LOCAL_USER: &str = "you";
const COLLABORATOR: &str = "remy";

fn load_config() -> linesync::Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            SessionConfig::from_json_file(path)
        }
        None => Ok(SessionConfig::default()),
    }
}

fn describe(status: &SessionStatus) -> String {
    let roster: Vec<String> = status
        .roster
        .iter()
        .map(|e| format!("{} {} {:?}", e.participant_id, e.color.to_hex(), e.activity))
        .collect();
    format!(
        "{:?} {:?} unsaved={} badges={} roster=[{}]",
        status.connection,
        status.phase,
        status.has_unsaved_changes,
        status.badges.len(),
        roster.join(", ")
    )
}

/// Edits the document directly on the server every couple of seconds.
async fn collaborate(server: MemoryServer, id: DocumentId) {
    let drafts = [
        "Meeting notes\n- agenda",
        "Meeting notes\n- agenda\n- budget",
        "Meeting notes\n- agenda\n- budget\n- hiring",
    ];
    for (i, draft) in drafts.iter().enumerate() {
        server.move_cursor(id, 2, 0).await;
        server.write(id, draft).await;
        if i == 1 {
            server.lock_line(id, 3).await;
        }
        sleep(Duration::from_millis(2500)).await;
    }
    server.unlock_line(id, 3).await;
    server.leave(id).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    info!("Starting linesync demo: {config:?}");

    let server = MemoryServer::new();
    let id = server.create_document("Meeting notes").await;
    let backend = Backend::from_shared(std::sync::Arc::new(server.handle(LOCAL_USER)));
    let mut registry = SessionRegistry::new(LOCAL_USER.into(), backend, config)?;

    let surface = MemorySurface::new();
    let session = registry.open(id, surface.clone()).await?;

    if let Some(mut events) = session.take_event_rx() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::SaveFailed(error) => log::warn!("Event: save failed: {}", error.message),
                    other => info!("Event: {other:?}"),
                }
            }
        });
    }
    let mut status_rx = session.watch_status();
    tokio::spawn(async move {
        let mut last = String::new();
        while status_rx.changed().await.is_ok() {
            let line = describe(&status_rx.borrow_and_update());
            if line != last {
                info!("Status: {line}");
                last = line;
            }
        }
    });

    let remote = tokio::spawn(collaborate(server.handle(COLLABORATOR), id));

    // Let a couple of remote edits land before typing.
    sleep(Duration::from_millis(3000)).await;
    surface.focus();
    for word in ["\n", "- ", "action ", "items"] {
        let text = surface.type_text(word);
        session.local_edit(text).await?;
        sleep(Duration::from_millis(200)).await;
    }
    surface.blur();

    // Brief outage: polls fail and the session reports itself disconnected.
    sleep(Duration::from_millis(1500)).await;
    server.set_offline(true).await;
    sleep(Duration::from_millis(3000)).await;
    server.set_offline(false).await;

    remote.await?;
    sleep(Duration::from_millis(4000)).await;

    info!("Local surface:\n{}", surface.value());
    info!("Server copy:\n{}", server.content(id).await.unwrap_or_default());
    info!("Server stats: {:?}", server.stats().await);

    registry.close_all().await?;
    Ok(())
}
