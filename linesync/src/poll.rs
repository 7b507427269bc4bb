//! Fixed-interval snapshot polling and presence heartbeats.
//!
//! Two independent tasks per open document:
//!
//! ```text
//! poll task ──tick──▶ spawn fetch #n ──▶ JoinSet ──(n, result)──▶ session
//!     ▲
//!     └── refresh() wakes it for an out-of-band fetch
//!
//! heartbeat task ──tick──▶ send_heartbeat (failures ignored)
//! ```
//!
//! Fetches for different ticks run concurrently, so a hung request only
//! stalls its own tick. At most [`MAX_IN_FLIGHT_FETCHES`] run at once;
//! ticks past that are skipped rather than queued. Each fetch is numbered in issue order; the session
//! uses the number to drop responses that resolve after a newer one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::ServiceError;
use crate::protocol::{DocumentId, RawSnapshot};
use crate::service::{HeartbeatService, SnapshotService};

/// Ticks that find this many fetches unresolved issue nothing.
pub const MAX_IN_FLIGHT_FETCHES: usize = 8;

/// A fetch response tagged with its request sequence number.
#[derive(Debug)]
pub struct FetchResult {
    pub seq: u64,
    pub result: Result<RawSnapshot, ServiceError>,
}

/// Handles to the poll and heartbeat tasks of one document.
///
/// Both tasks stop together on [`PollLoop::stop`] or when dropped.
pub struct PollLoop {
    document_id: DocumentId,
    refresh: Arc<Notify>,
    poll_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl PollLoop {
    /// Start polling. The first tick fires one `poll_interval` from now;
    /// sequence numbers start at 1, leaving 0 for the initial load.
    pub fn spawn(
        document_id: DocumentId,
        snapshots: Arc<dyn SnapshotService>,
        heartbeat: Arc<dyn HeartbeatService>,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        results: mpsc::Sender<FetchResult>,
    ) -> Self {
        let refresh = Arc::new(Notify::new());

        let poll_task = tokio::spawn(run_poll(
            document_id,
            snapshots,
            poll_interval,
            refresh.clone(),
            results,
        ));
        let heartbeat_task = tokio::spawn(run_heartbeat(document_id, heartbeat, heartbeat_interval));

        log::debug!(
            "Polling {document_id} every {}ms, heartbeat every {}ms",
            poll_interval.as_millis(),
            heartbeat_interval.as_millis()
        );

        Self {
            document_id,
            refresh,
            poll_task,
            heartbeat_task,
        }
    }

    /// Issue a fetch now, outside the regular schedule.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Cancel both intervals and every fetch still in flight.
    pub fn stop(&self) {
        self.poll_task.abort();
        self.heartbeat_task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.poll_task.is_finished() || !self.heartbeat_task.is_finished()
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
        log::debug!("Stopped polling {}", self.document_id);
    }
}

fn fixed_interval(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_poll(
    document_id: DocumentId,
    snapshots: Arc<dyn SnapshotService>,
    period: Duration,
    refresh: Arc<Notify>,
    results: mpsc::Sender<FetchResult>,
) {
    let mut ticks = fixed_interval(period);
    let mut in_flight: JoinSet<FetchResult> = JoinSet::new();
    let mut next_seq: u64 = 1;

    loop {
        let issue = tokio::select! {
            _ = ticks.tick() => true,
            _ = refresh.notified() => true,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok(fetched) => {
                        if results.send(fetched).await.is_err() {
                            // Session gone.
                            break;
                        }
                    }
                    Err(e) => log::debug!("Fetch task for {document_id} ended abnormally: {e}"),
                }
                false
            }
        };

        if issue && in_flight.len() >= MAX_IN_FLIGHT_FETCHES {
            log::warn!(
                "Skipping poll for {document_id}: {} fetches still unresolved",
                in_flight.len()
            );
        } else if issue {
            let seq = next_seq;
            next_seq += 1;
            log::trace!("Poll #{seq} for {document_id}");

            let snapshots = snapshots.clone();
            in_flight.spawn(async move {
                let result = snapshots.get_document_content(document_id, true, true).await;
                FetchResult { seq, result }
            });
        }
    }
}

async fn run_heartbeat(document_id: DocumentId, heartbeat: Arc<dyn HeartbeatService>, period: Duration) {
    let mut ticks = fixed_interval(period);
    loop {
        ticks.tick().await;
        log::trace!("Heartbeat for {document_id}");
        if let Err(e) = heartbeat.send_heartbeat(document_id).await {
            log::debug!("Heartbeat for {document_id} failed: {e}");
        }
    }
}
