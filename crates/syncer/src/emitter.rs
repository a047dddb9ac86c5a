//! Snapshot emitter: one watch task per (kind, namespace) pair feeding a single
//! aggregation task that owns the [`SnapshotBuilder`].
//!
//! Snapshots go out on a `watch` channel, so an unconsumed snapshot is simply
//! overwritten by the next one. Watch failures go out on a separate bounded
//! error channel and never stop emission.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use sqoop_core::{Kind, Resource, Snapshot, StoreError};
use sqoop_store::{ListOpts, ResourceClient, SnapshotBuilder};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{env_u64, publish, SyncError};

/// Receiving side of the snapshot channel. `None` until the first emission.
pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

#[derive(Debug, Clone)]
pub struct WatchOpts {
    /// Minimum spacing between emissions, and the periodic resync interval.
    pub refresh_rate: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Capacity of the watch-error channel.
    pub error_capacity: usize,
}

impl Default for WatchOpts {
    fn default() -> Self {
        Self {
            refresh_rate: Duration::from_millis(1000),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(env_u64("SQOOP_WATCH_BACKOFF_MAX_MS", 30_000)),
            error_capacity: env_u64("SQOOP_ERR_QUEUE_CAP", 64) as usize,
        }
    }
}

pub struct EmitterHandle {
    pub snapshots: SnapshotRx,
    pub errors: mpsc::Receiver<SyncError>,
    /// Completes after every watch task has stopped.
    pub task: JoinHandle<()>,
}

enum WatchMsg {
    List { kind: Kind, namespace: String, items: Vec<Resource> },
    Failed { kind: Kind, namespace: String, error: StoreError },
}

pub struct SnapshotEmitter {
    clients: Vec<Arc<dyn ResourceClient>>,
}

impl SnapshotEmitter {
    pub fn new(clients: Vec<Arc<dyn ResourceClient>>) -> Self { Self { clients } }

    /// Start one watch per (client kind, namespace) pair and the aggregation
    /// task. Everything stops when `cancel` fires.
    pub fn start(&self, namespaces: &[String], opts: WatchOpts, cancel: CancellationToken) -> EmitterHandle {
        let (snap_tx, snap_rx) = watch::channel(None);
        let (err_tx, err_rx) = mpsc::channel(opts.error_capacity.max(1));
        let (msg_tx, msg_rx) = mpsc::channel(64);

        let namespaces: BTreeSet<&String> = namespaces.iter().collect();
        let mut pairs = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for client in &self.clients {
            for ns in &namespaces {
                pairs.insert((client.kind(), ns.to_string()));
                tasks.spawn(watch_pair(client.clone(), ns.to_string(), opts.clone(), msg_tx.clone(), cancel.clone()));
            }
        }
        drop(msg_tx);
        info!(pairs = pairs.len(), refresh_ms = opts.refresh_rate.as_millis() as u64, "emitter: watches started");

        let task = tokio::spawn(aggregate(pairs, msg_rx, snap_tx, err_tx, tasks, opts, cancel));
        EmitterHandle { snapshots: snap_rx, errors: err_rx, task }
    }
}

/// Watch a single pair forever, restarting with exponential backoff.
async fn watch_pair(
    client: Arc<dyn ResourceClient>,
    namespace: String,
    opts: WatchOpts,
    tx: mpsc::Sender<WatchMsg>,
    cancel: CancellationToken,
) {
    let kind = client.kind();
    let selector = ListOpts::default();
    let mut backoff = opts.backoff_initial;
    loop {
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = client.watch(&namespace, &selector) => r,
        };
        let failure = match started {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                match next {
                    Some(Ok(items)) => {
                        backoff = opts.backoff_initial;
                        let msg = WatchMsg::List { kind, namespace: namespace.clone(), items };
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => break Some(error),
                    None => break None,
                }
            },
            Err(error) => Some(error),
        };
        match failure {
            Some(error) => {
                let msg = WatchMsg::Failed { kind, namespace: namespace.clone(), error };
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            None => debug!(kind = %kind, ns = %namespace, "watch stream ended; restarting"),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(opts.backoff_max);
    }
}

/// Merge watch messages into snapshots. The first snapshot waits until every
/// pair has either listed once or failed to establish. Pairs that failed
/// before ever listing are carried as unsynced, never as empty.
async fn aggregate(
    pairs: BTreeSet<(Kind, String)>,
    mut rx: mpsc::Receiver<WatchMsg>,
    snap_tx: watch::Sender<Option<Arc<Snapshot>>>,
    err_tx: mpsc::Sender<SyncError>,
    mut tasks: JoinSet<()>,
    opts: WatchOpts,
    cancel: CancellationToken,
) {
    let mut builder = SnapshotBuilder::expecting(pairs.iter().cloned());
    let mut failed: BTreeSet<(Kind, String)> = BTreeSet::new();
    let mut ready = pairs.is_empty();
    let mut ticker = tokio::time::interval(opts.refresh_rate.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                None => break,
                Some(WatchMsg::List { kind, namespace, items }) => {
                    failed.remove(&(kind, namespace.clone()));
                    if builder.apply(kind, &namespace, items) {
                        counter!("watch_list_changes_total", 1u64);
                    }
                }
                Some(WatchMsg::Failed { kind, namespace, error }) => {
                    counter!("watch_errors_total", 1u64);
                    warn!(kind = %kind, ns = %namespace, error = %error, "watch failed");
                    failed.insert((kind, namespace.clone()));
                    let err = SyncError::Watch { kind, namespace, source: error };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => warn!(error = %err, "emitter cancelled; error not forwarded"),
                        _ = publish(&err_tx, err.clone()) => {}
                    }
                }
            },
            _ = ticker.tick(), if ready => {
                let snap = builder.freeze();
                debug!(epoch = snap.epoch, inputs = snap.len(), unsynced = snap.unsynced.len(), "emitter: snapshot");
                counter!("snapshots_emitted_total", 1u64);
                snap_tx.send_replace(Some(snap));
            }
        }
        if !ready {
            let synced = builder.synced();
            ready = pairs.iter().all(|p| synced.contains(p) || failed.contains(p));
            if ready {
                info!(failed = failed.len(), "emitter: initial sync complete");
            }
        }
    }

    // Unblock any watch task waiting on a full channel, then wait for all.
    drop(rx);
    while tasks.join_next().await.is_some() {}
    debug!(epoch = builder.epoch(), "emitter stopped");
}
