//! Error aggregation: many labelled error channels in, one channel out.

use std::fmt;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{env_u64, SyncError};

/// An error together with the task that produced it.
#[derive(Debug, Clone)]
pub struct Tagged {
    pub source: &'static str,
    pub error: SyncError,
}

impl fmt::Display for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "[{}] {}", self.source, self.error) }
}

/// Merges per-task error channels. Order is preserved per source only.
pub struct ErrorAggregator {
    sources: Vec<(&'static str, mpsc::Receiver<SyncError>)>,
    capacity: usize,
}

impl Default for ErrorAggregator {
    fn default() -> Self { Self::new() }
}

impl ErrorAggregator {
    pub fn new() -> Self { Self { sources: Vec::new(), capacity: env_u64("SQOOP_ERR_QUEUE_CAP", 64) as usize } }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn source(mut self, label: &'static str, rx: mpsc::Receiver<SyncError>) -> Self {
        self.sources.push((label, rx));
        self
    }

    /// Start forwarding. After `cancel` fires no new errors are accepted;
    /// whatever was already queued is still delivered, then the output closes.
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<Tagged>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut forwarders = JoinSet::new();
        for (label, src) in self.sources {
            forwarders.spawn(forward(label, src, tx.clone(), cancel.clone()));
        }
        drop(tx);
        let task = tokio::spawn(async move {
            while forwarders.join_next().await.is_some() {}
            debug!("error aggregator closed");
        });
        (rx, task)
    }
}

async fn forward(label: &'static str, mut rx: mpsc::Receiver<SyncError>, out: mpsc::Sender<Tagged>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(error) => {
                    if out.send(Tagged { source: label, error }).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
    rx.close();
    while let Some(error) = rx.recv().await {
        if out.send(Tagged { source: label, error }).await.is_err() {
            return;
        }
    }
}

/// Log every aggregated error until the channel closes. Returns the count.
pub fn spawn_error_logger(mut rx: mpsc::Receiver<Tagged>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut n = 0usize;
        while let Some(t) = rx.recv().await {
            counter!("sync_errors_total", 1u64);
            error!(source = t.source, error = %t.error, "sync error");
            n += 1;
        }
        n
    })
}
