//! The query-log side-channel: a grid of bounded queues carrying one
//! [`QueryInfo`] per accepted query towards the Redis backends.
//!
//! The grid is two-dimensional. [`crate::hash::backend_hash`] picks the
//! backend shard a name is stored on, [`crate::hash::channel_hash`] picks
//! the worker within that shard. A name therefore always lands on the same
//! cell, so its writes stay ordered and coalesce onto the same connections.
//!
//! Producers never block and never retry: a full cell drops the record and
//! counts it. Losing log records under pressure is fine, delaying DNS
//! answers is not.

use crate::hash::{backend_hash, channel_hash};
use crate::pool::BackendPool;
use crate::stats::Counters;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How many records a cell buffers before producers start dropping.
pub const CELL_CAPACITY: usize = 10;

/// One queried name and who asked for it. Created by the query handler,
/// consumed exactly once by the worker owning the cell it hashes to.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryInfo {
    /// The queried name, lowercased, without the trailing dot.
    pub name: String,

    /// The client the query came from.
    pub client: SocketAddr,
}

/// Maps a name onto its `(backend, channel)` cell. A pure function of the
/// name and the grid geometry.
pub fn route(name: &str, backends: usize, channels: usize) -> (usize, usize) {
    let b = backend_hash(name.as_bytes()) as usize % backends;
    let c = channel_hash(name.as_bytes()) as usize % channels;

    (b, c)
}

/// The producer half of the grid, shared by all query handlers.
pub struct QueryLog {
    senders: Vec<Vec<mpsc::Sender<QueryInfo>>>,
    counters: Arc<Counters>,
}

impl QueryLog {
    /// Builds a `backends x channels` grid. Returns the producer half and
    /// the per-cell receivers, to be handed to one worker each.
    pub fn new(
        backends: usize,
        channels: usize,
        counters: Arc<Counters>,
    ) -> (QueryLog, Vec<Vec<mpsc::Receiver<QueryInfo>>>) {
        let mut senders = Vec::with_capacity(backends);
        let mut receivers = Vec::with_capacity(backends);

        for _ in 0..backends {
            let mut tx_row = Vec::with_capacity(channels);
            let mut rx_row = Vec::with_capacity(channels);

            for _ in 0..channels {
                let (tx, rx) = mpsc::channel(CELL_CAPACITY);
                tx_row.push(tx);
                rx_row.push(rx);
            }

            senders.push(tx_row);
            receivers.push(rx_row);
        }

        (QueryLog { senders, counters }, receivers)
    }

    /// Routes and enqueues one query record without blocking. A full cell
    /// drops the record, bumps the failed counter and returns false.
    pub fn enqueue(&self, name: String, client: SocketAddr) -> bool {
        let (b, c) = route(&name, self.senders.len(), self.senders[0].len());

        match self.senders[b][c].try_send(QueryInfo { name, client }) {
            Ok(()) => true,
            Err(err) => {
                let q = err.into_inner();
                self.counters.incr_failed();
                warn!("query log cell [{}][{}] full, dropping {}", b, c, q.name);
                false
            }
        }
    }
}

/// One consumer task, pinned to cell `(backend, channel)` for the life of
/// the process. Backend failures are logged and skipped; the worker itself
/// never exits while its cell is open.
pub async fn run_worker(
    backend: usize,
    channel: usize,
    mut rx: mpsc::Receiver<QueryInfo>,
    pool: Arc<BackendPool>,
    expires_in: u64,
) {
    while let Some(q) = rx.recv().await {
        let client_ip = q.client.ip().to_string();

        debug!("query {} from {}", q.name, client_ip);

        if let Err(err) = pool.setex(&q.name, expires_in, &client_ip).await {
            warn!(
                "worker [{}][{}] setex {} as {} on {} raise err: {}",
                backend,
                channel,
                q.name,
                client_ip,
                pool.addr(),
                err
            );
        }
    }
}
