//! Broadcast and ping worker pools. Both pull shard indices off a shared flume queue,
//! snapshot the shard under its read lock and work on the copy.

use std::sync::Arc;
use tracing::{debug, trace};

use super::{Scope, Shared};
use crate::models::Payload;

#[derive(Debug, Clone)]
pub(crate) struct BroadcastJob {
    pub(crate) shard: usize,
    pub(crate) payload: Payload,
}

pub(crate) async fn broadcast_worker(
    worker: usize,
    shared: Arc<Shared>,
    jobs: flume::Receiver<BroadcastJob>,
) {
    loop {
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        let conns = shared.registry.shards().snapshot(job.shard);
        trace!(worker, shard = job.shard, recipients = conns.len(), "broadcast job");
        for conn in &conns {
            shared.deliver(conn, job.payload.clone(), Scope::Broadcast).await;
        }
    }
    debug!(worker, "broadcast worker stopped");
}

pub(crate) async fn ping_worker(worker: usize, shared: Arc<Shared>, shards: flume::Receiver<usize>) {
    loop {
        let shard = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            shard = shards.recv_async() => match shard {
                Ok(shard) => shard,
                Err(_) => break,
            },
        };
        let conns = shared.registry.shards().snapshot(shard);
        let mut skipped = 0usize;
        for conn in &conns {
            if !conn.probe() {
                skipped += 1;
            }
        }
        trace!(worker, shard, probed = conns.len() - skipped, skipped, "ping sweep");
    }
    debug!(worker, "ping worker stopped");
}
