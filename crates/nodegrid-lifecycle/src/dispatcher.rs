//! NodeEventDispatcher — per-node serialized event processing.
//!
//! Events are sharded over a fixed set of tokio worker tasks by a hash of
//! the node id, so events for one node are handled one at a time and in
//! submission order while different nodes proceed concurrently. Each job
//! gets a fresh [`EventUnit`], runs against the cluster context, and is
//! committed before the submitter is answered.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use nodegrid_state::{HeartbeatResponse, StateStore, UpdatedContainerInfo};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::context::ClusterContext;
use crate::error::{LifecycleError, LifecycleResult};
use crate::event::NodeEvent;
use crate::event_unit::EventUnit;
use crate::node::{Node, Transitioned};

const SHARD_QUEUE_DEPTH: usize = 1024;

type Job = Box<dyn FnOnce(&ClusterContext, &StateStore) + Send>;

pub struct NodeEventDispatcher {
    ctx: Arc<ClusterContext>,
    shards: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl NodeEventDispatcher {
    /// Spawn `workers` shard tasks (at least one).
    pub fn start(ctx: Arc<ClusterContext>, store: StateStore, workers: usize) -> Self {
        let workers = workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(
                shard,
                Arc::clone(&ctx),
                store.clone(),
                rx,
            )));
        }
        info!(workers, "node event dispatcher started");
        Self {
            ctx,
            shards,
            workers: handles,
        }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    /// Handle `event` for an active node and commit its unit.
    ///
    /// Invalid transitions come back as `LifecycleError::InvalidTransition`
    /// and must not be retried. On a storage failure the node is rolled
    /// back and nothing reaches the registries or the scheduler, so the
    /// same event may be submitted again.
    pub async fn submit(&self, node_id: &str, event: NodeEvent) -> LifecycleResult<Transitioned> {
        let key = node_id.to_string();
        self.run(node_id, move |ctx, unit| ctx.dispatch(&key, event, unit))
            .await
    }

    /// Register a node (start or reconnect) and commit its unit.
    pub async fn register(&self, node: Node) -> LifecycleResult<Transitioned> {
        let node = Arc::new(node);
        let key = node.key().to_string();
        self.run(&key, move |ctx, unit| Ok(ctx.register_node(node, unit)?))
            .await
    }

    /// Drain a node's queued update batches; the drain commits before return.
    pub async fn pull_updates(&self, node_id: &str) -> LifecycleResult<Vec<UpdatedContainerInfo>> {
        let key = node_id.to_string();
        self.run(node_id, move |ctx, unit| {
            let node = ctx
                .node(&key)
                .ok_or_else(|| LifecycleError::UnknownNode(key.clone()))?;
            Ok(node.pull_updates(unit))
        })
        .await
    }

    /// Fill `response` with the node's pending cleanup and commit the removal.
    pub async fn cleanup_response(
        &self,
        node_id: &str,
        mut response: HeartbeatResponse,
    ) -> LifecycleResult<HeartbeatResponse> {
        let key = node_id.to_string();
        self.run(node_id, move |ctx, unit| {
            let node = ctx
                .node(&key)
                .ok_or_else(|| LifecycleError::UnknownNode(key.clone()))?;
            node.update_heartbeat_response_for_cleanup(ctx, &mut response, unit);
            Ok(response)
        })
        .await
    }

    /// Stop accepting work and wait for queued jobs to finish.
    pub async fn shutdown(self) {
        drop(self.shards);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatcher worker panicked");
            }
        }
        info!("node event dispatcher stopped");
    }

    async fn run<T, F>(&self, node_id: &str, f: F) -> LifecycleResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ClusterContext, &mut EventUnit) -> LifecycleResult<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let key = node_id.to_string();
        let job: Job = Box::new(move |ctx, store| {
            let mut unit = EventUnit::new();
            let result = f(ctx, &mut unit).and_then(|value| {
                unit.commit(ctx, store)?;
                Ok(value)
            });
            if let Err(e) = &result {
                match e {
                    LifecycleError::InvalidTransition(_) => {}
                    other => error!(node_id = %key, error = %other, "node event failed"),
                }
            }
            let _ = reply_tx.send(result);
        });
        self.shards[self.shard_for(node_id)]
            .send(job)
            .await
            .map_err(|_| LifecycleError::DispatcherClosed)?;
        reply_rx.await.map_err(|_| LifecycleError::DispatcherClosed)?
    }

    fn shard_for(&self, node_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        node_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

async fn run_shard(
    shard: usize,
    ctx: Arc<ClusterContext>,
    store: StateStore,
    mut rx: mpsc::Receiver<Job>,
) {
    debug!(shard, "dispatcher shard started");
    while let Some(job) = rx.recv().await {
        job(&ctx, &store);
    }
    debug!(shard, "dispatcher shard stopped");
}
