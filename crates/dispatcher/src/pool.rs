//! Symmetric worker pool with graceful drain.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::worker::{DispatcherContext, Worker};

/// Spawns N stateless workers over one shared context. Shutdown stops
/// dequeuing and waits up to the drain timeout for in-flight commands;
/// anything still running is abandoned to queue redelivery.
pub struct WorkerPool {
    ctx: DispatcherContext,
    node_id: String,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(node_id: impl Into<String>, ctx: DispatcherContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            ctx,
            node_id: node_id.into(),
            handles: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn `count` workers.
    pub fn start(&mut self, count: usize) {
        for i in 0..count {
            let worker = Worker::new(format!("{}-w{}", self.node_id, i), self.ctx.clone());
            let shutdown = self.shutdown_rx.clone();
            self.handles.push(tokio::spawn(worker.run(shutdown)));
        }
        info!(workers = count, node_id = %self.node_id, "Dispatcher pool started");
    }

    /// Signal shutdown and drain. Returns the number of workers that did
    /// not finish inside the drain window.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(true);

        let drain = self.ctx.settings.drain_timeout;
        let mut abandoned = 0usize;
        for handle in self.handles {
            match tokio::time::timeout(drain, handle).await {
                Ok(_) => {}
                Err(_) => {
                    abandoned += 1;
                }
            }
        }
        if abandoned > 0 {
            warn!(
                abandoned,
                "Workers did not drain in time; their commands will be redelivered"
            );
        } else {
            info!("Dispatcher pool drained cleanly");
        }
        abandoned
    }
}
