use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::queue::ExecutionQueue;

/// Drains the execution queue one task at a time until shutdown.
pub async fn worker(
    id: usize,
    queue: Arc<ExecutionQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            task = queue.pop() => {
                // Started tasks always run to completion or timeout.
                queue.run_task(id, task).await;
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// One worker per concurrency slot.
pub fn spawn_workers(
    queue: Arc<ExecutionQueue>,
    token: CancellationToken,
) -> JoinSet<anyhow::Result<()>> {
    let mut workers = JoinSet::new();
    for i in 1..=queue.max_concurrent() {
        workers.spawn(worker(i, queue.clone(), token.clone()));
    }
    workers
}
