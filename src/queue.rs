//! Background work queue capability
//!
//! Active-mode delivery is handed to a queue so the webhook can acknowledge
//! WeChat before any outbound API call is made.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A self-contained unit of outbound work
pub type BackgroundWork = BoxFuture<'static, ()>;

/// Accepts work to run later, on whatever executor backs it
pub trait BackgroundQueue: Send + Sync {
    fn submit(&self, work: BackgroundWork);
}

/// Runs each unit of work as its own tokio task
#[derive(Debug, Clone, Default)]
pub struct TokioSpawnQueue;

impl BackgroundQueue for TokioSpawnQueue {
    fn submit(&self, work: BackgroundWork) {
        tokio::spawn(work);
    }
}

/// Runs work one unit at a time on a single worker task
#[derive(Debug, Clone)]
pub struct SerialWorkQueue {
    tx: mpsc::UnboundedSender<BackgroundWork>,
}

impl SerialWorkQueue {
    /// Start the worker. It stops once every queue handle is dropped.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundWork>();

        let worker = tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                work.await;
            }
            debug!("Background worker stopped");
        });

        (Self { tx }, worker)
    }
}

impl BackgroundQueue for SerialWorkQueue {
    fn submit(&self, work: BackgroundWork) {
        if self.tx.send(work).is_err() {
            warn!("Background worker is gone, dropping queued delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_serial_queue_runs_in_order() {
        let (queue, worker) = SerialWorkQueue::start();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            queue.submit(Box::pin(async move {
                seen.lock().push(i);
            }));
        }

        drop(queue);
        worker.await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_spawn_queue_runs_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let c = counter.clone();
        TokioSpawnQueue.submit(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
