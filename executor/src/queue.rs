use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Task = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Single-worker FIFO executor with a minimum inter-task gap (`spec.md` §4.2
/// Trade Queue).
///
/// Concurrency is always 1: only the worker loop mutates trade state while
/// draining a task, so every execute task for a given trade runs to
/// completion before the next dequeued task starts (`spec.md` §5
/// "Scheduling model"). A queued task's own error handling is its
/// responsibility — a panicking or failing task never aborts the worker
/// loop.
#[derive(Clone)]
pub struct TradeQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl TradeQueue {
    /// Spawn the worker loop honouring `min_gap` between dispatches
    /// (`TRADE_QUEUE_MIN_GAP`, 250ms per `spec.md` §4.2) and return a handle
    /// plus its `JoinHandle` (owned by the caller for graceful shutdown).
    pub fn spawn(min_gap: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let handle = tokio::spawn(async move {
            let mut last_dispatch: Option<Instant> = None;
            while let Some(task) = rx.recv().await {
                if let Some(last) = last_dispatch {
                    let elapsed = last.elapsed();
                    if elapsed < min_gap {
                        tokio::time::sleep(min_gap - elapsed).await;
                    }
                }
                task().await;
                last_dispatch = Some(Instant::now());
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueue `task`. Ordering against prior calls is strict FIFO; this
    /// never blocks the caller (`spec.md` §5 "Ordering guarantees").
    pub fn enqueue<F, Fut>(&self, task: F) -> Result<(), TradeQueueClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: Task = Box::new(move || Box::pin(task()));
        self.tx.send(boxed).map_err(|_| TradeQueueClosed)
    }
}

/// The queue's worker loop has shut down; callers treat this as fatal for
/// whatever enqueue they were attempting (`spec.md` §7 does not define a
/// retry for this — enqueue failures only happen post-shutdown).
#[derive(Debug, Copy, Clone, thiserror::Error)]
#[error("trade queue worker has shut down")]
pub struct TradeQueueClosed;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn tasks_run_in_fifo_order() {
        let (queue, _handle) = TradeQueue::spawn(Duration::from_millis(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5u32 {
            let order = order.clone();
            queue.enqueue(move || async move { order.lock().push(i) }).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_gap_is_honoured_between_dispatches() {
        let (queue, _handle) = TradeQueue::spawn(Duration::from_millis(250));
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        for _ in 0..3 {
            let timestamps = timestamps.clone();
            queue
                .enqueue(move || async move { timestamps.lock().push(Instant::now()) })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(700)).await;
        let recorded = timestamps.lock();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[1].duration_since(recorded[0]) >= Duration::from_millis(250));
        assert!(recorded[2].duration_since(start) >= Duration::from_millis(500));
    }
}
