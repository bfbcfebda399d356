//! The [`BackgroundRefreshPool`] (§4.9): a small bounded-queue worker pool
//! that re-runs cached-but-stale subjects off the critical path, writing
//! only to the cache. Same "dumb poller, policy lives outside" split the
//! teacher documents in `job.rs`'s module doc comment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::job::RequestOptions;
use crate::source::Source;

/// One queued refresh: re-run the pipeline for this subject and write the
/// result to the cache only — no job is created, no client-visible events
/// are emitted (§4.9).
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub source: Source,
    pub subject_key: String,
    pub options: RequestOptions,
}

/// Accepts refresh requests from the [`crate::cache_controller::CacheController`].
/// Implemented by [`BackgroundRefreshPool`]; split out as a trait so the
/// controller does not need to depend on the pool's concrete type.
pub trait RefreshSink: Send + Sync {
    fn enqueue(&self, request: RefreshRequest);
}

/// Runs one refresh request to completion, writing to the cache. Supplied
/// by the binary wiring the pool together with a scheduler/cache instance;
/// kept as a trait so `analysis-core` does not depend on a concrete
/// pipeline driver.
#[async_trait]
pub trait RefreshRunner: Send + Sync {
    async fn run(&self, request: RefreshRequest);
}

/// A small fixed worker pool draining a bounded `mpsc` queue of refresh
/// requests (§4.9, default 2 workers). When the queue is full, new
/// requests are dropped rather than grown without bound — refreshes are
/// best-effort cache warming, not a correctness requirement.
pub struct BackgroundRefreshPool {
    sender: mpsc::Sender<RefreshRequest>,
}

impl BackgroundRefreshPool {
    /// Spawns `workers` tasks draining the shared queue via `runner`.
    pub fn spawn(workers: usize, queue_capacity: usize, runner: Arc<dyn RefreshRunner>) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_id in 0..workers {
            let receiver = receiver.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    match request {
                        Some(request) => {
                            info!(worker_id, subject_key = %request.subject_key, "running background refresh");
                            runner.run(request).await;
                        }
                        None => break,
                    }
                }
            });
        }

        BackgroundRefreshPool { sender }
    }
}

impl RefreshSink for BackgroundRefreshPool {
    fn enqueue(&self, request: RefreshRequest) {
        if let Err(err) = self.sender.try_send(request) {
            warn!(%err, "background refresh queue full, dropping request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RefreshRunner for CountingRunner {
        async fn run(&self, _request: RefreshRequest) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn enqueued_refresh_is_drained_by_a_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(CountingRunner { count: count.clone() });
        let pool = BackgroundRefreshPool::spawn(2, 8, runner);

        pool.enqueue(RefreshRequest {
            source: Source::Scholar,
            subject_key: "id:ABCDEF".to_string(),
            options: RequestOptions::default(),
        });

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
