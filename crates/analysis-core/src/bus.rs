//! In-process wake-up bus from the scheduler to SSE fan-out (§4.4, §5
//! backplane). Narrowed from the teacher's generic type-erased `EventBus`
//! (`tokio::sync::broadcast` over `Any` payloads) to carry only a job id —
//! the database remains the source of truth; this only collapses polling
//! latency for co-located workers.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: a lagging subscriber may miss a ping.
//! - **Absence is correct**: nothing here is required for correctness,
//!   only latency (§5). A subscriber that misses a ping simply falls back
//!   to its next poll interval.

use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 4096;

/// Broadcasts "job `id` has new events" pings. Subscribers re-read the
/// event log themselves; the ping carries no payload beyond the job id.
#[derive(Clone)]
pub struct WakeBus {
    sender: broadcast::Sender<Uuid>,
}

impl WakeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        WakeBus { sender }
    }

    /// Signals that `job_id` has new events to tail. Silently drops the
    /// ping if there are no subscribers — that is the expected steady
    /// state when no client is connected.
    pub fn wake(&self, job_id: Uuid) {
        let _ = self.sender.send(job_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Uuid> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WakeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_wake_for_its_job() {
        let bus = WakeBus::new();
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        bus.wake(job_id);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, job_id);
    }

    #[test]
    fn wake_without_subscribers_does_not_panic() {
        let bus = WakeBus::new();
        bus.wake(Uuid::new_v4());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
