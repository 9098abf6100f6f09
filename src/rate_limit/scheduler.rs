//! Centralized refill scheduling.
//!
//! One worker task drains a min-heap of next-refill deadlines instead of
//! running one timer per client. Each key carries a generation number;
//! rescheduling a key bumps it, so heap entries left over from the previous
//! schedule are discarded when popped. At most one live schedule per key.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::lifecycle::ShutdownSignal;
use crate::rate_limit::store::BucketStore;

/// Worker sleep when nothing is scheduled; new schedules wake it early.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Stand-in deadline for periods too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + period`, saturating at [`FAR_FUTURE`] instead of overflowing.
fn deadline(from: Instant, period: Duration) -> Instant {
    from.checked_add(period)
        .unwrap_or_else(|| from + FAR_FUTURE)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    generation: u64,
    period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: Instant,
    generation: u64,
    key: String,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    queue: BinaryHeap<Reverse<Due>>,
    next_generation: u64,
    stopped: bool,
}

#[derive(Debug, Default)]
pub struct RefillScheduler {
    state: Mutex<State>,
    wake: Notify,
}

impl RefillScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) refills for `key`, first one `period` from now.
    /// Any previous schedule for the key is discarded.
    pub fn schedule(&self, key: &str, period: Duration) {
        let mut state = self.lock();
        if state.stopped {
            tracing::debug!(client = %key, "Refill scheduler stopped, ignoring schedule");
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .entries
            .insert(key.to_string(), Entry { generation, period });
        state.queue.push(Reverse(Due {
            at: deadline(Instant::now(), period),
            generation,
            key: key.to_string(),
        }));
        drop(state);

        self.wake.notify_one();
    }

    pub fn cancel(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Refill period currently in force for `key`.
    pub fn period(&self, key: &str) -> Option<Duration> {
        self.lock().entries.get(key).map(|e| e.period)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every schedule and stop the worker.
    pub fn stop_all(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.entries.clear();
        state.queue.clear();
        drop(state);

        self.wake.notify_one();
        tracing::info!("All refill schedules stopped");
    }

    /// Pop every live entry due at `now`; returns them with the next pending deadline.
    fn take_due(&self, now: Instant) -> (Vec<Due>, Option<Instant>) {
        let mut state = self.lock();
        let mut due = Vec::new();

        while let Some(Reverse(head)) = state.queue.peek() {
            let live = state
                .entries
                .get(&head.key)
                .is_some_and(|e| e.generation == head.generation);
            if live && head.at > now {
                break;
            }
            let Some(Reverse(head)) = state.queue.pop() else {
                break;
            };
            if live {
                due.push(head);
            }
        }

        let next = state.queue.peek().map(|Reverse(d)| d.at);
        (due, next)
    }

    /// Queue the following refill for a processed entry, unless it was
    /// rescheduled or cancelled while the refill ran.
    fn requeue(&self, done: Due, period: Duration, now: Instant) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&done.key) else {
            return;
        };
        if entry.generation != done.generation {
            return;
        }
        entry.period = period;

        let mut at = deadline(done.at, period);
        if at <= now {
            at = deadline(now, period);
        }
        state.queue.push(Reverse(Due {
            at,
            generation: done.generation,
            key: done.key,
        }));
    }

    fn forget(&self, done: &Due) {
        let mut state = self.lock();
        if state
            .entries
            .get(&done.key)
            .is_some_and(|e| e.generation == done.generation)
        {
            state.entries.remove(&done.key);
        }
    }

    fn stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Worker loop: refill due buckets until stopped or shut down.
    pub async fn run(self: Arc<Self>, store: Arc<dyn BucketStore>, mut shutdown: ShutdownSignal) {
        tracing::info!("Refill scheduler starting");

        loop {
            if self.stopped() {
                break;
            }

            let now = Instant::now();
            let (due, next) = self.take_due(now);

            if !due.is_empty() {
                let results = join_all(due.iter().map(|d| store.refill(&d.key))).await;
                let now = Instant::now();
                for (done, result) in due.into_iter().zip(results) {
                    match result {
                        Ok(Some(bucket)) => {
                            tracing::debug!(
                                client = %done.key,
                                current = bucket.current,
                                max = bucket.max_tokens,
                                "Added a token"
                            );
                            self.requeue(done, bucket.refill_period(), now);
                        }
                        Ok(None) => {
                            tracing::warn!(client = %done.key, "Bucket disappeared, dropping refill schedule");
                            self.forget(&done);
                        }
                        Err(e) => {
                            tracing::error!(client = %done.key, error = %e, "Failed to add a token");
                            let period = self.period(&done.key).unwrap_or(Duration::from_secs(1));
                            self.requeue(done, period, now);
                        }
                    }
                }
                continue;
            }

            let wait_until = next.unwrap_or_else(|| deadline(now, IDLE_WAIT));
            tokio::select! {
                _ = time::sleep_until(wait_until) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => {
                    self.stop_all();
                    break;
                }
            }
        }

        tracing::info!("Refill scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::rate_limit::bucket::Bucket;
    use crate::rate_limit::store::MemoryStore;

    async fn store_with(key: &str, bucket: Bucket) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(key, bucket).await.unwrap();
        store
    }

    fn empty(rate: u64, max: i64) -> Bucket {
        Bucket {
            rate,
            max_tokens: max,
            current: 0,
        }
    }

    #[test]
    fn rescheduling_keeps_one_entry_per_key() {
        let scheduler = RefillScheduler::new();
        scheduler.schedule("a", Duration::from_secs(1));
        scheduler.schedule("a", Duration::from_secs(5));
        scheduler.schedule("b", Duration::from_secs(2));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.period("a"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn oversized_periods_do_not_overflow() {
        let scheduler = RefillScheduler::new();
        scheduler.schedule("huge", Duration::MAX);
        scheduler.schedule("secs", Duration::from_secs(i64::MAX as u64));
        assert_eq!(scheduler.period("huge"), Some(Duration::MAX));
        assert_eq!(scheduler.len(), 2);

        let now = Instant::now();
        assert!(deadline(now, Duration::MAX) >= now);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_period_leaves_other_keys_refilling() {
        let store = store_with("k", empty(1, 10)).await;
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("slow", Duration::MAX);
        scheduler.schedule("k", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        tokio::spawn(scheduler.clone().run(store.clone(), shutdown.subscribe()));

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 2);
        assert!(scheduler.is_scheduled("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_once_per_period() {
        let store = store_with("k", empty(1, 10)).await;
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("k", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        tokio::spawn(scheduler.clone().run(store.clone(), rx));

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let store = store_with("k", empty(1, 2)).await;
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("k", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        tokio::spawn(scheduler.clone().run(store.clone(), rx));

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_old_timing() {
        let store = store_with("k", empty(1, 100)).await;
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("k", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        tokio::spawn(scheduler.clone().run(store.clone(), rx));

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 1);

        // Slow down to one token every 4s; the 1s timer must not keep firing.
        store
            .update("k", crate::rate_limit::bucket::BucketSettings::rate(4))
            .await
            .unwrap();
        scheduler.schedule("k", Duration::from_secs(4));

        time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 1);
        time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_worker_and_clears_registry() {
        let store = store_with("k", empty(1, 10)).await;
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("k", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        let worker = tokio::spawn(scheduler.clone().run(store.clone(), rx));

        shutdown.trigger();
        worker.await.unwrap();
        assert!(scheduler.is_empty());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_bucket_is_forgotten() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RefillScheduler::new());
        scheduler.schedule("ghost", Duration::from_secs(1));

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        tokio::spawn(scheduler.clone().run(store, rx));

        time::sleep(Duration::from_millis(1500)).await;
        assert!(!scheduler.is_scheduled("ghost"));
    }
}
