use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::error::RegistrarError;
use crate::window::{RateLimit, WindowTracker};

/// A granted slot in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Zero-based index of the slot within its window
    pub slot: u32,
    /// Which window the slot belongs to (0 = first window)
    pub generation: u64,
    /// Time spent queued before the grant
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub capacity: u32,
    pub consumed: u32,
    pub remaining: u32,
    pub waiting: usize,
    pub generation: u64,
    pub window_resets_in: Duration,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Admission>,
}

struct Inner {
    tracker: WindowTracker,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl Inner {
    fn refresh(&mut self, now: Instant) {
        if self.tracker.refresh(now) {
            debug!(
                generation = self.tracker.generation(),
                waiting = self.queue.len(),
                "Window rolled over"
            );
        }
        self.grant_queued();
    }

    // Free slots go to queued waiters in arrival order before anyone else.
    fn grant_queued(&mut self) {
        while self.tracker.remaining() {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            let admission = Admission {
                slot: self.tracker.consumed(),
                generation: self.tracker.generation(),
                waited: Duration::ZERO,
            };
            // A closed receiver means the waiter is gone; its slot stays free.
            if waiter.tx.send(admission).is_ok() {
                self.tracker.consume();
                trace!(waiter = waiter.id, slot = admission.slot, "Granted queued waiter");
            }
        }
    }

    // Passes a granted-but-unseen slot to the next waiter. With nobody queued
    // the slot stays spent.
    fn hand_on(&mut self, mut admission: Admission) {
        if admission.generation != self.tracker.generation() {
            return;
        }
        while let Some(waiter) = self.queue.pop_front() {
            match waiter.tx.send(admission) {
                Ok(()) => {
                    trace!(waiter = waiter.id, slot = admission.slot, "Handed on unclaimed slot");
                    return;
                }
                Err(returned) => admission = returned,
            }
        }
    }

    fn admit_now(&mut self) -> Option<Admission> {
        if !self.queue.is_empty() {
            return None;
        }
        let slot = self.tracker.consume()?;
        Some(Admission {
            slot,
            generation: self.tracker.generation(),
            waited: Duration::ZERO,
        })
    }

    fn enqueue(&mut self) -> (u64, oneshot::Receiver<Admission>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(Waiter { id, tx });
        (id, rx)
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Gates callers against a fixed-window call budget.
///
/// Callers that find the window saturated are queued and resumed in arrival
/// order once the window rolls over. Slots are never refunded; the only way
/// out of a saturated window is elapsed time.
pub struct AdmissionController {
    inner: Mutex<Inner>,
}

enum Wake {
    Admitted(Admission),
    TimedOut,
    Pending,
}

impl AdmissionController {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tracker: WindowTracker::new(limit, Instant::now()),
                queue: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// Admits the caller only if a slot is free right now and nobody is queued.
    pub fn try_acquire(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        inner.refresh(Instant::now());
        inner.admit_now()
    }

    /// Waits for a slot. `None` waits indefinitely; a zero deadline never waits.
    ///
    /// Dropping the returned future while queued withdraws the caller. A slot
    /// it was granted but never saw goes to the next waiter, if any.
    pub async fn acquire(&self, deadline: Option<Duration>) -> Result<Admission, RegistrarError> {
        let started = Instant::now();
        // A deadline too far out to represent is no deadline at all
        let deadline_at = deadline.and_then(|d| started.checked_add(d));

        let registration = {
            let mut inner = self.inner.lock();
            inner.refresh(started);
            if let Some(admission) = inner.admit_now() {
                return Ok(admission);
            }
            if deadline.is_some_and(|d| d.is_zero()) {
                return Err(RegistrarError::TimedOut {
                    waited: Duration::ZERO,
                });
            }
            let (id, rx) = inner.enqueue();
            trace!(waiter = id, waiting = inner.queue.len(), "Queued for admission");
            Registration {
                controller: self,
                id,
                rx,
                settled: false,
            }
        };

        self.wait(registration, started, deadline_at).await
    }

    async fn wait(
        &self,
        mut registration: Registration<'_>,
        started: Instant,
        deadline_at: Option<Instant>,
    ) -> Result<Admission, RegistrarError> {
        loop {
            let window_end = self.inner.lock().tracker.window_end();
            let wake_at = match deadline_at {
                Some(deadline) => deadline.min(window_end),
                None => window_end,
            };

            tokio::select! {
                biased;
                admission = granted(&mut registration.rx) => {
                    registration.settled = true;
                    return Ok(Admission { waited: started.elapsed(), ..admission });
                }
                _ = sleep_until(wake_at) => {
                    match self.on_wake(&mut registration, deadline_at) {
                        Wake::Admitted(admission) => {
                            return Ok(Admission { waited: started.elapsed(), ..admission });
                        }
                        Wake::TimedOut => {
                            return Err(RegistrarError::TimedOut { waited: started.elapsed() });
                        }
                        Wake::Pending => {}
                    }
                }
            }
        }
    }

    fn on_wake(&self, registration: &mut Registration<'_>, deadline_at: Option<Instant>) -> Wake {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh(now);

        if let Ok(admission) = registration.rx.try_recv() {
            registration.settled = true;
            return Wake::Admitted(admission);
        }
        if deadline_at.is_some_and(|deadline| now >= deadline) {
            inner.remove(registration.id);
            registration.settled = true;
            return Wake::TimedOut;
        }
        Wake::Pending
    }

    /// Point-in-time view of the limiter. Does not roll the window over.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let inner = self.inner.lock();
        let capacity = inner.tracker.limit().capacity();
        LimiterSnapshot {
            capacity,
            consumed: inner.tracker.consumed(),
            remaining: inner.tracker.remaining_slots(),
            waiting: inner.queue.len(),
            generation: inner.tracker.generation(),
            window_resets_in: inner
                .tracker
                .window_end()
                .saturating_duration_since(Instant::now()),
        }
    }
}

// The sender stays queued until it sends, so a closed channel only means the
// entry was withdrawn by its owner; that never resolves here.
async fn granted(rx: &mut oneshot::Receiver<Admission>) -> Admission {
    match rx.await {
        Ok(admission) => admission,
        Err(_) => std::future::pending().await,
    }
}

// Queue entry owned by a waiting `acquire`; cleans up if the future is dropped.
struct Registration<'a> {
    controller: &'a AdmissionController,
    id: u64,
    rx: oneshot::Receiver<Admission>,
    settled: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.controller.inner.lock();
        if inner.remove(self.id) {
            return;
        }
        if let Ok(admission) = self.rx.try_recv() {
            inner.hand_on(admission);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn controller(capacity: u32, window: Duration) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(RateLimit::new(window, capacity).unwrap()))
    }

    async fn wait_for_waiters(limiter: &AdmissionController, n: usize) {
        while limiter.snapshot().waiting < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_simultaneous_calls_admit_three_and_queue_two() {
        let limiter = controller(3, Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire(None).await }));
        }
        wait_for_waiters(&limiter, 2).await;

        let snap = limiter.snapshot();
        assert_eq!(snap.consumed, 3);
        assert_eq!(snap.remaining, 0);
        assert_eq!(snap.waiting, 2);
        for h in handles.iter().take(3) {
            assert!(h.is_finished());
        }

        for h in handles {
            h.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_callers_are_served_before_newcomers_after_roll_over() {
        let limiter = controller(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_some());
        }

        let l = limiter.clone();
        let first = tokio::spawn(async move { l.acquire(None).await });
        wait_for_waiters(&limiter, 1).await;
        let l = limiter.clone();
        let second = tokio::spawn(async move { l.acquire(None).await });
        wait_for_waiters(&limiter, 2).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let newcomer = limiter.acquire(None).await.unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 1);
        assert_eq!(newcomer.generation, 1);
        assert_eq!(first.slot, 0);
        assert_eq!(second.slot, 1);
        assert_eq!(newcomer.slot, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn newcomer_cannot_jump_a_nonempty_queue() {
        let limiter = controller(1, Duration::from_secs(10));
        assert!(limiter.try_acquire().is_some());

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire(None).await });
        wait_for_waiters(&limiter, 1).await;

        // The waiter has not run since the boundary passed, but it still wins.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire().is_none());

        let admitted = waiter.await.unwrap().unwrap();
        assert_eq!(admitted.generation, 1);
        assert_eq!(admitted.slot, 0);
        assert_eq!(limiter.snapshot().consumed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_fails_fast_without_consuming() {
        let limiter = controller(1, Duration::from_secs(60));
        limiter.acquire(None).await.unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let before = Instant::now();
        let err = limiter.acquire(Some(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, RegistrarError::TimedOut { waited } if waited.is_zero()));
        assert_eq!(Instant::now(), before);

        let snap = limiter.snapshot();
        assert_eq!(snap.consumed, 1);
        assert_eq!(snap.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_leaves_no_trace() {
        let limiter = controller(1, Duration::from_secs(60));
        limiter.acquire(None).await.unwrap();

        let err = limiter
            .acquire(Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrarError::TimedOut { waited } if waited == Duration::from_secs(5)));

        let snap = limiter.snapshot();
        assert_eq!(snap.consumed, 1);
        assert_eq!(snap.waiting, 0);
        assert_eq!(snap.generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_past_the_boundary_is_admitted() {
        let limiter = controller(1, Duration::from_secs(10));
        limiter.acquire(None).await.unwrap();

        let admitted = limiter
            .acquire(Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(admitted.generation, 1);
        assert_eq!(admitted.waited, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_without_deadline_is_eventually_admitted() {
        let limiter = controller(2, Duration::from_secs(60));
        limiter.acquire(None).await.unwrap();
        limiter.acquire(None).await.unwrap();

        let admitted = limiter.acquire(None).await.unwrap();
        assert_eq!(admitted.generation, 1);
        assert_eq!(admitted.slot, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_is_removed_from_queue() {
        let limiter = controller(1, Duration::from_secs(60));
        limiter.acquire(None).await.unwrap();

        let l = limiter.clone();
        let handle = tokio::spawn(async move { l.acquire(None).await });
        wait_for_waiters(&limiter, 1).await;

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let snap = limiter.snapshot();
        assert_eq!(snap.waiting, 0);
        assert_eq!(snap.consumed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_grant_moves_to_next_waiter() {
        let limiter = controller(1, Duration::from_secs(10));
        assert!(limiter.try_acquire().is_some());

        let mut first = Box::pin(limiter.acquire(None));
        assert!(futures::poll!(&mut first).is_pending());
        let mut second = Box::pin(limiter.acquire(None));
        assert!(futures::poll!(&mut second).is_pending());

        // Rolling over grants `first`, which is dropped before it looks.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire().is_none());
        drop(first);

        let snap = limiter.snapshot();
        assert_eq!((snap.consumed, snap.remaining, snap.waiting), (1, 0, 0));

        let admitted = second.await.unwrap();
        assert_eq!((admitted.generation, admitted.slot), (1, 0));
        assert!(limiter.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_grant_with_empty_queue_stays_spent() {
        let limiter = controller(2, Duration::from_secs(10));
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        let mut waiter = Box::pin(limiter.acquire(None));
        assert!(futures::poll!(&mut waiter).is_pending());

        tokio::time::advance(Duration::from_secs(10)).await;
        let newcomer = limiter.try_acquire().unwrap();
        assert_eq!((newcomer.generation, newcomer.slot), (1, 1));
        drop(waiter);

        let snap = limiter.snapshot();
        assert_eq!((snap.consumed, snap.remaining), (2, 0));
        assert!(limiter.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_deadline_waits_like_no_deadline() {
        let limiter = controller(1, Duration::from_secs(60));
        limiter.try_acquire().unwrap();

        let admitted = limiter.acquire(Some(Duration::MAX)).await.unwrap();
        assert_eq!((admitted.generation, admitted.slot), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn longest_window_does_not_overflow() {
        let limiter = controller(1, crate::window::MAX_WINDOW);
        limiter.try_acquire().unwrap();

        assert_eq!(limiter.snapshot().window_resets_in, crate::window::MAX_WINDOW);
        let err = limiter.acquire(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, RegistrarError::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn never_admits_more_than_capacity_per_window() {
        let limiter = controller(3, Duration::from_secs(1));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire(None).await }));
        }

        let mut per_window = std::collections::HashMap::<u64, Vec<u32>>::new();
        for h in handles {
            let admission = h.await.unwrap().unwrap();
            per_window.entry(admission.generation).or_default().push(admission.slot);
        }

        assert_eq!(per_window.values().map(Vec::len).sum::<usize>(), 20);
        for slots in per_window.values_mut() {
            assert!(slots.len() <= 3);
            slots.sort_unstable();
            let expected: Vec<u32> = (0..slots.len() as u32).collect();
            assert_eq!(*slots, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_threads_respect_capacity() {
        let limiter = controller(5, Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire(Some(Duration::from_secs(5))).await }));
        }

        let mut per_window = std::collections::HashMap::<u64, u32>::new();
        for h in handles {
            let admission = h.await.unwrap().unwrap();
            *per_window.entry(admission.generation).or_default() += 1;
        }
        assert!(per_window.values().all(|&n| n <= 5));
        assert_eq!(per_window.values().sum::<u32>(), 20);
    }
}
