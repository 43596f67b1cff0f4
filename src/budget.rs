//! Pause-aware execution budget.
//!
//! A budget owns the per-execution event queue and enforces the caller's
//! deadline while reading from it. The clock pauses when an approval request
//! is handed to the caller and resumes when the caller decides, so time
//! spent waiting on a human does not count against the execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// The budget's deadline elapsed; carries the original total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Timed out after {}s", .0.as_secs_f64())]
pub struct BudgetExceeded(pub Duration);

#[derive(Debug)]
struct ClockState {
    total: Option<Duration>,
    consumed: Duration,
    running_since: Option<Instant>,
    paused: bool,
}

/// The shared pause/resume clock of one budget.
///
/// Shared between the budget (which reads the deadline) and the approval
/// responders (which resume it on decision).
#[derive(Debug)]
pub struct BudgetClock {
    state: Mutex<ClockState>,
    resumed: Notify,
}

impl BudgetClock {
    fn new(total: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                total,
                consumed: Duration::ZERO,
                running_since: Some(Instant::now()),
                paused: false,
            }),
            resumed: Notify::new(),
        }
    }

    /// Stop the deadline clock. Idempotent; a no-op without a deadline.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            if let Some(since) = state.running_since.take() {
                state.consumed += since.elapsed();
            }
            state.paused = true;
        }
    }

    /// Resume the deadline clock after a decision. Idempotent.
    pub fn on_decision(&self) {
        {
            let mut state = self.state.lock();
            if state.paused {
                state.paused = false;
                state.running_since = Some(Instant::now());
            }
        }
        self.resumed.notify_one();
    }

    /// Remaining time, or `None` when the budget has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock();
        let total = state.total?;
        let consumed = state.consumed
            + state
                .running_since
                .map(|since| since.elapsed())
                .unwrap_or_default();
        Some(total.saturating_sub(consumed))
    }

    fn snapshot(&self) -> (bool, Option<Duration>) {
        let paused = self.state.lock().paused;
        (paused, self.remaining())
    }

    fn total(&self) -> Option<Duration> {
        self.state.lock().total
    }
}

/// The per-execution event queue guarded by a pause-aware deadline.
pub struct Budget<T> {
    clock: Arc<BudgetClock>,
    queue: mpsc::UnboundedReceiver<T>,
}

impl<T> Budget<T> {
    pub fn new(total: Option<Duration>, queue: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            clock: Arc::new(BudgetClock::new(total)),
            queue,
        }
    }

    pub fn clock(&self) -> Arc<BudgetClock> {
        Arc::clone(&self.clock)
    }

    /// Await the next queue item under the current deadline.
    ///
    /// Returns `Ok(None)` when the queue closed. While the clock is paused
    /// the wait has no deadline; a resume re-arms it with the time consumed
    /// so far carried over.
    pub async fn next_item(&mut self) -> Result<Option<T>, BudgetExceeded> {
        loop {
            let (paused, remaining) = self.clock.snapshot();

            match (paused, remaining) {
                (true, _) | (false, None) => {
                    tokio::select! {
                        item = self.queue.recv() => return Ok(item),
                        () = self.clock.resumed.notified(), if paused => continue,
                    }
                }
                (false, Some(remaining)) => {
                    if remaining.is_zero() {
                        return Err(self.exceeded());
                    }
                    match tokio::time::timeout(remaining, self.queue.recv()).await {
                        Ok(item) => return Ok(item),
                        Err(_) => {
                            // A pause may have landed as the deadline hit.
                            let (paused, remaining) = self.clock.snapshot();
                            if paused || remaining.is_some_and(|r| !r.is_zero()) {
                                continue;
                            }
                            return Err(self.exceeded());
                        }
                    }
                }
            }
        }
    }

    fn exceeded(&self) -> BudgetExceeded {
        BudgetExceeded(self.clock.total().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(total: Option<f64>) -> (mpsc::UnboundedSender<&'static str>, Budget<&'static str>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Budget::new(total.map(Duration::from_secs_f64), rx))
    }

    #[tokio::test]
    async fn test_pause_excludes_elapsed_time() {
        let (tx, mut budget) = budget(Some(0.2));
        let clock = budget.clock();
        clock.pause();

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            clock.on_decision();
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send("ok").unwrap();
        });

        let item = tokio::time::timeout(Duration::from_secs(1), budget.next_item())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Some("ok"));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_before_wait() {
        let (tx, mut budget) = budget(Some(0.5));
        let clock = budget.clock();
        clock.pause();
        clock.on_decision();
        tx.send("ready").unwrap();

        assert_eq!(budget.next_item().await.unwrap(), Some("ready"));
    }

    #[tokio::test]
    async fn test_item_delivered_while_paused() {
        let (tx, mut budget) = budget(Some(0.5));
        budget.clock().pause();
        tx.send("queued").unwrap();

        assert_eq!(budget.next_item().await.unwrap(), Some("queued"));
    }

    #[tokio::test]
    async fn test_double_resume_is_idempotent() {
        let (tx, mut budget) = budget(Some(0.3));
        let clock = budget.clock();
        clock.pause();
        clock.on_decision();
        clock.on_decision();
        tx.send("ok").unwrap();

        assert_eq!(budget.next_item().await.unwrap(), Some("ok"));
    }

    #[tokio::test]
    async fn test_double_pause_is_idempotent() {
        let (tx, mut budget) = budget(Some(0.3));
        let clock = budget.clock();
        clock.pause();
        clock.pause();
        clock.on_decision();
        tx.send("ok").unwrap();

        assert_eq!(budget.next_item().await.unwrap(), Some("ok"));
    }

    #[tokio::test]
    async fn test_no_deadline_passthrough() {
        let (tx, mut budget) = budget(None);
        let clock = budget.clock();
        clock.pause();
        clock.on_decision();
        tx.send("ok").unwrap();

        assert_eq!(budget.next_item().await.unwrap(), Some("ok"));
        assert_eq!(clock.remaining(), None);
    }

    #[tokio::test]
    async fn test_timeout_carries_total() {
        let (_tx, mut budget) = budget(Some(0.05));
        let err = budget.next_item().await.unwrap_err();
        assert_eq!(err, BudgetExceeded(Duration::from_millis(50)));
        assert!(err.to_string().contains("0.05s"));
    }

    #[tokio::test]
    async fn test_closed_queue_yields_none() {
        let (tx, mut budget) = budget(Some(1.0));
        drop(tx);
        assert_eq!(budget.next_item().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remaining_decreases_only_while_running() {
        let (_tx, budget) = budget(Some(10.0));
        let clock = budget.clock();

        clock.pause();
        let at_pause = clock.remaining().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let still_paused = clock.remaining().unwrap();
        // Paused time does not count.
        assert!(at_pause.saturating_sub(still_paused) < Duration::from_millis(20));

        clock.on_decision();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(still_paused - clock.remaining().unwrap() >= Duration::from_millis(40));
    }
}
