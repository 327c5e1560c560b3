//! Single-slot cancellable delayed tasks, one per debounced channel.
//!
//! Scheduling a new value aborts the pending timer and starts a fresh one, so
//! only the last value within the window is ever delivered.  The timer does
//! not carry the value: it only sends `(channel, generation)` back into the
//! core loop, and `fire` refuses generations that have been superseded.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceChannel {
    Brightness,
    ColorTemperature,
    ManualColor,
}

pub struct DebounceSlot<T> {
    pending: Option<T>,
    generation: u64,
    handle: Option<AbortHandle>,
}

impl<T> Default for DebounceSlot<T> {
    fn default() -> Self {
        Self {
            pending: None,
            generation: 0,
            handle: None,
        }
    }
}

impl<T> DebounceSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending value and restart the timer.  After `delay` the
    /// event built by `make_event(generation)` is sent to `tx`.
    pub fn schedule<E, F>(&mut self, value: T, delay: Duration, tx: &mpsc::Sender<E>, make_event: F)
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.abort_timer();
        self.generation += 1;
        self.pending = Some(value);

        let generation = self.generation;
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make_event(generation)).await;
        });
        self.handle = Some(task.abort_handle());
    }

    /// Take the pending value if `generation` is still the latest.
    pub fn fire(&mut self, generation: u64) -> Option<T> {
        if generation != self.generation {
            return None;
        }
        self.handle = None;
        self.pending.take()
    }

    /// Drop the pending value; an already-queued fire event becomes stale.
    pub fn cancel(&mut self) {
        self.abort_timer();
        self.generation += 1;
        self.pending = None;
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn abort_timer(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<T> Drop for DebounceSlot<T> {
    fn drop(&mut self) {
        self.abort_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_only_last_value_fires() {
        let (tx, mut rx) = mpsc::channel::<u64>(8);
        let mut slot = DebounceSlot::new();

        slot.schedule(10u8, Duration::from_millis(500), &tx, |g| g);
        tokio::time::sleep(Duration::from_millis(200)).await;
        slot.schedule(20u8, Duration::from_millis(500), &tx, |g| g);
        tokio::time::sleep(Duration::from_millis(200)).await;
        slot.schedule(30u8, Duration::from_millis(500), &tx, |g| g);

        let generation = rx.recv().await.unwrap();
        assert_eq!(slot.fire(generation), Some(30));
        // Earlier timers were aborted, nothing else arrives.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let (tx, mut rx) = mpsc::channel::<u64>(8);
        let mut slot = DebounceSlot::new();

        slot.schedule("a", Duration::from_millis(100), &tx, |g| g);
        let first = rx.recv().await.unwrap();
        // A newer value arrives before the first fire event is processed.
        slot.schedule("b", Duration::from_millis(100), &tx, |g| g);
        assert_eq!(slot.fire(first), None);
        assert!(slot.is_pending());

        let second = rx.recv().await.unwrap();
        assert_eq!(slot.fire(second), Some("b"));
        assert!(!slot.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_value() {
        let (tx, mut rx) = mpsc::channel::<u64>(8);
        let mut slot = DebounceSlot::new();

        slot.schedule(1u8, Duration::from_millis(500), &tx, |g| g);
        slot.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(!slot.is_pending());
    }
}
