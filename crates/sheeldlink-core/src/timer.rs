//! Cancelable countdown timers used for protocol deadlines

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// A countdown running on its own task.
///
/// Fires its timeout callback at most once. Optionally reports the remaining
/// time at a fixed tick. Dropping the timer cancels it, so owners keep it alive
/// for as long as the deadline matters. Must be started inside a Tokio runtime.
#[derive(Debug)]
pub struct TimeoutTimer {
    handle: JoinHandle<()>,
    reset: Arc<Notify>,
    timeout: Duration,
}

impl TimeoutTimer {
    /// Start a countdown that calls `on_timeout` once `timeout` elapses
    pub fn start<F>(timeout: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(timeout, None, |_| {}, on_timeout)
    }

    /// Start a countdown that also calls `on_tick` with the remaining time every `tick`
    pub fn start_with_ticks<T, F>(timeout: Duration, tick: Duration, on_tick: T, on_timeout: F) -> Self
    where
        T: FnMut(Duration) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(timeout, Some(tick), on_tick, on_timeout)
    }

    fn spawn<T, F>(timeout: Duration, tick: Option<Duration>, mut on_tick: T, on_timeout: F) -> Self
    where
        T: FnMut(Duration) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let reset = Arc::new(Notify::new());
        let notified = reset.clone();
        let started = Instant::now();
        let mut ticker = tick.filter(|t| !t.is_zero()).map(|t| {
            let mut interval = interval_at(started + t, t);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let handle = tokio::spawn(async move {
            let mut deadline = started + timeout;
            let mut on_timeout = Some(on_timeout);
            loop {
                tokio::select! {
                    biased;
                    _ = notified.notified() => {
                        deadline = Instant::now() + timeout;
                        if let Some(interval) = ticker.as_mut() {
                            interval.reset();
                        }
                    }
                    _ = sleep_until(deadline) => {
                        if let Some(callback) = on_timeout.take() {
                            callback();
                        }
                        return;
                    }
                    _ = next_tick(&mut ticker) => {
                        on_tick(deadline.saturating_duration_since(Instant::now()));
                    }
                }
            }
        });

        Self {
            handle,
            reset,
            timeout,
        }
    }

    /// Restart the countdown from the full timeout. No effect once fired or stopped.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Cancel the countdown without firing
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Whether the countdown is still running
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// The configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        (count, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (count, callback) = counter();
        let timer = TimeoutTimer::start(Duration::from_millis(100), callback);

        sleep(Duration::from_millis(90)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_alive());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let (count, callback) = counter();
        let timer = TimeoutTimer::start(Duration::from_millis(100), callback);
        sleep(Duration::from_millis(50)).await;
        timer.stop();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (count, callback) = counter();
        drop(TimeoutTimer::start(Duration::from_millis(100), callback));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_countdown() {
        let (count, callback) = counter();
        let timer = TimeoutTimer::start(Duration::from_millis(100), callback);

        sleep(Duration::from_millis(80)).await;
        timer.reset();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_report_remaining_time() {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let recorded = ticks.clone();
        let (count, callback) = counter();
        let _timer = TimeoutTimer::start_with_ticks(
            Duration::from_millis(100),
            Duration::from_millis(30),
            move |remaining| recorded.lock().unwrap().push(remaining.as_millis()),
            callback,
        );

        sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*ticks.lock().unwrap(), vec![70, 40, 10]);
    }
}
