//! Small shared utilities

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Sleep slice used by worker loops between running-flag checks.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Sleep for `total`, waking early when `running` flips false.
///
/// Returns whether the loop should keep running. Worker loops use this so
/// `stop()` returns promptly instead of waiting out a full interval.
pub fn interruptible_sleep(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return running.load(Ordering::Acquire);
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sleeps_full_interval_while_running() {
        let running = AtomicBool::new(true);
        let started = Instant::now();
        assert!(interruptible_sleep(&running, Duration::from_millis(120)));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_wakes_early_on_stop() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let keep_going = interruptible_sleep(&flag, Duration::from_secs(30));
            (keep_going, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(80));
        running.store(false, Ordering::Release);
        let (keep_going, elapsed) = handle.join().unwrap();
        assert!(!keep_going);
        assert!(elapsed < Duration::from_secs(1));
    }
}
