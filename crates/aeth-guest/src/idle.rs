use std::sync::Mutex;
use std::time::{Duration, Instant};

use aeth_core::config::{DEFAULT_IDLE_TIMEOUT, IDLE_WATCHER_INTERVAL};
use tracing::info;

/// Tracks the last time a command was accepted, guarded by its own mutex
/// (§4.2, §5). Read by the idle-shutdown watcher, written on every accepted
/// command.
pub struct ActivityClock {
    last_activity: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self { last_activity: Mutex::new(Instant::now()) }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity clock mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity clock mutex poisoned").elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `clock` every [`IDLE_WATCHER_INTERVAL`] and invoke `poweroff` once
/// the guest has been idle beyond `idle_timeout` (default 30 min, §4.2).
pub async fn run(clock: &ActivityClock, idle_timeout: Duration, poweroff: impl Fn()) {
    let mut ticker = tokio::time::interval(IDLE_WATCHER_INTERVAL);
    loop {
        ticker.tick().await;
        let idle = clock.idle_for();
        if idle >= idle_timeout {
            info!(idle_secs = idle.as_secs(), "idle timeout exceeded, requesting poweroff");
            poweroff();
            return;
        }
    }
}

pub fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn touch_resets_idle_duration() {
        let clock = ActivityClock::new();
        std::thread::sleep(Duration::from_millis(20));
        clock.touch();
        assert!(clock.idle_for() < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_fires_poweroff_after_timeout() {
        let clock = ActivityClock::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let watcher = run(&clock, Duration::from_secs(1), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        tokio::select! {
            _ = watcher => {}
            _ = tokio::time::sleep(Duration::from_secs(700)) => {}
        }

        assert!(fired.load(Ordering::SeqCst));
    }
}
