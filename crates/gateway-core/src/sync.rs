//! Small synchronization primitives shared by the long-running loops.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Auto-resetting notification: `set` releases one pending or the next
/// arriving wait, which consumes the signal.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }

    /// Block until signaled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(|e| e.into_inner());
        }
        *signaled = false;
    }

    /// Block up to `timeout`; true when signaled (signal consumed), false on
    /// timeout.
    pub fn try_wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        *signaled = false;
        true
    }
}

// ---------------------------------------------------------------------------
// StopControl
// ---------------------------------------------------------------------------

/// Cooperative cancellation observed by every long-running loop: requesting
/// a stop breaks the loop at its next suspension point.
#[derive(Debug, Default)]
pub struct StopControl {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopControl {
    pub fn new() -> StopControl {
        StopControl::default()
    }

    pub fn request_stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn should_stop(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake a `wait_stoppable` sleeper without stopping it.
    pub fn request_wakeup(&self) {
        self.cond.notify_all();
    }

    /// Sleep up to `timeout` unless stopped or woken; returns true when a
    /// stop was requested.
    pub fn wait_stoppable(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        if *stopped {
            return true;
        }
        let (guard, _) = self
            .cond
            .wait_timeout(stopped, timeout)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn event_set_before_wait_is_consumed() {
        let event = Event::new();
        event.set();
        assert!(event.try_wait(Duration::from_millis(1)));
        // consumed — second wait times out
        assert!(!event.try_wait(Duration::from_millis(1)));
    }

    #[test]
    fn event_wakes_a_blocked_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.try_wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn stop_interrupts_a_stoppable_wait() {
        let stop = Arc::new(StopControl::new());
        let sleeper = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = stop.wait_stoppable(Duration::from_secs(5));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        stop.request_stop();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn wakeup_does_not_stop() {
        let stop = StopControl::new();
        stop.request_wakeup();
        assert!(!stop.should_stop());
    }
}
