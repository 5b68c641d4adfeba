use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// A Lamport logical clock: a monotonic 64-bit counter shared by every thread
/// of a process.
///
/// The clock advances on `tick` for local events and on `observe` when a peer's
/// clock value arrives in a message. Under concurrent callers every call
/// returns a distinct value; both operations are lock-free.
///
/// # Example
/// ```rust
/// use atmo::LamportClock;
///
/// let clock = LamportClock::new();
/// assert_eq!(clock.tick(), 1);
/// // receiving a message stamped 10 jumps past it
/// assert_eq!(clock.observe(10), 11);
/// assert_eq!(clock.read(), 11);
/// ```
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// creates a clock starting at 0
    pub fn new() -> Self {
        LamportClock {
            counter: AtomicU64::new(0),
        }
    }

    /// advances the clock for a local event and returns the new value
    pub fn tick(&self) -> u64 {
        let v = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(clock = v, "tick");
        v
    }

    /// merges a remote clock value: sets the counter to `max(local, remote) + 1`
    /// and returns the new value.
    ///
    /// The compare-and-swap loop guarantees that two concurrent callers never
    /// obtain the same value, even when both observe the same remote clock.
    pub fn observe(&self, remote: u64) -> u64 {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(remote) + 1;
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    trace!(clock = next, remote, "observe");
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// returns the current clock value without advancing it
    pub fn read(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

/// returns the current wall-clock time as milliseconds since the Unix epoch.
/// Used to stamp store entries for TTL eviction, never for event ordering.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(clock.read(), b);
    }

    #[test]
    fn observe_jumps_past_remote() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.observe(40), 41);
        // a remote clock behind ours still advances us by one
        assert_eq!(clock.observe(3), 42);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LamportClock::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..per_thread).map(|_| clock.tick()).collect::<Vec<u64>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for v in handle.join().unwrap() {
                assert!(seen.insert(v), "duplicate clock value {}", v);
            }
        }
        assert_eq!(seen.len(), threads * per_thread);
        assert_eq!(clock.read(), (threads * per_thread) as u64);
    }

    #[test]
    fn concurrent_observes_are_unique() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..500).map(|_| clock.observe(100)).collect::<Vec<u64>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for v in handle.join().unwrap() {
                assert!(v > 100);
                assert!(seen.insert(v), "duplicate clock value {}", v);
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
