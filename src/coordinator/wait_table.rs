use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct WaitSignal {
    signaled: Mutex<bool>,
    cv: Condvar,
}

struct WaitEntry {
    signal: Arc<WaitSignal>,
    waiters: usize,
}

/// Pending waits keyed by the client timestamp they wait for.
///
/// One signal per distinct target; the first waiter creates it and the last
/// one to leave removes it. The map mutex is only held for bookkeeping, never
/// across a blocking wait, and is independent of the mirror lock.
#[derive(Default)]
pub(crate) struct WaitTable {
    entries: Mutex<HashMap<u64, WaitEntry>>,
}

impl WaitTable {
    /// Blocks until `clock` reaches `target` or the timeout elapses. Returns
    /// whether the target was reached.
    pub(crate) fn wait_for(&self, target: u64, clock: &AtomicU64, timeout: Duration) -> bool {
        if clock.load(Ordering::SeqCst) >= target {
            return true;
        }
        let signal = self.register(target);
        let reached = {
            let deadline = Instant::now() + timeout;
            let mut signaled = signal.signaled.lock();
            loop {
                if *signaled || clock.load(Ordering::SeqCst) >= target {
                    break true;
                }
                if signal.cv.wait_until(&mut signaled, deadline).timed_out() {
                    break *signaled || clock.load(Ordering::SeqCst) >= target;
                }
            }
        };
        self.deregister(target);
        reached
    }

    /// Wakes every waiter registered for exactly `target`. The caller must
    /// have published the new clock value before calling.
    pub(crate) fn signal(&self, target: u64) {
        let signal = {
            let entries = self.entries.lock();
            entries.get(&target).map(|e| Arc::clone(&e.signal))
        };
        if let Some(signal) = signal {
            let mut signaled = signal.signaled.lock();
            *signaled = true;
            signal.cv.notify_all();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn waiters_for(&self, target: u64) -> usize {
        self.entries.lock().get(&target).map_or(0, |e| e.waiters)
    }

    fn register(&self, target: u64) -> Arc<WaitSignal> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(target).or_insert_with(|| WaitEntry {
            signal: Arc::new(WaitSignal::default()),
            waiters: 0,
        });
        entry.waiters += 1;
        Arc::clone(&entry.signal)
    }

    fn deregister(&self, target: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&target) {
            entry.waiters = entry.waiters.saturating_sub(1);
            if entry.waiters == 0 {
                entries.remove(&target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WaitTable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn satisfied_target_does_not_register() {
        let table = WaitTable::default();
        let clock = AtomicU64::new(4);
        assert!(table.wait_for(3, &clock, Duration::from_millis(10)));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn timed_out_waiter_removes_its_entry() {
        let table = WaitTable::default();
        let clock = AtomicU64::new(0);
        let started = Instant::now();
        assert!(!table.wait_for(5, &clock, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn waiters_share_one_signal_and_wake_together() {
        let table = Arc::new(WaitTable::default());
        let clock = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let table = Arc::clone(&table);
                let clock = Arc::clone(&clock);
                thread::spawn(move || table.wait_for(1, &clock, Duration::from_secs(5)))
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while table.waiters_for(1) < 3 {
            assert!(Instant::now() < deadline, "waiters never registered");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(table.pending(), 1);

        clock.store(1, Ordering::SeqCst);
        table.signal(1);
        for handle in handles {
            assert!(handle.join().expect("waiter thread"));
        }
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn signal_for_other_target_does_not_wake() {
        let table = Arc::new(WaitTable::default());
        let clock = Arc::new(AtomicU64::new(0));
        let waiter = {
            let table = Arc::clone(&table);
            let clock = Arc::clone(&clock);
            thread::spawn(move || table.wait_for(2, &clock, Duration::from_millis(100)))
        };
        thread::sleep(Duration::from_millis(10));
        table.signal(1);
        assert!(!waiter.join().expect("waiter thread"));
        assert_eq!(table.pending(), 0);
    }
}
