use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// A notification that fires at most once.
///
/// Synchronizers fire it after their first successful update or after a permanent failure. Many
/// code paths may call [`ReadySignal::fire`]; only the first call has an effect. Clones share the
/// same signal.
#[derive(Debug, Clone, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    /// Create a signal that has not fired.
    pub fn new() -> ReadySignal {
        ReadySignal::default()
    }

    /// Fire the signal. Returns `true` if this call fired it, `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let (fired, condvar) = &*self.inner;
        let mut fired = match fired.lock() {
            Ok(fired) => fired,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *fired {
            return false;
        }
        *fired = true;
        condvar.notify_all();
        true
    }

    /// Returns `true` once the signal has fired.
    pub fn is_ready(&self) -> bool {
        match self.inner.0.lock() {
            Ok(fired) => *fired,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let (fired, condvar) = &*self.inner;
        let mut lock = match fired.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*lock {
            lock = match condvar.wait(lock) {
                Ok(lock) => lock,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Block until the signal fires or `timeout` elapses. Returns whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (fired, condvar) = &*self.inner;
        let mut lock = match fired.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*lock {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lock = match condvar.wait_timeout(lock, deadline - now) {
                Ok((lock, _)) => lock,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReadySignal;

    #[test]
    fn fires_only_once() {
        let ready = ReadySignal::new();

        assert!(!ready.is_ready());
        assert!(ready.fire());
        assert!(!ready.fire());
        assert!(!ready.clone().fire());
        assert!(ready.is_ready());
    }

    #[test]
    fn wait_timeout_expires_when_not_fired() {
        let ready = ReadySignal::new();

        assert!(!ready.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wakes_waiter_on_another_thread() {
        let ready = ReadySignal::new();

        let waiter = {
            let ready = ready.clone();
            std::thread::spawn(move || ready.wait_timeout(Duration::from_secs(5)))
        };
        ready.fire();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn concurrent_fires_collapse_into_one() {
        let ready = ReadySignal::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ready = ready.clone();
                std::thread::spawn(move || ready.fire())
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|fired| *fired)
            .count();

        assert_eq!(fired, 1);
        ready.wait();
    }
}
