use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cvar: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Returns the count before the release.
    pub fn release(&self) -> usize {
        let mut count = self.count.lock();
        let previous = *count;
        *count += 1;
        self.cvar.notify_one();
        previous
    }

    pub fn value(&self) -> usize {
        *self.count.lock()
    }
}

/// The per worker `(step_blocker, act_waiter)` pair of the action server protocol.
///
/// The worker signals `step_blocker` once its observation for the timestep is in the step buffer
/// and then waits on `act_waiter`. The server does the reverse. Both semaphores start at zero and
/// strictly alternate, so a release that finds the count already raised means a side released
/// twice without the other acquiring. That is a broken invariant and panics.
pub struct Handshake {
    step_blocker: Semaphore,
    act_waiter: Semaphore,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            step_blocker: Semaphore::new(0),
            act_waiter: Semaphore::new(0),
        }
    }

    pub fn signal_step(&self) {
        let previous = self.step_blocker.release();
        assert_eq!(
            previous, 0,
            "step_blocker released twice without a matching acquire"
        );
    }

    pub fn wait_step(&self) {
        self.step_blocker.acquire();
    }

    pub fn signal_action(&self) {
        let previous = self.act_waiter.release();
        assert_eq!(
            previous, 0,
            "act_waiter released twice without a matching acquire"
        );
    }

    pub fn wait_action(&self) {
        self.act_waiter.acquire();
    }

    /// True when neither side has an outstanding signal, i.e. between rounds.
    pub fn is_idle(&self) -> bool {
        self.step_blocker.value() == 0 && self.act_waiter.value() == 0
    }
}

#[cfg(test)]
mod test {
    use super::{Handshake, Semaphore};
    use std::{sync::Arc, thread};

    #[test]
    fn counting() {
        let sem = Semaphore::new(1);
        sem.acquire();
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.release(), 0);
        assert_eq!(sem.release(), 1);
        sem.acquire();
        sem.acquire();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn handshake_alternates() {
        let handshake = Arc::new(Handshake::new());
        let worker = handshake.clone();
        let handle = thread::spawn(move || {
            for _ in 0..50 {
                worker.signal_step();
                worker.wait_action();
            }
            worker.signal_step();
        });
        for _ in 0..50 {
            handshake.wait_step();
            handshake.signal_action();
        }
        handshake.wait_step();
        handle.join().unwrap();
        assert!(handshake.is_idle());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_a_protocol_violation() {
        let handshake = Handshake::new();
        handshake.signal_step();
        handshake.signal_step();
    }
}
