use parking_lot::{Condvar, Mutex};

struct BarrierState {
    waiting: usize,
    generation: u64,
}

/// Reusable barrier for a fixed number of parties. Unlike `std::sync::Barrier` it reports how many
/// parties are currently parked, which the evaluation controller uses to detect that every other
/// party has finished its round.
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Self {
            parties,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn n_waiting(&self) -> usize {
        self.state.lock().waiting
    }

    /// Blocks until all parties arrived. Returns true for the party that completed the round.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.waiting += 1;
        assert!(
            state.waiting <= self.parties,
            "barrier overfilled: {} arrivals for {} parties",
            state.waiting,
            self.parties
        );
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return true;
        }
        while state.generation == generation {
            self.cvar.wait(&mut state);
        }
        false
    }
}
