use crate::{error::SamplerError, sync::barrier::Barrier, trajectory::TrajectoryRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::error;

/// What a party reads right after `barrier_in` releases it. Taken once per round so `j` and the
/// flags stay fixed for the whole unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub quit: bool,
    pub iteration: usize,
    pub j: usize,
    pub do_eval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub rank: usize,
    pub message: String,
}

/// Collaborator failures raised inside a round. The failing party keeps following the protocol,
/// the master reports the first fault once the round is over.
#[derive(Default)]
pub struct FaultLog {
    faults: Mutex<Vec<Fault>>,
}

impl FaultLog {
    pub fn record(&self, rank: usize, message: impl Into<String>) {
        let message = message.into();
        error!(rank, %message, "party faulted");
        self.faults.lock().push(Fault { rank, message });
    }

    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }

    /// Clears the log. Returns the first recorded fault as an error carrying what the round
    /// produced anyway.
    pub fn take(
        &self,
        buffer_index: Option<usize>,
        traj_infos: Vec<TrajectoryRecord>,
    ) -> std::result::Result<Vec<TrajectoryRecord>, SamplerError> {
        let mut faults = self.faults.lock();
        let first = faults.first().cloned();
        faults.clear();
        match first {
            None => Ok(traj_infos),
            Some(fault) => Err(SamplerError::Worker {
                rank: fault.rank,
                message: fault.message,
                buffer_index,
                traj_infos,
            }),
        }
    }
}

/// Flags and barriers shared by the master, the workers and the action server. Only the master
/// writes the round fields, and only while every other party is parked on `barrier_in`.
pub struct ControlBlock {
    quit: AtomicBool,
    iteration: AtomicUsize,
    j: AtomicUsize,
    do_eval: AtomicBool,
    stop_eval: AtomicBool,
    parties: usize,
    pub barrier_in: Barrier,
    pub barrier_out: Barrier,
    pub faults: FaultLog,
}

impl ControlBlock {
    pub fn new(n_workers: usize, n_action_servers: usize) -> Self {
        let parties = n_workers + n_action_servers + 1;
        Self {
            quit: AtomicBool::new(false),
            iteration: AtomicUsize::new(0),
            j: AtomicUsize::new(0),
            do_eval: AtomicBool::new(false),
            stop_eval: AtomicBool::new(false),
            parties,
            barrier_in: Barrier::new(parties),
            barrier_out: Barrier::new(parties),
            faults: FaultLog::default(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Sets the parameters of the next round. The master calls this before `barrier_in.wait()`.
    pub fn prepare_round(&self, iteration: usize, j: usize, do_eval: bool) {
        assert!(j < 2, "double buffer index {j} out of range");
        self.iteration.store(iteration, Ordering::Release);
        self.j.store(j, Ordering::Release);
        self.do_eval.store(do_eval, Ordering::Release);
        self.stop_eval.store(false, Ordering::Release);
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn round(&self) -> Round {
        Round {
            quit: self.quit.load(Ordering::Acquire),
            iteration: self.iteration.load(Ordering::Acquire),
            j: self.j.load(Ordering::Acquire),
            do_eval: self.do_eval.load(Ordering::Acquire),
        }
    }

    pub fn set_stop_eval(&self) {
        self.stop_eval.store(true, Ordering::Release);
    }

    pub fn stop_eval(&self) -> bool {
        self.stop_eval.load(Ordering::Acquire)
    }

    /// Clears the evaluation flags after an evaluation round has fully finished.
    pub fn finish_eval(&self) {
        self.do_eval.store(false, Ordering::Release);
        self.stop_eval.store(false, Ordering::Release);
    }

    /// Number of parties, other than the master, that have not yet reached `barrier_out`.
    pub fn parties_running(&self) -> usize {
        (self.barrier_out.parties() - 1).saturating_sub(self.barrier_out.n_waiting())
    }
}

#[cfg(test)]
mod test {
    use super::{ControlBlock, FaultLog};
    use crate::{error::SamplerError, trajectory::TrajectoryRecord};

    #[test]
    fn parties_include_the_master() {
        let control = ControlBlock::new(4, 1);
        assert_eq!(control.parties(), 6);
        assert_eq!(control.barrier_in.parties(), 6);
        assert_eq!(control.barrier_out.parties(), 6);
        assert_eq!(control.parties_running(), 5);
    }

    #[test]
    fn round_snapshot() {
        let control = ControlBlock::new(1, 0);
        control.prepare_round(7, 1, true);
        control.set_stop_eval();
        let round = control.round();
        assert_eq!(round.iteration, 7);
        assert_eq!(round.j, 1);
        assert!(round.do_eval && !round.quit);
        assert!(control.stop_eval());
        control.finish_eval();
        assert!(!control.round().do_eval && !control.stop_eval());
        control.request_quit();
        assert!(control.round().quit);
    }

    #[test]
    fn first_fault_is_reported() {
        let log = FaultLog::default();
        let record = TrajectoryRecord {
            length: 3,
            ..Default::default()
        };
        assert_eq!(log.take(None, vec![record.clone()]).unwrap(), vec![record.clone()]);
        log.record(2, "policy exploded");
        log.record(0, "again");
        let Err(SamplerError::Worker {
            rank,
            message,
            buffer_index,
            traj_infos,
        }) = log.take(Some(1), vec![record.clone()])
        else {
            panic!("expected a worker fault")
        };
        assert_eq!((rank, message.as_str()), (2, "policy exploded"));
        assert_eq!(buffer_index, Some(1));
        assert_eq!(traj_infos, vec![record]);
        assert!(log.is_empty());
    }
}
