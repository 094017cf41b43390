use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use derive_more::Deref;
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::trace;

/// Summary of one finished episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrajectoryRecord {
    pub length: usize,
    #[serde(rename = "return")]
    pub ret: f32,
    pub discounted_return: f32,
    pub non_zero_rewards: usize,
    pub env_rank: usize,
    pub eval: bool,
    // the episode was cut short by a failing environment step
    pub aborted: bool,
    pub custom: BTreeMap<String, f32>,
}

/// Running statistics of the episode an environment is currently in.
#[derive(Debug, Clone)]
pub struct TrajInfo {
    length: usize,
    ret: f32,
    discounted_return: f32,
    non_zero_rewards: usize,
    cur_discount: f32,
    discount: f32,
    env_rank: usize,
    eval: bool,
}

impl TrajInfo {
    pub fn new(discount: f32, env_rank: usize, eval: bool) -> Self {
        Self {
            length: 0,
            ret: 0.,
            discounted_return: 0.,
            non_zero_rewards: 0,
            cur_discount: 1.,
            discount,
            env_rank,
            eval,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn step(&mut self, reward: f32) {
        self.length += 1;
        self.ret += reward;
        self.discounted_return += self.cur_discount * reward;
        self.cur_discount *= self.discount;
        if reward != 0. {
            self.non_zero_rewards += 1;
        }
    }

    fn record(&mut self, custom: BTreeMap<String, f32>, aborted: bool) -> TrajectoryRecord {
        let record = TrajectoryRecord {
            length: self.length,
            ret: self.ret,
            discounted_return: self.discounted_return,
            non_zero_rewards: self.non_zero_rewards,
            env_rank: self.env_rank,
            eval: self.eval,
            aborted,
            custom,
        };
        self.reset();
        record
    }

    /// Drops the running episode without emitting a record.
    pub fn reset(&mut self) {
        *self = Self::new(self.discount, self.env_rank, self.eval);
    }

    /// Closes the episode and starts a fresh one.
    pub fn terminate(&mut self, stats: Vec<(String, f32)>) -> TrajectoryRecord {
        self.record(stats.into_iter().collect(), false)
    }

    pub fn abort(&mut self) -> TrajectoryRecord {
        self.record(BTreeMap::new(), true)
    }
}

#[derive(Clone, Deref)]
pub struct TrajectorySender(Sender<TrajectoryRecord>);

impl TrajectorySender {
    pub fn push(&self, record: TrajectoryRecord) {
        // the receiver only goes away with the sampler, records pushed after that are dropped
        if self.0.send(record).is_err() {
            trace!("trajectory queue closed, dropping record");
        }
    }
}

/// Many producers (the workers), one consumer (the master).
pub struct TrajectoryQueue {
    tx: Sender<TrajectoryRecord>,
    rx: Receiver<TrajectoryRecord>,
}

impl Default for TrajectoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TrajectoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> TrajectorySender {
        TrajectorySender(self.tx.clone())
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Takes every record currently in the queue without blocking. Records pushed while draining
    /// may or may not be included, a record is never split.
    pub fn drain(&self) -> Vec<TrajectoryRecord> {
        self.rx.try_iter().collect()
    }

    /// Waits up to `timeout` for the first record, then drains whatever else is available.
    /// Returns an empty vector if nothing arrived in time.
    pub fn drain_timeout(&self, timeout: Duration) -> Vec<TrajectoryRecord> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut records = vec![first];
                records.extend(self.rx.try_iter());
                records
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => vec![],
        }
    }
}

#[cfg(test)]
mod test {
    use super::{TrajInfo, TrajectoryQueue, TrajectoryRecord};
    use std::{thread, time::Duration};

    #[test]
    fn traj_info_statistics() {
        let mut info = TrajInfo::new(0.5, 3, false);
        info.step(1.);
        info.step(0.);
        info.step(4.);
        let record = info.terminate(vec![("distance".into(), 2.)]);
        assert_eq!(record.length, 3);
        assert_eq!(record.ret, 5.);
        assert_eq!(record.discounted_return, 2.);
        assert_eq!(record.non_zero_rewards, 2);
        assert_eq!(record.env_rank, 3);
        assert_eq!(record.custom["distance"], 2.);
        assert!(!record.aborted);
        assert_eq!(info.length(), 0);
        info.step(1.);
        let aborted = info.abort();
        assert!(aborted.aborted);
        assert_eq!(aborted.length, 1);
    }

    #[test]
    fn concurrent_pushes_are_all_drained() {
        let queue = TrajectoryQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let sender = queue.sender();
                thread::spawn(move || {
                    for length in 0..25 {
                        sender.push(TrajectoryRecord {
                            length,
                            env_rank: rank,
                            ..Default::default()
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut records = queue.drain();
        assert_eq!(records.len(), 100);
        records.sort_by_key(|r| (r.env_rank, r.length));
        assert_eq!(records[99].env_rank, 3);
        assert_eq!(records[99].length, 24);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn drain_timeout_returns_empty_when_idle() {
        let queue = TrajectoryQueue::new();
        assert!(queue.drain_timeout(Duration::from_millis(5)).is_empty());
        let sender = queue.sender();
        sender.push(TrajectoryRecord::default());
        sender.push(TrajectoryRecord::default());
        assert_eq!(queue.drain_timeout(Duration::from_millis(5)).len(), 2);
    }
}
