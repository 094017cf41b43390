use crate::rng::RNG;
use anyhow::Result;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum Space {
    Discrete(usize),
    Continous {
        min: Option<Vec<f32>>,
        max: Option<Vec<f32>>,
        size: usize,
    },
}

impl Space {
    pub fn continous_from_dims(dims: Vec<usize>) -> Self {
        Self::Continous {
            min: None,
            max: None,
            size: dims.iter().product(),
        }
    }

    pub fn size(&self) -> usize {
        match &self {
            Self::Discrete(size) => *size,
            Self::Continous { size, .. } => *size,
        }
    }

    /// Number of f32 slots one element of this space takes in a flat buffer. Discrete actions are
    /// stored as their index.
    pub fn flat_dim(&self) -> usize {
        match &self {
            Self::Discrete(_) => 1,
            Self::Continous { size, .. } => *size,
        }
    }

    pub fn sample(&self) -> Vec<f32> {
        RNG.with_borrow_mut(|rng| match self {
            Self::Discrete(n) => vec![rng.random_range(0..(*n).max(1)) as f32],
            Self::Continous { min, max, size } => (0..*size)
                .map(|idx| {
                    let lo = min.as_ref().map_or(-1., |min| min[idx]);
                    let hi = max.as_ref().map_or(1., |max| max[idx]);
                    if hi > lo {
                        rng.random_range(lo..hi)
                    } else {
                        lo
                    }
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        Self {
            observation_space,
            action_space,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.flat_dim()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.flat_dim()
    }
}

pub struct SnapShot {
    pub state: Vec<f32>,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    // fixed width per environment, stored in the batch next to the transition
    pub info: Vec<f32>,
}

impl SnapShot {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

pub trait Env: Send + 'static {
    fn reset(&mut self, seed: u64) -> Result<Vec<f32>>;

    fn step(&mut self, action: &[f32]) -> Result<SnapShot>;

    fn env_description(&self) -> EnvironmentDescription;

    // Snapshotting is only needed by the offline collectors, most environments never implement it.
    fn get_state(&self) -> Result<Vec<f32>> {
        anyhow::bail!("environment does not support state snapshots")
    }

    fn set_state(&mut self, _state: &[f32]) -> Result<()> {
        anyhow::bail!("environment does not support state snapshots")
    }

    /// Named statistics attached to the trajectory record when an episode ends.
    fn episode_stats(&self) -> Vec<(String, f32)> {
        vec![]
    }
}

#[cfg(test)]
mod test {
    use super::Space;
    use crate::rng::reseed;

    #[test]
    fn discrete_sample_in_range() {
        reseed(3);
        let space = Space::Discrete(4);
        for _ in 0..100 {
            let action = space.sample();
            assert_eq!(action.len(), 1);
            assert!((0.0..4.0).contains(&action[0]));
        }
    }

    #[test]
    fn continous_sample_respects_bounds() {
        reseed(7);
        let space = Space::Continous {
            min: Some(vec![0., -2.]),
            max: Some(vec![1., -1.]),
            size: 2,
        };
        for _ in 0..100 {
            let action = space.sample();
            assert!((0.0..1.0).contains(&action[0]));
            assert!((-2.0..-1.0).contains(&action[1]));
        }
        assert_eq!(space.flat_dim(), 2);
        assert_eq!(Space::Discrete(9).flat_dim(), 1);
    }
}
