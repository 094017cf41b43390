//! Stub environments, policies and hooks for exercising the sampler in tests.

use crate::{
    action_server::{ServeEvent, ServeHooks},
    env::{Env, EnvironmentDescription, SnapShot, Space},
    policy::{AgentInputs, AgentStep, Policy},
};
use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

/// Terminates every `period` steps. Observations are `[id + 1, steps into the episode]`, so a
/// written cell is never all zeros and can be traced back to its environment.
#[derive(Debug, Clone)]
pub struct CountdownEnv {
    pub id: usize,
    pub period: usize,
    pub t: usize,
    // sleep before every step
    pub delay: Duration,
    // fail every `fail_every` steps, by error or by panic
    pub fail_every: Option<usize>,
    pub panic: bool,
    steps: usize,
}

impl CountdownEnv {
    pub fn new(id: usize, period: usize) -> Self {
        Self {
            id,
            period,
            t: 0,
            delay: Duration::ZERO,
            fail_every: None,
            panic: false,
            steps: 0,
        }
    }

    fn observation(&self) -> Vec<f32> {
        vec![(self.id + 1) as f32, self.t as f32]
    }
}

impl Env for CountdownEnv {
    fn reset(&mut self, _seed: u64) -> Result<Vec<f32>> {
        self.t = 0;
        Ok(self.observation())
    }

    fn step(&mut self, _action: &[f32]) -> Result<SnapShot> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.steps += 1;
        if self.fail_every.is_some_and(|every| self.steps % every == 0) {
            if self.panic {
                panic!("countdown env {} blew up", self.id);
            }
            bail!("countdown env {} failed", self.id);
        }
        self.t += 1;
        let terminated = self.t % self.period == 0;
        Ok(SnapShot {
            state: self.observation(),
            reward: 1.,
            terminated,
            truncated: false,
            info: vec![self.id as f32],
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continous_from_dims(vec![2]), Space::Discrete(2))
    }

    fn get_state(&self) -> Result<Vec<f32>> {
        Ok(vec![self.t as f32])
    }

    fn set_state(&mut self, state: &[f32]) -> Result<()> {
        self.t = state[0] as usize;
        Ok(())
    }

    fn episode_stats(&self) -> Vec<(String, f32)> {
        vec![("period".into(), self.period as f32)]
    }
}

/// Builder handing out `CountdownEnv`s with consecutive ids. The sampler builds the training
/// environments first, so column `c` holds the environment with id `c`.
pub fn countdown_builder(
    period: usize,
    configure: impl Fn(&mut CountdownEnv) + Send + Sync + 'static,
) -> impl Fn() -> Result<CountdownEnv> + Send + Sync + 'static {
    let next_id = Arc::new(AtomicUsize::new(0));
    move || {
        let mut env = CountdownEnv::new(next_id.fetch_add(1, Ordering::SeqCst), period);
        configure(&mut env);
        Ok(env)
    }
}

/// Always takes action `1`. The agent info carries the first observation value, the value
/// estimate is the second one.
#[derive(Debug, Clone, Default)]
pub struct EchoPolicy {
    pub observation_size: usize,
    // fail every action request, by error or by panic
    pub fail: bool,
    pub panic: bool,
    pub resets: Arc<AtomicUsize>,
}

impl Policy for EchoPolicy {
    fn initialize(&mut self, description: &EnvironmentDescription, _shared: bool) -> Result<()> {
        self.observation_size = description.observation_size();
        Ok(())
    }

    fn sample_action(&mut self, inputs: AgentInputs<'_>) -> Result<AgentStep> {
        if self.fail {
            if self.panic {
                panic!("echo policy blew up");
            }
            bail!("echo policy asked to fail");
        }
        Ok(AgentStep {
            action: vec![1.; inputs.n_envs],
            agent_info: inputs
                .observation
                .chunks(self.observation_size)
                .map(|obs| obs[0])
                .collect(),
        })
    }

    fn value(&mut self, inputs: AgentInputs<'_>) -> Result<Vec<f32>> {
        Ok(inputs
            .observation
            .chunks(self.observation_size)
            .map(|obs| obs[1])
            .collect())
    }

    fn reset_one(&mut self, _idx: usize) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every protocol step of the action server.
#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<ServeEvent>>,
}

impl ServeHooks for RecordingHooks {
    fn on_event(&self, event: ServeEvent) {
        self.events.lock().push(event);
    }
}
