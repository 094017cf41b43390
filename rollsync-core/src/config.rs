use crate::{
    buffers::{BatchShape, EnvPartition},
    error::{Result, SamplerError},
    rng::make_seed,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerMode {
    /// Every worker runs its own copy of the policy.
    #[default]
    Cpu,
    /// A single action server runs the policy for the whole batch.
    ActionServer,
}

impl FromStr for SamplerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "action_server" | "action-server" => Ok(Self::ActionServer),
            other => Err(format!("unknown sampler mode {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub batch_t: usize,
    pub batch_b: usize,
    pub n_workers: usize,
    pub mode: SamplerMode,
    pub max_decorrelation_steps: usize,
    pub seed: Option<u64>,
    pub bootstrap_value: bool,
    pub discount: f32,
    pub eval_n_envs: usize,
    pub eval_max_steps: usize,
    pub eval_max_trajectories: Option<usize>,
    pub eval_poll_interval_ms: u64,
    pub worker_cpus: Option<Vec<usize>>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_t: 16,
            batch_b: 8,
            n_workers: 2,
            mode: SamplerMode::Cpu,
            max_decorrelation_steps: 100,
            seed: None,
            bootstrap_value: false,
            discount: 0.99,
            eval_n_envs: 0,
            eval_max_steps: 0,
            eval_max_trajectories: None,
            eval_poll_interval_ms: 100,
            worker_cpus: None,
        }
    }
}

impl SamplerConfig {
    /// Loads a config file (format picked from the extension), then applies `ROLLSYNC_*`
    /// environment overrides, e.g. `ROLLSYNC_BATCH_T=64`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("ROLLSYNC").try_parsing(true))
            .build()
            .map_err(|err| SamplerError::setup(format!("could not read config: {err}")))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|err| SamplerError::setup(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_t == 0 || self.batch_b == 0 {
            return Err(SamplerError::setup(format!(
                "batch shape {}x{} has no cells",
                self.batch_t, self.batch_b
            )));
        }
        if self.n_workers == 0 {
            return Err(SamplerError::setup("at least one worker is required"));
        }
        if self.batch_b < self.n_workers {
            return Err(SamplerError::setup(format!(
                "{} workers for {} environments, every worker needs at least one",
                self.n_workers, self.batch_b
            )));
        }
        if !(0. ..=1.).contains(&self.discount) {
            return Err(SamplerError::setup(format!(
                "discount {} outside [0, 1]",
                self.discount
            )));
        }
        if self.eval_n_envs > 0 && self.eval_max_steps == 0 {
            return Err(SamplerError::setup(
                "evaluation environments configured without an evaluation step budget",
            ));
        }
        if self.eval_poll_interval_ms == 0 {
            return Err(SamplerError::setup("evaluation poll interval must be positive"));
        }
        if let Some(cpus) = &self.worker_cpus {
            if cpus.len() != self.n_workers {
                return Err(SamplerError::setup(format!(
                    "{} cpu hints for {} workers",
                    cpus.len(),
                    self.n_workers
                )));
            }
            let allowed = allowed_cpus()?;
            if let Some(cpu) = cpus.iter().find(|cpu| !allowed(**cpu)) {
                return Err(SamplerError::setup(format!(
                    "cpu {cpu} is not in this process's affinity set"
                )));
            }
        }
        Ok(())
    }

    pub fn n_action_servers(&self) -> usize {
        match self.mode {
            SamplerMode::Cpu => 0,
            SamplerMode::ActionServer => 1,
        }
    }

    pub fn eval_n_envs_per(&self) -> usize {
        match self.eval_n_envs {
            0 => 0,
            n => (n / self.n_workers).max(1),
        }
    }

    /// Validates the config and derives every value the sampler needs for its lifetime.
    pub fn plan(&self) -> Result<SamplerPlan> {
        self.validate()?;
        let partition = EnvPartition::contiguous(self.batch_b, self.n_workers)?;
        let eval = match self.eval_n_envs_per() {
            0 => None,
            per => {
                let n_envs = per * self.n_workers;
                Some(EvalPlan {
                    partition: EnvPartition::contiguous(n_envs, self.n_workers)?,
                    max_t: 1 + self.eval_max_steps / n_envs,
                    max_trajectories: self.eval_max_trajectories,
                    poll_interval: Duration::from_millis(self.eval_poll_interval_ms),
                })
            }
        };
        Ok(SamplerPlan {
            shape: BatchShape::new(self.batch_t, self.batch_b),
            parties: self.n_workers + self.n_action_servers() + 1,
            partition,
            eval,
            seed: self.seed.unwrap_or_else(make_seed),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalPlan {
    pub partition: EnvPartition,
    pub max_t: usize,
    pub max_trajectories: Option<usize>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerPlan {
    pub shape: BatchShape,
    pub parties: usize,
    pub partition: EnvPartition,
    pub eval: Option<EvalPlan>,
    pub seed: u64,
}

/// Membership test for the cpus this process may be pinned to.
#[cfg(target_os = "linux")]
fn allowed_cpus() -> Result<impl Fn(usize) -> bool> {
    use nix::{sched::sched_getaffinity, unistd::Pid};
    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|err| SamplerError::setup(format!("could not read cpu affinity: {err}")))?;
    // cpus past the set's capacity are never allowed
    Ok(move |cpu| set.is_set(cpu).unwrap_or(false))
}

#[cfg(not(target_os = "linux"))]
fn allowed_cpus() -> Result<impl Fn(usize) -> bool> {
    let available = std::thread::available_parallelism().map_or(1, |n| n.get());
    Ok(move |cpu| cpu < available)
}
