use anyhow::{Result, bail};
use clap::Parser;
use rand::Rng;
use rollsync_core::{
    ParallelSampler, SamplerConfig, SamplerMode, TrajectoryRecord,
    env::{Env, EnvironmentDescription, SnapShot, Space},
    policy::{AgentInputs, AgentStep, Policy},
    rng::RNG,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rollsync", about = "Drives the parallel sampler against a random walk")]
struct Args {
    /// Sampler config file (toml, yaml or json). Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    n_workers: Option<usize>,

    #[arg(long)]
    batch_t: Option<usize>,

    #[arg(long)]
    batch_b: Option<usize>,

    /// cpu or action_server
    #[arg(long)]
    mode: Option<SamplerMode>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "10")]
    iterations: usize,

    /// Run an evaluation every n iterations, never when absent
    #[arg(long)]
    eval_every: Option<usize>,

    #[arg(long, default_value = "4")]
    eval_envs: usize,

    #[arg(long, default_value = "2000")]
    eval_steps: usize,

    #[arg(long)]
    eval_trajectories: Option<usize>,

    /// Distance from the origin at which an episode terminates
    #[arg(long, default_value = "5")]
    goal: i32,

    #[arg(long, default_value = "200")]
    max_episode_steps: usize,
}

/// One dimensional walk. Reaching `+goal` pays 1, falling to `-goal` costs 1.
struct RandomWalk {
    position: i32,
    t: usize,
    goal: i32,
    max_steps: usize,
}

impl RandomWalk {
    fn new(goal: i32, max_steps: usize) -> Self {
        Self {
            position: 0,
            t: 0,
            goal,
            max_steps,
        }
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.position as f32, self.t as f32]
    }
}

impl Env for RandomWalk {
    fn reset(&mut self, _seed: u64) -> Result<Vec<f32>> {
        self.position = 0;
        self.t = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &[f32]) -> Result<SnapShot> {
        let Some(&direction) = action.first() else {
            bail!("random walk expects one action value")
        };
        self.position += if direction >= 0.5 { 1 } else { -1 };
        self.t += 1;
        let terminated = self.position.abs() >= self.goal;
        let reward = match self.position {
            p if p >= self.goal => 1.,
            p if p <= -self.goal => -1.,
            _ => 0.,
        };
        Ok(SnapShot {
            state: self.observation(),
            reward,
            terminated,
            truncated: !terminated && self.t >= self.max_steps,
            info: vec![self.position as f32],
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        let goal = self.goal as f32;
        EnvironmentDescription::new(
            Space::Continous {
                min: Some(vec![-goal, 0.]),
                max: Some(vec![goal, self.max_steps as f32]),
                size: 2,
            },
            Space::Discrete(2),
        )
    }

    fn episode_stats(&self) -> Vec<(String, f32)> {
        vec![("final_position".to_owned(), self.position as f32)]
    }
}

/// Steps right with probability `bias`. The bias is nudged after every round and republished.
#[derive(Debug, Clone)]
struct BiasedWalker {
    bias: f32,
    goal: f32,
}

impl Policy for BiasedWalker {
    fn sample_action(&mut self, inputs: AgentInputs<'_>) -> Result<AgentStep> {
        let bias = self.bias;
        let action = RNG.with_borrow_mut(|rng| {
            (0..inputs.n_envs)
                .map(|_| if rng.random::<f32>() < bias { 1. } else { 0. })
                .collect()
        });
        Ok(AgentStep {
            action,
            agent_info: vec![bias; inputs.n_envs],
        })
    }

    fn value(&mut self, inputs: AgentInputs<'_>) -> Result<Vec<f32>> {
        let width = inputs.observation.len() / inputs.n_envs.max(1);
        Ok(inputs
            .observation
            .chunks(width.max(1))
            .map(|obs| obs[0] / self.goal)
            .collect())
    }
}

fn mean_return(records: &[TrajectoryRecord]) -> Option<f32> {
    (!records.is_empty())
        .then(|| records.iter().map(|r| r.ret).sum::<f32>() / records.len() as f32)
}

fn load_config(args: &Args) -> Result<SamplerConfig> {
    let mut config = match &args.config {
        Some(path) => SamplerConfig::from_file(path)?,
        None => SamplerConfig::default(),
    };
    if let Some(n_workers) = args.n_workers {
        config.n_workers = n_workers;
    }
    if let Some(batch_t) = args.batch_t {
        config.batch_t = batch_t;
    }
    if let Some(batch_b) = args.batch_b {
        config.batch_b = batch_b;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.eval_every.is_some() && config.eval_n_envs == 0 {
        config.eval_n_envs = args.eval_envs;
        config.eval_max_steps = args.eval_steps;
        config.eval_max_trajectories = args.eval_trajectories;
    }
    config.bootstrap_value = true;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let (goal, max_steps) = (args.goal, args.max_episode_steps);
    let builder = move || -> Result<RandomWalk> { Ok(RandomWalk::new(goal, max_steps)) };
    let mut policy = BiasedWalker {
        bias: 0.5,
        goal: goal as f32,
    };
    let (mut sampler, example) = ParallelSampler::initialize(config, builder, policy.clone())?;
    info!(
        mode = ?sampler.config().mode,
        parties = sampler.plan().parties,
        observation = example.observation.len(),
        agent_info = example.agent_info.len(),
        "sampler ready"
    );

    for itr in 0..args.iterations {
        let samples = sampler.obtain_samples(itr)?;
        let batch = sampler.batch(samples.buffer_index);
        let shape = batch.shape();
        let total_reward: f32 = (0..shape.t)
            .flat_map(|t| (0..shape.b).map(move |b| (t, b)))
            .map(|(t, b)| batch.reward(t, b))
            .sum();
        info!(
            itr,
            buffer = samples.buffer_index,
            trajectories = samples.traj_infos.len(),
            mean_return = ?mean_return(&samples.traj_infos),
            total_reward,
            bias = policy.bias,
            "sampled"
        );

        if args.eval_every.is_some_and(|every| every > 0 && (itr + 1) % every == 0) {
            let records = sampler.evaluate(itr)?;
            info!(
                itr,
                trajectories = records.len(),
                mean_return = ?mean_return(&records),
                "evaluated"
            );
        }

        if let Some(ret) = mean_return(&samples.traj_infos) {
            policy.bias = (policy.bias + 0.05 * ret).clamp(0.05, 0.95);
            sampler.publish_policy(policy.clone());
        }
    }

    sampler.shutdown()?;
    Ok(())
}
