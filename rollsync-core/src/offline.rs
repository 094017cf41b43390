//! Offline data collection: random-action trajectories gathered by a pool of worker threads,
//! optionally with negative samples taken from snapshots of the environment state.

use crate::{
    buffers::EnvPartition,
    env::Env,
    env_builder::EnvBuilderTrait,
    error::{Result, SamplerError},
    rng::{make_seed, next_seed, reseed},
    trajectory::{TrajInfo, TrajectoryRecord},
};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub n_trajectories: usize,
    pub n_workers: usize,
    // episodes that run longer are cut off
    pub max_steps: usize,
    pub n_neg_samples: usize,
    pub discount: f32,
    pub seed: Option<u64>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            n_trajectories: 16,
            n_workers: 4,
            max_steps: 1000,
            n_neg_samples: 0,
            discount: 0.99,
            seed: None,
        }
    }
}

/// An action that was tried from a snapshot and rolled back, with the observation it led to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegativeSample {
    pub action: Vec<f32>,
    pub observation: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub observation: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f32,
    pub next_observation: Vec<f32>,
    pub done: bool,
    pub negatives: Vec<NegativeSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub index: usize,
    pub transitions: Vec<Transition>,
    pub record: TrajectoryRecord,
}

fn negative_samples<E: Env>(env: &mut E, n: usize) -> anyhow::Result<Vec<NegativeSample>> {
    let action_space = env.env_description().action_space;
    let mut negatives = Vec::with_capacity(n);
    for _ in 0..n {
        let state = env.get_state()?;
        let action = action_space.sample();
        let snapshot = env.step(&action)?;
        env.set_state(&state)?;
        negatives.push(NegativeSample {
            action,
            observation: snapshot.state,
        });
    }
    Ok(negatives)
}

fn rollout<E: Env>(
    env: &mut E,
    index: usize,
    config: &OfflineConfig,
) -> anyhow::Result<Trajectory> {
    let action_space = env.env_description().action_space;
    let mut observation = env.reset(next_seed())?;
    let mut info = TrajInfo::new(config.discount, index, false);
    let mut transitions = vec![];
    for _ in 0..config.max_steps {
        let negatives = negative_samples(env, config.n_neg_samples)?;
        let action = action_space.sample();
        let snapshot = env.step(&action)?;
        info.step(snapshot.reward);
        let done = snapshot.done();
        transitions.push(Transition {
            observation: std::mem::replace(&mut observation, snapshot.state.clone()),
            action,
            reward: snapshot.reward,
            next_observation: snapshot.state,
            done,
            negatives,
        });
        if done {
            break;
        }
    }
    let record = info.terminate(env.episode_stats());
    Ok(Trajectory {
        index,
        transitions,
        record,
    })
}

fn collect_chunk<EB: EnvBuilderTrait>(
    builder: &EB,
    rank: usize,
    chunk: Range<usize>,
    config: &OfflineConfig,
    seed: u64,
) -> anyhow::Result<Vec<Trajectory>> {
    reseed(seed + rank as u64);
    let mut env = builder.build_env()?;
    let trajectories = chunk
        .map(|index| rollout(&mut env, index, config))
        .collect::<anyhow::Result<Vec<_>>>()?;
    debug!(rank, collected = trajectories.len(), "offline worker done");
    Ok(trajectories)
}

/// Collects `n_trajectories` random-action trajectories. The trajectory indices are split into
/// contiguous chunks, one per worker thread. Results are ordered by index.
pub fn collect_random_trajectories<EB: EnvBuilderTrait>(
    config: &OfflineConfig,
    env_builder: &EB,
) -> Result<Vec<Trajectory>> {
    if config.n_trajectories == 0 {
        return Ok(vec![]);
    }
    let n_workers = config.n_workers.clamp(1, config.n_trajectories);
    let partition = EnvPartition::contiguous(config.n_trajectories, n_workers)?;
    let seed = config.seed.unwrap_or_else(make_seed);
    let results = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = partition
            .ranges()
            .iter()
            .cloned()
            .enumerate()
            .map(|(rank, chunk)| {
                scope.spawn(move |_| collect_chunk(env_builder, rank, chunk, config, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    })
    .map_err(|_| SamplerError::Protocol("offline collection thread panicked".into()))?;
    let mut trajectories = Vec::with_capacity(config.n_trajectories);
    for (rank, result) in results.into_iter().enumerate() {
        let chunk = result.map_err(|_| SamplerError::worker(rank, "offline worker panicked"))?;
        trajectories.extend(chunk.map_err(|err| SamplerError::worker(rank, format!("{err:#}")))?);
    }
    trajectories.sort_by_key(|trajectory| trajectory.index);
    info!(
        trajectories = trajectories.len(),
        transitions = trajectories.iter().map(|t| t.transitions.len()).sum::<usize>(),
        "offline collection complete"
    );
    Ok(trajectories)
}
