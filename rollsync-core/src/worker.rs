//! Worker threads. A worker owns a contiguous range of environment columns and steps them
//! sequentially, once per round, writing into its columns of the active batch store.

use crate::{
    buffers::{ColumnView, FieldKind, StepBuffer},
    env::{Env, SnapShot, Space},
    error::panic_message,
    policy::{Policy, PolicyHolder, act, bootstrap, reset_done_rows, reset_policy},
    rng::{RNG, next_seed, reseed},
    sync::{ControlBlock, Handshake},
    trajectory::{TrajInfo, TrajectorySender},
};
use rand::Rng;
use std::{
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub batch_t: usize,
    pub eval_max_t: usize,
    pub max_decorrelation_steps: usize,
    pub discount: f32,
    pub bootstrap_value: bool,
    pub seed: u64,
    pub cpu: Option<usize>,
}

/// Where a worker gets its actions from.
pub(crate) enum Actor<P> {
    /// A local policy copy acting on a private step buffer.
    Local(PolicyHolder<P>),
    /// The action server, reached through the handshake on the shared step buffers.
    Remote {
        handshake: Arc<Handshake>,
        step: Arc<StepBuffer>,
        eval_step: Option<Arc<StepBuffer>>,
    },
}

impl<P: Policy + Clone> Actor<P> {
    // Fills the action field of `view` for the current timestep. Returns true if the action server
    // halted an evaluation round instead.
    fn decide(
        &mut self,
        view: &mut ColumnView,
        eval: bool,
        control: &ControlBlock,
        rank: usize,
    ) -> bool {
        match self {
            Actor::Local(holder) => {
                if let Err(err) = act(&mut holder.policy, view) {
                    control.faults.record(rank, format!("policy failed: {err:#}"));
                }
                false
            }
            Actor::Remote {
                handshake,
                step,
                eval_step,
            } => {
                handshake.signal_step();
                handshake.wait_action();
                let buffer = if eval { eval_step.as_ref() } else { Some(&*step) };
                buffer.is_some_and(|buffer| buffer.halted())
            }
        }
    }

    // Ends the stepping loop of a round.
    fn finish(
        &mut self,
        view: &mut ColumnView,
        batch: Option<&mut ColumnView>,
        control: &ControlBlock,
        rank: usize,
    ) {
        match self {
            Actor::Local(holder) => {
                if let Some(batch) = batch {
                    if let Err(err) = bootstrap(&mut holder.policy, view, batch) {
                        control
                            .faults
                            .record(rank, format!("bootstrap value failed: {err:#}"));
                    }
                }
                if let Err(err) = reset_done_rows(&mut holder.policy, view) {
                    control.faults.record(rank, format!("policy reset failed: {err:#}"));
                }
            }
            // the extra signal lets the server read the trailing observations
            Actor::Remote { handshake, .. } => handshake.signal_step(),
        }
    }
}

pub(crate) struct Worker<E: Env, P: Policy + Clone> {
    pub rank: usize,
    pub settings: WorkerSettings,
    pub cols: Range<usize>,
    pub envs: Vec<E>,
    // running episodes of `envs`, they continue across rounds
    pub trajs: Vec<TrajInfo>,
    pub eval_cols: Range<usize>,
    pub eval_envs: Vec<E>,
    pub actor: Actor<P>,
    pub step: ColumnView,
    pub eval_step: Option<ColumnView>,
    // one view per store of the double buffer
    pub batch: [ColumnView; 2],
    pub control: Arc<ControlBlock>,
    pub queue: TrajectorySender,
}

#[derive(Debug, Clone, Copy)]
struct Widths {
    observation: usize,
    env_info: usize,
}

impl<E: Env, P: Policy + Clone> Worker<E, P> {
    pub fn run(mut self) {
        self.startup();
        self.control.barrier_out.wait();
        loop {
            self.control.barrier_in.wait();
            let round = self.control.round();
            if round.quit {
                break;
            }
            if let Actor::Local(holder) = &mut self.actor {
                if holder.sync() {
                    debug!(rank = self.rank, version = holder.version(), "picked up new policy");
                }
            }
            if round.do_eval {
                self.evaluate();
            } else {
                self.collect(round.j);
            }
            self.control.barrier_out.wait();
        }
        debug!(rank = self.rank, "worker exiting");
    }

    fn widths(&self) -> Widths {
        let schema = self.batch[0].arena().schema();
        Widths {
            observation: schema.width(FieldKind::Observation),
            env_info: schema.width(FieldKind::EnvInfo),
        }
    }

    fn startup(&mut self) {
        reseed(self.settings.seed + self.rank as u64);
        if let Some(cpu) = self.settings.cpu {
            match pin_to_cpu(cpu) {
                Ok(()) => debug!(rank = self.rank, cpu, "pinned worker"),
                Err(err) => warn!(rank = self.rank, cpu, "could not pin worker: {err:#}"),
            }
        }
        let widths = self.widths();
        let max_steps = self.settings.max_decorrelation_steps;
        let mut trajs = Vec::with_capacity(self.envs.len());
        for (b, env) in self.envs.iter_mut().enumerate() {
            let env_rank = self.cols.start + b;
            let action_space = env.env_description().action_space;
            let mut observation = reset_env(env, widths, env_rank);
            let mut traj = TrajInfo::new(self.settings.discount, env_rank, false);
            let n_steps = match max_steps {
                0 => 0,
                max => RNG.with_borrow_mut(|rng| rng.random_range(0..max)),
            };
            for _ in 0..n_steps {
                observation = decorrelation_step(env, &action_space, &mut traj, widths, env_rank);
            }
            self.step.write(FieldKind::Observation, 0, b, &observation);
            trajs.push(traj);
        }
        self.trajs = trajs;
        debug!(rank = self.rank, envs = ?self.cols, "decorrelated");
    }

    fn collect(&mut self, j: usize) {
        let widths = self.widths();
        let Self {
            rank,
            settings,
            cols,
            envs,
            trajs,
            actor,
            step,
            batch,
            control,
            queue,
            ..
        } = self;
        let batch = &mut batch[j];
        // done is edge triggered, the previous round consumed it
        step.flags_mut(FieldKind::Done, 0).fill(0);
        for t in 0..settings.batch_t {
            batch
                .span_mut(FieldKind::Observation, t)
                .copy_from_slice(step.span(FieldKind::Observation, 0));
            actor.decide(step, false, control, *rank);
            batch
                .span_mut(FieldKind::Action, t)
                .copy_from_slice(step.span(FieldKind::Action, 0));
            batch
                .span_mut(FieldKind::AgentInfo, t)
                .copy_from_slice(step.span(FieldKind::AgentInfo, 0));
            let mut slots = EnvSlots {
                envs: &mut envs[..],
                trajs: &mut trajs[..],
                step: &mut *step,
                first_col: cols.start,
                widths,
                queue: &*queue,
            };
            slots.advance(Some((&mut *batch, t)));
        }
        actor.finish(step, settings.bootstrap_value.then_some(batch), control, *rank);
    }

    fn evaluate(&mut self) {
        let widths = self.widths();
        let Self {
            rank,
            settings,
            eval_cols,
            eval_envs,
            actor,
            eval_step,
            control,
            queue,
            ..
        } = self;
        let Some(step) = eval_step.as_mut() else {
            return;
        };
        let mut trajs: Vec<_> = (0..eval_envs.len())
            .map(|b| TrajInfo::new(settings.discount, eval_cols.start + b, true))
            .collect();
        if let Actor::Local(holder) = actor {
            if let Err(err) = reset_policy(&mut holder.policy) {
                control.faults.record(*rank, format!("policy reset failed: {err:#}"));
            }
            step.span_mut(FieldKind::Action, 0).fill(0.);
        }
        for (b, env) in eval_envs.iter_mut().enumerate() {
            let observation = reset_env(env, widths, eval_cols.start + b);
            step.write(FieldKind::Observation, 0, b, &observation);
        }
        step.span_mut(FieldKind::Reward, 0).fill(0.);
        step.flags_mut(FieldKind::Done, 0).fill(0);
        let local = matches!(actor, Actor::Local(_));
        for t in 0..settings.eval_max_t {
            if local && control.stop_eval() {
                debug!(rank = *rank, t, "evaluation stopped early");
                break;
            }
            if actor.decide(step, true, control, *rank) {
                debug!(rank = *rank, t, "evaluation halted by the action server");
                break;
            }
            let mut slots = EnvSlots {
                envs: &mut eval_envs[..],
                trajs: &mut trajs[..],
                step: &mut *step,
                first_col: eval_cols.start,
                widths,
                queue: &*queue,
            };
            slots.advance(None);
        }
        if !local {
            actor.finish(step, None, control, *rank);
        }
    }
}

// The environments of one phase together with their step buffer columns.
struct EnvSlots<'a, E> {
    envs: &'a mut [E],
    trajs: &'a mut [TrajInfo],
    step: &'a mut ColumnView,
    first_col: usize,
    widths: Widths,
    queue: &'a TrajectorySender,
}

impl<E: Env> EnvSlots<'_, E> {
    // Applies the actions in the step buffer to every environment, and records the transitions in
    // row `t` of the batch if one is given.
    fn advance(&mut self, mut batch: Option<(&mut ColumnView, usize)>) {
        for b in 0..self.envs.len() {
            let env_rank = self.first_col + b;
            let action = self.step.cell(FieldKind::Action, 0, b).to_vec();
            let env = &mut self.envs[b];
            let (reward, done, info, observation) = match guarded_step(env, &action, self.widths)
            {
                Ok(snapshot) => {
                    self.trajs[b].step(snapshot.reward);
                    let done = snapshot.done();
                    let observation = if done {
                        let stats = panic::catch_unwind(AssertUnwindSafe(|| env.episode_stats()))
                            .unwrap_or_default();
                        self.queue.push(self.trajs[b].terminate(stats));
                        reset_env(env, self.widths, env_rank)
                    } else {
                        snapshot.state
                    };
                    (snapshot.reward, done, snapshot.info, observation)
                }
                Err(message) => {
                    warn!(env = env_rank, %message, "environment step failed, forcing a reset");
                    self.queue.push(self.trajs[b].abort());
                    let observation = reset_env(env, self.widths, env_rank);
                    (0., true, vec![0.; self.widths.env_info], observation)
                }
            };
            if let Some((batch, t)) = batch.as_mut() {
                batch.write(FieldKind::Reward, *t, b, &[reward]);
                batch.set_flag(FieldKind::Done, *t, b, done);
                batch.write(FieldKind::EnvInfo, *t, b, &info);
            }
            self.step.write(FieldKind::Observation, 0, b, &observation);
            // a new episode starts without a previous reward
            self.step
                .write(FieldKind::Reward, 0, b, &[if done { 0. } else { reward }]);
            self.step.set_flag(FieldKind::Done, 0, b, done);
        }
    }
}

fn guarded_step<E: Env>(
    env: &mut E,
    action: &[f32],
    widths: Widths,
) -> std::result::Result<SnapShot, String> {
    let snapshot = match panic::catch_unwind(AssertUnwindSafe(|| env.step(action))) {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(err)) => return Err(format!("{err:#}")),
        Err(payload) => return Err(panic_message(payload.as_ref())),
    };
    if snapshot.state.len() != widths.observation {
        return Err(format!(
            "step returned {} observation values, expected {}",
            snapshot.state.len(),
            widths.observation
        ));
    }
    if snapshot.info.len() != widths.env_info {
        return Err(format!(
            "step returned {} info values, expected {}",
            snapshot.info.len(),
            widths.env_info
        ));
    }
    Ok(snapshot)
}

// Resets an environment. A failing reset leaves a zero observation, the next step will most likely
// fail as well and retry the reset.
fn reset_env<E: Env>(env: &mut E, widths: Widths, env_rank: usize) -> Vec<f32> {
    let seed = next_seed();
    let message = match panic::catch_unwind(AssertUnwindSafe(|| env.reset(seed))) {
        Ok(Ok(observation)) if observation.len() == widths.observation => return observation,
        Ok(Ok(observation)) => format!(
            "reset returned {} observation values, expected {}",
            observation.len(),
            widths.observation
        ),
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => panic_message(payload.as_ref()),
    };
    warn!(env = env_rank, %message, "environment reset failed");
    vec![0.; widths.observation]
}

fn decorrelation_step<E: Env>(
    env: &mut E,
    action_space: &Space,
    traj: &mut TrajInfo,
    widths: Widths,
    env_rank: usize,
) -> Vec<f32> {
    match guarded_step(env, &action_space.sample(), widths) {
        Ok(snapshot) if !snapshot.done() => {
            traj.step(snapshot.reward);
            snapshot.state
        }
        Ok(_) => {
            traj.reset();
            reset_env(env, widths, env_rank)
        }
        Err(message) => {
            warn!(env = env_rank, %message, "environment failed during decorrelation");
            traj.reset();
            reset_env(env, widths, env_rank)
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> anyhow::Result<()> {
    use nix::{
        sched::{CpuSet, sched_setaffinity},
        unistd::Pid,
    };
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> anyhow::Result<()> {
    anyhow::bail!("cpu affinity is only supported on linux")
}
