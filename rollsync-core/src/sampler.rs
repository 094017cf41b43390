use crate::{
    action_server::{ActionServer, NoHooks, ServeHooks},
    buffers::{
        BatchStore, ColumnView, DoubleBuffer, ExampleRecord, FieldKind, FieldSchema, FieldSet,
        StepBuffer, allocate_double_buffer,
    },
    config::{SamplerConfig, SamplerMode, SamplerPlan},
    env::Env,
    env_builder::{EnvBuilderTrait, build_envs},
    error::{Result, SamplerError},
    policy::{Policy, PolicyHolder, PolicySlot},
    sync::{ControlBlock, Handshake},
    trajectory::{TrajectoryQueue, TrajectoryRecord},
    worker::{Actor, Worker, WorkerSettings},
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info};

/// Result of one sampling round. The batch lives in store `buffer_index` of the double buffer and
/// stays untouched until the round after next.
#[derive(Debug)]
pub struct Samples {
    pub buffer_index: usize,
    pub traj_infos: Vec<TrajectoryRecord>,
}

/// The master side of the sampler. Owns the shared regions, the control block and the party
/// threads, and drives one barrier round per call.
pub struct ParallelSampler<P: Policy + Clone> {
    config: SamplerConfig,
    plan: SamplerPlan,
    control: Arc<ControlBlock>,
    buffers: DoubleBuffer,
    queue: TrajectoryQueue,
    slot: Arc<PolicySlot<P>>,
    handles: Vec<JoinHandle<()>>,
    // store written by the next sampling round
    j: usize,
    shut_down: bool,
}

fn worker_step_fields(mode: SamplerMode) -> FieldSet {
    match mode {
        SamplerMode::Cpu => FieldSet::all(),
        SamplerMode::ActionServer => [FieldKind::Observation, FieldKind::Reward, FieldKind::Done]
            .into_iter()
            .collect(),
    }
}

fn server_step_fields() -> FieldSet {
    [FieldKind::Action, FieldKind::AgentInfo].into_iter().collect()
}

// Step buffer columns a worker writes in one phase, with the buffer itself when it is shared.
fn worker_step_view(
    mode: SamplerMode,
    shared: Option<&Arc<StepBuffer>>,
    cols: std::ops::Range<usize>,
    schema: &FieldSchema,
) -> Result<ColumnView> {
    match (mode, shared) {
        (SamplerMode::ActionServer, Some(shared)) => {
            shared.columns(cols, worker_step_fields(mode))
        }
        _ => {
            let private = StepBuffer::allocate(cols.len(), schema)?;
            private.columns(0..cols.len(), worker_step_fields(mode))
        }
    }
}

fn spawn_named<F: FnOnce() + Send + 'static>(name: String, f: F) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|err| SamplerError::setup(format!("could not spawn {name}: {err}")))
}

impl<P: Policy + Clone> ParallelSampler<P> {
    /// Builds every environment, derives the sample schema from an example transition, allocates
    /// the shared regions and spawns the parties. Returns once every party has finished
    /// decorrelating its environments.
    pub fn initialize<EB: EnvBuilderTrait>(
        config: SamplerConfig,
        env_builder: EB,
        policy: P,
    ) -> Result<(Self, ExampleRecord)> {
        Self::initialize_with_hooks(config, env_builder, policy, Arc::new(NoHooks))
    }

    pub fn initialize_with_hooks<EB: EnvBuilderTrait>(
        config: SamplerConfig,
        env_builder: EB,
        mut policy: P,
        hooks: Arc<dyn ServeHooks>,
    ) -> Result<(Self, ExampleRecord)> {
        let plan = config.plan()?;
        let mode = config.mode;
        let setup = |what: &str, err: anyhow::Error| {
            SamplerError::setup(format!("could not build {what}: {err:#}"))
        };
        let mut envs =
            build_envs(&env_builder, plan.shape.b).map_err(|err| setup("environments", err))?;
        let mut example_env = env_builder
            .build_env()
            .map_err(|err| setup("the example environment", err))?;
        let eval_envs_total = plan.eval.as_ref().map_or(0, |eval| eval.partition.n_envs());
        let mut eval_envs = build_envs(&env_builder, eval_envs_total)
            .map_err(|err| setup("evaluation environments", err))?;

        let description = example_env.env_description();
        policy
            .initialize(&description, mode == SamplerMode::Cpu)
            .map_err(|err| setup("the policy", err))?;
        let example = ExampleRecord::build(&mut example_env, &mut policy)
            .map_err(|err| SamplerError::Schema(format!("no valid example record: {err}")))?;
        policy.reset();
        let schema = FieldSchema::from_example(&example, &description, config.bootstrap_value)?;
        let buffers = allocate_double_buffer(plan.shape, schema.clone())?;
        debug!(?schema, "derived sample schema");

        let control = Arc::new(ControlBlock::new(config.n_workers, config.n_action_servers()));
        assert_eq!(control.parties(), plan.parties, "barrier sizing drifted from the plan");
        let queue = TrajectoryQueue::new();
        let slot = Arc::new(PolicySlot::new(policy));

        let shared_step = match mode {
            SamplerMode::Cpu => None,
            SamplerMode::ActionServer => Some(Arc::new(StepBuffer::allocate(plan.shape.b, &schema)?)),
        };
        let shared_eval_step = match (&plan.eval, mode) {
            (Some(eval), SamplerMode::ActionServer) => Some(Arc::new(StepBuffer::allocate(
                eval.partition.n_envs(),
                &schema,
            )?)),
            _ => None,
        };
        let batch_fields = match mode {
            SamplerMode::Cpu => FieldSet::all(),
            SamplerMode::ActionServer => FieldSet::all().without(FieldKind::BootstrapValue),
        };
        let eval_max_t = plan.eval.as_ref().map_or(0, |eval| eval.max_t);

        // every region is claimed before anything runs, so a bad partition fails here
        let mut workers = Vec::with_capacity(config.n_workers);
        let mut handshakes = vec![];
        for (rank, cols) in plan.partition.ranges().iter().cloned().enumerate() {
            let eval_cols = plan
                .eval
                .as_ref()
                .map_or(0..0, |eval| eval.partition.range(rank));
            let eval_step = match &plan.eval {
                Some(_) => Some(worker_step_view(
                    mode,
                    shared_eval_step.as_ref(),
                    eval_cols.clone(),
                    &schema,
                )?),
                None => None,
            };
            let actor = match (&shared_step, mode) {
                (Some(step), SamplerMode::ActionServer) => {
                    let handshake = Arc::new(Handshake::new());
                    handshakes.push(handshake.clone());
                    Actor::Remote {
                        handshake,
                        step: step.clone(),
                        eval_step: shared_eval_step.clone(),
                    }
                }
                _ => Actor::Local(PolicyHolder::new(slot.clone())),
            };
            workers.push(Worker {
                rank,
                settings: WorkerSettings {
                    batch_t: plan.shape.t,
                    eval_max_t,
                    max_decorrelation_steps: config.max_decorrelation_steps,
                    discount: config.discount,
                    bootstrap_value: config.bootstrap_value,
                    seed: plan.seed,
                    cpu: config.worker_cpus.as_ref().map(|cpus| cpus[rank]),
                },
                step: worker_step_view(mode, shared_step.as_ref(), cols.clone(), &schema)?,
                batch: buffers.columns(cols.clone(), batch_fields)?,
                envs: envs.drain(..cols.len()).collect(),
                trajs: vec![],
                eval_envs: eval_envs.drain(..eval_cols.len()).collect(),
                cols,
                eval_cols,
                eval_step,
                actor,
                control: control.clone(),
                queue: queue.sender(),
            });
        }
        let server = match &shared_step {
            Some(step) => Some(ActionServer {
                rank: config.n_workers,
                holder: PolicyHolder::new(slot.clone()),
                control: control.clone(),
                handshakes,
                step: step.columns(0..plan.shape.b, server_step_fields())?,
                eval: match &shared_eval_step {
                    Some(eval_step) => Some((
                        eval_step.clone(),
                        eval_step.columns(0..eval_step.n_envs(), server_step_fields())?,
                    )),
                    None => None,
                },
                bootstrap: if config.bootstrap_value {
                    Some(buffers.columns(
                        0..plan.shape.b,
                        FieldSet::empty().with(FieldKind::BootstrapValue),
                    )?)
                } else {
                    None
                },
                batch_t: plan.shape.t,
                eval_max_t,
                hooks,
            }),
            None => None,
        };

        let mut handles = Vec::with_capacity(config.n_workers + 1);
        for worker in workers {
            let name = format!("rollsync-worker-{}", worker.rank);
            handles.push(spawn_named(name, move || worker.run())?);
        }
        if let Some(server) = server {
            handles.push(spawn_named("rollsync-action-server".into(), move || server.run())?);
        }

        let started = Instant::now();
        control.barrier_out.wait();
        info!(
            n_workers = config.n_workers,
            ?mode,
            batch_t = plan.shape.t,
            batch_b = plan.shape.b,
            seed = plan.seed,
            elapsed = ?started.elapsed(),
            "sampler initialized"
        );
        let sampler = Self {
            config,
            plan,
            control,
            buffers,
            queue,
            slot,
            handles,
            j: 0,
            shut_down: false,
        };
        Ok((sampler, example))
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn plan(&self) -> &SamplerPlan {
        &self.plan
    }

    pub fn control(&self) -> &Arc<ControlBlock> {
        &self.control
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(SamplerError::Protocol("sampler was shut down".into()));
        }
        Ok(())
    }

    /// Runs one sampling round into the next store of the double buffer. Returns only after every
    /// party reached `barrier_out`.
    pub fn obtain_samples(&mut self, itr: usize) -> Result<Samples> {
        self.ensure_running()?;
        let j = self.j;
        self.control.prepare_round(itr, j, false);
        self.control.barrier_in.wait();
        self.control.barrier_out.wait();
        let traj_infos = self.queue.drain();
        self.j ^= 1;
        debug!(itr, j, trajectories = traj_infos.len(), "sampling round complete");
        let traj_infos = self.control.faults.take(Some(j), traj_infos)?;
        Ok(Samples {
            buffer_index: j,
            traj_infos,
        })
    }

    pub fn batch(&self, buffer_index: usize) -> Arc<BatchStore> {
        self.buffers.get(buffer_index).clone()
    }

    /// Runs one evaluation round. With `eval_max_trajectories` set the round stops as soon as that
    /// many trajectories were collected, otherwise it ends when every environment took
    /// `eval_max_t` steps.
    pub fn evaluate(&mut self, itr: usize) -> Result<Vec<TrajectoryRecord>> {
        self.ensure_running()?;
        let Some(eval) = self.plan.eval.clone() else {
            return Err(SamplerError::setup("evaluation environments were not configured"));
        };
        let started = Instant::now();
        self.control.prepare_round(itr, self.j, true);
        self.control.barrier_in.wait();
        let mut records = vec![];
        loop {
            records.extend(self.queue.drain_timeout(eval.poll_interval));
            if eval
                .max_trajectories
                .is_some_and(|max| records.len() >= max)
            {
                info!(collected = records.len(), "evaluation trajectory cap reached, stopping early");
                self.control.set_stop_eval();
                break;
            }
            if self.control.parties_running() == 0 {
                break;
            }
        }
        self.control.barrier_out.wait();
        records.extend(self.queue.drain());
        self.control.finish_eval();
        info!(
            itr,
            trajectories = records.len(),
            elapsed = ?started.elapsed(),
            "evaluation complete"
        );
        self.control.faults.take(None, records)
    }

    /// Publishes a new policy. Policy holders pick it up when the next round starts.
    pub fn publish_policy(&mut self, policy: P) -> u64 {
        let version = self.slot.publish(policy);
        debug!(version, "published policy");
        version
    }

    /// Raises `quit`, releases `barrier_in` one last time and joins every party.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.control.request_quit();
        self.control.barrier_in.wait();
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        info!("sampler shut down");
        match panicked {
            0 => Ok(()),
            n => Err(SamplerError::Protocol(format!("{n} parties panicked"))),
        }
    }
}

impl<P: Policy + Clone> Drop for ParallelSampler<P> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("sampler shutdown failed: {err}");
        }
    }
}
