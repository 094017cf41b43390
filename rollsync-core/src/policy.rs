use crate::{
    buffers::{ColumnView, FieldKind},
    env::EnvironmentDescription,
    error::panic_message,
};
use anyhow::{Result, anyhow, bail};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// Batched policy inputs. Every slice is row major over `n_envs` rows.
#[derive(Debug, Clone, Copy)]
pub struct AgentInputs<'a> {
    pub observation: &'a [f32],
    pub prev_action: &'a [f32],
    pub prev_reward: &'a [f32],
    pub n_envs: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStep {
    pub action: Vec<f32>,
    // opaque to the sampler, copied verbatim into the batch
    pub agent_info: Vec<f32>,
}

pub trait Policy: Send + 'static {
    fn initialize(
        &mut self,
        _description: &EnvironmentDescription,
        _shared_memory: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn sample_action(&mut self, inputs: AgentInputs<'_>) -> Result<AgentStep>;

    fn value(&mut self, _inputs: AgentInputs<'_>) -> Result<Vec<f32>> {
        anyhow::bail!("policy does not provide a value estimate")
    }

    /// Clears any recurrent state, called before every evaluation pass.
    fn reset(&mut self) {}

    /// Clears the per environment state of row `idx` after its episode ended.
    fn reset_one(&mut self, _idx: usize) {}
}

/// The master's published policy. Holders compare versions at the start of each round and clone
/// when they are behind, so a publication never lands in the middle of a round.
pub struct PolicySlot<P> {
    policy: Mutex<P>,
    version: AtomicU64,
}

impl<P: Policy + Clone> PolicySlot<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy: Mutex::new(policy),
            version: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn publish(&self, policy: P) -> u64 {
        let mut guard = self.policy.lock();
        *guard = policy;
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self) -> (P, u64) {
        let guard = self.policy.lock();
        (guard.clone(), self.version())
    }
}

/// A policy copy owned by one party (a cpu worker or the action server).
pub struct PolicyHolder<P> {
    pub policy: P,
    version: u64,
    slot: Arc<PolicySlot<P>>,
}

impl<P: Policy + Clone> PolicyHolder<P> {
    pub fn new(slot: Arc<PolicySlot<P>>) -> Self {
        let (policy, version) = slot.snapshot();
        Self {
            policy,
            version,
            slot,
        }
    }

    /// Pulls the published policy if a newer one exists. Returns whether anything changed.
    pub fn sync(&mut self) -> bool {
        if self.slot.version() == self.version {
            return false;
        }
        let (policy, version) = self.slot.snapshot();
        self.policy = policy;
        self.version = version;
        true
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

fn inputs(view: &ColumnView) -> AgentInputs<'_> {
    AgentInputs {
        observation: view.span(FieldKind::Observation, 0),
        prev_action: view.span(FieldKind::Action, 0),
        prev_reward: view.span(FieldKind::Reward, 0),
        n_envs: view.n_cols(),
    }
}

// A panicking policy call becomes an error, the caller stays in the round protocol.
fn guarded<T>(call: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(anyhow!(
            "{call} panicked: {}",
            panic_message(payload.as_ref())
        ))
    })
}

/// Clears the recurrent state of a policy before an evaluation pass.
pub(crate) fn reset_policy<P: Policy>(policy: &mut P) -> Result<()> {
    guarded("reset", || {
        policy.reset();
        Ok(())
    })
}

/// Clears the policy state and previous action of every column whose episode just ended. The
/// actions are cleared even when the policy fails, the first failure is returned.
pub(crate) fn reset_done_rows<P: Policy>(policy: &mut P, view: &mut ColumnView) -> Result<()> {
    let done: Vec<usize> = view
        .flags(FieldKind::Done, 0)
        .iter()
        .enumerate()
        .filter(|(_, done)| **done != 0)
        .map(|(idx, _)| idx)
        .collect();
    let mut result: Result<()> = Ok(());
    for idx in done {
        let reset = guarded("reset_one", || {
            policy.reset_one(idx);
            Ok(())
        });
        if result.is_ok() {
            result = reset;
        }
        view.fill(FieldKind::Action, 0, idx, 0.);
    }
    result
}

/// Samples actions for every column of a step buffer view and writes them together with the agent
/// info. If the policy fails or panics, or returns the wrong number of values, the actions are
/// zeroed so the round can still run to completion.
pub(crate) fn act<P: Policy>(policy: &mut P, view: &mut ColumnView) -> Result<()> {
    let written = reset_done_rows(policy, view).and_then(|()| {
        let step = guarded("sample_action", || policy.sample_action(inputs(view)))?;
        let action = view.span_mut(FieldKind::Action, 0);
        if step.action.len() != action.len() {
            bail!(
                "policy returned {} action values, expected {}",
                step.action.len(),
                action.len()
            );
        }
        action.copy_from_slice(&step.action);
        let agent_info = view.span_mut(FieldKind::AgentInfo, 0);
        if step.agent_info.len() != agent_info.len() {
            bail!(
                "policy returned {} agent info values, expected {}",
                step.agent_info.len(),
                agent_info.len()
            );
        }
        agent_info.copy_from_slice(&step.agent_info);
        Ok(())
    });
    if written.is_err() {
        view.span_mut(FieldKind::Action, 0).fill(0.);
        view.span_mut(FieldKind::AgentInfo, 0).fill(0.);
    }
    written
}

/// Writes the value of the trailing observations into the bootstrap row of `batch`.
pub(crate) fn bootstrap<P: Policy>(
    policy: &mut P,
    step: &ColumnView,
    batch: &mut ColumnView,
) -> Result<()> {
    let values = guarded("value", || policy.value(inputs(step)))?;
    let slot = batch.span_mut(FieldKind::BootstrapValue, 0);
    if values.len() != slot.len() {
        bail!(
            "value returned {} estimates for {} environments",
            values.len(),
            slot.len()
        );
    }
    slot.copy_from_slice(&values);
    Ok(())
}
