//! Centralized action computation. The action server owns the only policy copy and runs it once
//! per timestep over the whole batch, handing actions to the workers through the per worker
//! handshakes.

use crate::{
    buffers::{ColumnView, FieldKind, StepBuffer},
    policy::{Policy, PolicyHolder, act, bootstrap, reset_done_rows, reset_policy},
    sync::{ControlBlock, Handshake},
};
use std::sync::Arc;
use tracing::debug;

/// Protocol steps as seen by the action server. `t == batch_t` (or `eval_max_t`) marks the extra
/// acquire that follows the last timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEvent {
    StepAcquired { t: usize, worker: usize },
    ActionsComputed { t: usize },
    ActionReleased { t: usize, worker: usize },
}

pub trait ServeHooks: Send + Sync + 'static {
    fn on_event(&self, _event: ServeEvent) {}
}

pub struct NoHooks;

impl ServeHooks for NoHooks {}

pub struct ActionServer<P: Policy + Clone> {
    pub(crate) rank: usize,
    pub(crate) holder: PolicyHolder<P>,
    pub(crate) control: Arc<ControlBlock>,
    pub(crate) handshakes: Vec<Arc<Handshake>>,
    // action and agent info of every column
    pub(crate) step: ColumnView,
    pub(crate) eval: Option<(Arc<StepBuffer>, ColumnView)>,
    // bootstrap value of every column, one view per store
    pub(crate) bootstrap: Option<[ColumnView; 2]>,
    pub(crate) batch_t: usize,
    pub(crate) eval_max_t: usize,
    pub(crate) hooks: Arc<dyn ServeHooks>,
}

impl<P: Policy + Clone> ActionServer<P> {
    pub(crate) fn run(mut self) {
        self.control.barrier_out.wait();
        loop {
            self.control.barrier_in.wait();
            let round = self.control.round();
            if round.quit {
                break;
            }
            if self.holder.sync() {
                debug!(version = self.holder.version(), "action server picked up new policy");
            }
            if round.do_eval {
                self.serve_evaluation();
            } else {
                self.serve_actions(round.j);
            }
            self.control.barrier_out.wait();
        }
        debug!("action server exiting");
    }

    fn acquire_all(&self, t: usize) {
        for (worker, handshake) in self.handshakes.iter().enumerate() {
            handshake.wait_step();
            self.hooks.on_event(ServeEvent::StepAcquired { t, worker });
        }
    }

    fn release_all(&self, t: usize) {
        for (worker, handshake) in self.handshakes.iter().enumerate() {
            handshake.signal_action();
            self.hooks.on_event(ServeEvent::ActionReleased { t, worker });
        }
    }

    // After the trailing acquire every worker has consumed its last action.
    fn assert_idle(&self) {
        debug_assert!(
            self.handshakes.iter().all(|handshake| handshake.is_idle()),
            "handshake left with an outstanding signal after the round"
        );
    }

    fn fault(&self, context: &str, err: anyhow::Error) {
        self.control
            .faults
            .record(self.rank, format!("action server {context}: {err:#}"));
    }

    /// One sampling round: `batch_t` action computations, each only after every worker reported
    /// its observation, then the bootstrap value and the policy reset of finished episodes.
    pub fn serve_actions(&mut self, j: usize) {
        for t in 0..self.batch_t {
            self.acquire_all(t);
            if let Err(err) = act(&mut self.holder.policy, &mut self.step) {
                self.fault("policy failed", err);
            }
            self.hooks.on_event(ServeEvent::ActionsComputed { t });
            self.release_all(t);
        }
        self.acquire_all(self.batch_t);
        self.assert_idle();
        if let Some(views) = self.bootstrap.as_mut() {
            if let Err(err) = bootstrap(&mut self.holder.policy, &self.step, &mut views[j]) {
                self.fault("bootstrap value failed", err);
            }
        }
        if let Err(err) = reset_done_rows(&mut self.holder.policy, &mut self.step) {
            self.fault("policy reset failed", err);
        }
    }

    /// One evaluation round. Stops early when the master raised `stop_eval`, in which case the
    /// halt is published before the workers are released so every party leaves at the same step.
    pub fn serve_evaluation(&mut self) {
        let Some((buffer, mut view)) = self.eval.take() else {
            return;
        };
        if let Err(err) = reset_policy(&mut self.holder.policy) {
            self.fault("policy reset failed", err);
        }
        buffer.set_halt(false);
        view.span_mut(FieldKind::Action, 0).fill(0.);
        view.span_mut(FieldKind::AgentInfo, 0).fill(0.);
        for t in 0..self.eval_max_t {
            self.acquire_all(t);
            if self.control.stop_eval() {
                debug!(t, "evaluation halted");
                buffer.set_halt(true);
                self.release_all(t);
                break;
            }
            if let Err(err) = act(&mut self.holder.policy, &mut view) {
                self.fault("policy failed", err);
            }
            self.hooks.on_event(ServeEvent::ActionsComputed { t });
            self.release_all(t);
        }
        self.acquire_all(self.eval_max_t);
        self.assert_idle();
        self.eval = Some((buffer, view));
    }
}
