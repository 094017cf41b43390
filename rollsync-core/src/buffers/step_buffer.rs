use crate::{
    buffers::{
        arena::{ColumnView, SharedArena},
        schema::{FieldKind, FieldSchema, FieldSet},
    },
    error::Result,
};
use derive_more::Deref;
use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Current timestep handoff area: observation, previous action and reward, done and agent info
/// for `n_envs` columns. Shared between workers and the action server, or private to a cpu worker.
#[derive(Deref)]
pub struct StepBuffer {
    #[deref]
    arena: Arc<SharedArena>,
    // set by the action server when an evaluation round stops early
    halt: AtomicBool,
}

impl StepBuffer {
    pub fn allocate(n_envs: usize, schema: &FieldSchema) -> Result<Self> {
        let arena = SharedArena::allocate(1, n_envs, schema.step_schema())?;
        Ok(Self {
            arena: Arc::new(arena),
            halt: AtomicBool::new(false),
        })
    }

    pub fn n_envs(&self) -> usize {
        self.cols()
    }

    pub fn columns(&self, cols: Range<usize>, fields: FieldSet) -> Result<ColumnView> {
        self.arena.claim(cols, fields)
    }

    pub fn observation(&self) -> &[f32] {
        self.f32_field(FieldKind::Observation)
    }

    pub fn action(&self) -> &[f32] {
        self.f32_field(FieldKind::Action)
    }

    pub fn reward(&self) -> &[f32] {
        self.f32_field(FieldKind::Reward)
    }

    pub fn done(&self) -> &[u8] {
        self.u8_field(FieldKind::Done)
    }

    pub fn set_halt(&self, halt: bool) {
        self.halt.store(halt, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::StepBuffer;
    use crate::buffers::schema::{ExampleRecord, FieldKind, FieldSchema, FieldSet};
    use crate::env::{EnvironmentDescription, Space};

    #[test]
    fn worker_and_server_fields_coexist() {
        let example = ExampleRecord {
            observation: vec![0.; 2],
            action: vec![0.],
            reward: 0.,
            done: false,
            agent_info: vec![0.],
            env_info: vec![0.; 3],
        };
        let description =
            EnvironmentDescription::new(Space::continous_from_dims(vec![2]), Space::Discrete(2));
        let schema = FieldSchema::from_example(&example, &description, true).unwrap();
        let step = StepBuffer::allocate(4, &schema).unwrap();
        assert!(!step.schema().has(FieldKind::EnvInfo));

        let worker_fields: FieldSet = [FieldKind::Observation, FieldKind::Reward, FieldKind::Done]
            .into_iter()
            .collect();
        let server_fields: FieldSet = [FieldKind::Action, FieldKind::AgentInfo].into_iter().collect();
        let mut left = step.columns(0..2, worker_fields).unwrap();
        let mut right = step.columns(2..4, worker_fields).unwrap();
        let mut server = step.columns(0..4, server_fields).unwrap();
        assert!(step.columns(1..3, worker_fields).is_err());

        left.write(FieldKind::Observation, 0, 1, &[1., 2.]);
        right.set_flag(FieldKind::Done, 0, 0, true);
        server.span_mut(FieldKind::Action, 0).copy_from_slice(&[3., 2., 1., 0.]);
        assert_eq!(step.observation(), &[0., 0., 1., 2., 0., 0., 0., 0.]);
        assert_eq!(step.done(), &[0, 0, 1, 0]);
        assert_eq!(step.action(), &[3., 2., 1., 0.]);
        assert_eq!(right.span(FieldKind::Action, 0), &[1., 0.]);
    }
}
