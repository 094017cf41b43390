use crate::{
    env::{Env, EnvironmentDescription},
    error::{Result, SamplerError},
    policy::{AgentInputs, Policy},
    rng::next_seed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Observation,
    Action,
    Reward,
    Done,
    AgentInfo,
    EnvInfo,
    BootstrapValue,
}

impl FieldKind {
    pub const ALL: [FieldKind; 7] = [
        FieldKind::Observation,
        FieldKind::Action,
        FieldKind::Reward,
        FieldKind::Done,
        FieldKind::AgentInfo,
        FieldKind::EnvInfo,
        FieldKind::BootstrapValue,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A set of fields, used to describe which fields a column view may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldSet(u8);

impl FieldSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        FieldKind::ALL.into_iter().collect()
    }

    pub fn with(self, kind: FieldKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn without(self, kind: FieldKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    pub fn contains(&self, kind: FieldKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn intersects(&self, other: &FieldSet) -> bool {
        self.0 & other.0 != 0
    }
}

impl FromIterator<FieldKind> for FieldSet {
    fn from_iter<I: IntoIterator<Item = FieldKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, kind| set.with(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    U8,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::U8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rows {
    /// One row per timestep of the batch.
    PerStep,
    /// A single row after the last timestep, e.g. the bootstrap value.
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub width: usize,
    pub dtype: DType,
    pub rows: Rows,
}

/// One transition as produced by the collaborators, used to size every buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleRecord {
    pub observation: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f32,
    pub done: bool,
    pub agent_info: Vec<f32>,
    pub env_info: Vec<f32>,
}

impl ExampleRecord {
    pub fn build<E: Env, P: Policy>(env: &mut E, policy: &mut P) -> Result<Self> {
        let description = env.env_description();
        let observation = env.reset(next_seed())?;
        let prev_action = vec![0.; description.action_size()];
        let step = policy.sample_action(AgentInputs {
            observation: &observation,
            prev_action: &prev_action,
            prev_reward: &[0.],
            n_envs: 1,
        })?;
        let snapshot = env.step(&step.action)?;
        Ok(Self {
            observation,
            done: snapshot.done(),
            action: step.action,
            reward: snapshot.reward,
            agent_info: step.agent_info,
            env_info: snapshot.info,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        for (idx, field) in fields.iter().enumerate() {
            if fields[..idx].iter().any(|f| f.kind == field.kind) {
                return Err(SamplerError::Schema(format!(
                    "field {:?} declared twice",
                    field.kind
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn from_example(
        example: &ExampleRecord,
        description: &EnvironmentDescription,
        bootstrap_value: bool,
    ) -> Result<Self> {
        if example.observation.is_empty() {
            return Err(SamplerError::Schema("empty example observation".into()));
        }
        if example.observation.len() != description.observation_size() {
            return Err(SamplerError::Schema(format!(
                "observation has {} values, observation space declares {}",
                example.observation.len(),
                description.observation_size()
            )));
        }
        if example.action.is_empty() || example.action.len() != description.action_size() {
            return Err(SamplerError::Schema(format!(
                "action has {} values, action space declares {}",
                example.action.len(),
                description.action_size()
            )));
        }
        let f32_field = |kind, width| FieldSpec {
            kind,
            width,
            dtype: DType::F32,
            rows: Rows::PerStep,
        };
        let mut fields = vec![
            f32_field(FieldKind::Observation, example.observation.len()),
            f32_field(FieldKind::Action, example.action.len()),
            f32_field(FieldKind::Reward, 1),
            FieldSpec {
                kind: FieldKind::Done,
                width: 1,
                dtype: DType::U8,
                rows: Rows::PerStep,
            },
            f32_field(FieldKind::AgentInfo, example.agent_info.len()),
            f32_field(FieldKind::EnvInfo, example.env_info.len()),
        ];
        if bootstrap_value {
            fields.push(FieldSpec {
                kind: FieldKind::BootstrapValue,
                width: 1,
                dtype: DType::F32,
                rows: Rows::Trailing,
            });
        }
        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, kind: FieldKind) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.kind == kind)
    }

    pub fn width(&self, kind: FieldKind) -> usize {
        self.get(kind).map_or(0, |f| f.width)
    }

    pub fn has(&self, kind: FieldKind) -> bool {
        self.get(kind).is_some()
    }

    /// The per timestep handoff fields kept in the step buffer.
    pub fn step_schema(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|f| {
                matches!(
                    f.kind,
                    FieldKind::Observation
                        | FieldKind::Action
                        | FieldKind::Reward
                        | FieldKind::Done
                        | FieldKind::AgentInfo
                )
            })
            .copied()
            .collect();
        Self { fields }
    }
}
