use crate::{
    buffers::{
        arena::{ColumnView, SharedArena},
        schema::{FieldKind, FieldSchema, FieldSet},
    },
    error::{Result, SamplerError},
};
use derive_more::Deref;
use std::{ops::Range, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub t: usize,
    pub b: usize,
}

impl BatchShape {
    pub fn new(t: usize, b: usize) -> Self {
        Self { t, b }
    }
}

/// One `T x B` batch of sample records. Row `t` of every per step field holds timestep `t`, the
/// bootstrap value (if configured) sits in a single trailing row.
#[derive(Deref)]
pub struct BatchStore {
    #[deref]
    arena: Arc<SharedArena>,
    shape: BatchShape,
}

impl BatchStore {
    pub fn allocate(shape: BatchShape, schema: FieldSchema) -> Result<Self> {
        let arena = SharedArena::allocate(shape.t, shape.b, schema)?;
        Ok(Self {
            arena: Arc::new(arena),
            shape,
        })
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    /// Write access to `fields` of the environment columns in `cols`.
    pub fn columns(&self, cols: Range<usize>, fields: FieldSet) -> Result<ColumnView> {
        self.arena.claim(cols, fields)
    }

    pub fn observation(&self, t: usize, b: usize) -> &[f32] {
        self.f32_cell(FieldKind::Observation, t, b)
    }

    pub fn action(&self, t: usize, b: usize) -> &[f32] {
        self.f32_cell(FieldKind::Action, t, b)
    }

    pub fn reward(&self, t: usize, b: usize) -> f32 {
        self.f32_cell(FieldKind::Reward, t, b)[0]
    }

    pub fn done(&self, t: usize, b: usize) -> bool {
        self.u8_span(FieldKind::Done, t, b..b + 1)[0] != 0
    }

    pub fn agent_info(&self, t: usize, b: usize) -> &[f32] {
        self.f32_cell(FieldKind::AgentInfo, t, b)
    }

    pub fn env_info(&self, t: usize, b: usize) -> &[f32] {
        self.f32_cell(FieldKind::EnvInfo, t, b)
    }

    pub fn bootstrap_value(&self, b: usize) -> Option<f32> {
        self.schema()
            .has(FieldKind::BootstrapValue)
            .then(|| self.f32_cell(FieldKind::BootstrapValue, 0, b)[0])
    }
}

/// The two alternating batch stores, indexed by the control block's `j`.
#[derive(Clone)]
pub struct DoubleBuffer {
    stores: [Arc<BatchStore>; 2],
}

impl DoubleBuffer {
    pub fn get(&self, j: usize) -> &Arc<BatchStore> {
        &self.stores[j]
    }

    pub fn shape(&self) -> BatchShape {
        self.stores[0].shape()
    }

    pub fn schema(&self) -> &FieldSchema {
        self.stores[0].schema()
    }

    /// Claims the same columns and fields in both stores.
    pub fn columns(&self, cols: Range<usize>, fields: FieldSet) -> Result<[ColumnView; 2]> {
        Ok([
            self.stores[0].columns(cols.clone(), fields)?,
            self.stores[1].columns(cols, fields)?,
        ])
    }
}

/// Creates both stores of the double buffer. Must run before any party is spawned, every party
/// receives handles to these two regions and never allocates its own.
pub fn allocate_double_buffer(shape: BatchShape, schema: FieldSchema) -> Result<DoubleBuffer> {
    if shape.t == 0 || shape.b == 0 {
        return Err(SamplerError::setup(format!(
            "batch shape {}x{} has no cells",
            shape.t, shape.b
        )));
    }
    let first = BatchStore::allocate(shape, schema.clone())?;
    let second = BatchStore::allocate(shape, schema)?;
    Ok(DoubleBuffer {
        stores: [Arc::new(first), Arc::new(second)],
    })
}
