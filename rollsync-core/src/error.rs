use crate::trajectory::TrajectoryRecord;
use std::any::Any;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SamplerError>;

#[derive(Debug, Error)]
pub enum SamplerError {
    /// Raised before any party is spawned, nothing is left running.
    #[error("sampler setup failed: {0}")]
    Setup(String),

    #[error("could not derive the sample schema: {0}")]
    Schema(String),

    #[error("invalid environment partition: {0}")]
    Partition(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A party faulted inside a round. The round still completed, `buffer_index` names the store
    /// a sampling round wrote and `traj_infos` holds every trajectory it finished.
    #[error("worker {rank} faulted: {message}")]
    Worker {
        rank: usize,
        message: String,
        buffer_index: Option<usize>,
        traj_infos: Vec<TrajectoryRecord>,
    },

    #[error("shared memory: {0}")]
    Memory(#[from] std::io::Error),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl SamplerError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    /// A fault outside of a sampling round, nothing was collected.
    pub fn worker(rank: usize, message: impl Into<String>) -> Self {
        Self::Worker {
            rank,
            message: message.into(),
            buffer_index: None,
            traj_infos: vec![],
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked without a message".into())
}
