pub mod action_server;
pub mod buffers;
pub mod config;
pub mod env;
pub mod env_builder;
pub mod error;
pub mod offline;
pub mod policy;
pub mod rng;
pub mod sampler;
pub mod sync;
pub mod trajectory;
mod worker;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use action_server::{ActionServer, NoHooks, ServeEvent, ServeHooks};
pub use config::{SamplerConfig, SamplerMode};
pub use error::{Result, SamplerError};
pub use sampler::{ParallelSampler, Samples};
pub use trajectory::{TrajectoryQueue, TrajectoryRecord};
