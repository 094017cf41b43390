pub mod barrier;
pub mod control;
pub mod semaphore;

pub use barrier::Barrier;
pub use control::{ControlBlock, Fault, FaultLog, Round};
pub use semaphore::{Handshake, Semaphore};
