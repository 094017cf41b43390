pub mod arena;
pub mod batch_store;
pub mod partition;
pub mod schema;
pub mod step_buffer;

pub use arena::{ColumnView, SharedArena};
pub use batch_store::{BatchShape, BatchStore, DoubleBuffer, allocate_double_buffer};
pub use partition::EnvPartition;
pub use schema::{DType, ExampleRecord, FieldKind, FieldSchema, FieldSet, FieldSpec, Rows};
pub use step_buffer::StepBuffer;
