//! Redis-backed queue adapters

pub mod message;
pub mod partition;
pub mod stream;
pub mod task;

pub use message::{QueueReply, Task, TaskResult};
pub use partition::PartitionConsumer;
pub use stream::{StreamConsumer, StreamProducer};
pub use task::{TaskProducer, TaskWorker};
