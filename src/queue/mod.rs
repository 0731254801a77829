//! Durable task queue.

pub mod model;
pub mod task_queue;

pub use model::{NewTask, QueueStats, Task, TaskStatus};
pub use task_queue::{TaskQueue, spawn_maintenance_task};
