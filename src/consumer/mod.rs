//! Task consumers: handler contract, registry and the worker pool.

pub mod handler;
pub mod pool;

pub use handler::{NoopHandler, TaskHandler, TaskHandlerRegistry, TaskLifecycleHook};
pub use pool::TaskConsumerPool;
