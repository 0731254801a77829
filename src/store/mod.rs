//! Persistence: libSQL-backed storage for tasks and workflows.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Requeue};
