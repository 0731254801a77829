//! Arq: async task queue and workflow orchestration core.

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod queue;
pub mod resilience;
pub mod store;
pub mod workflow;
