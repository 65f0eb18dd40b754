//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobStore`] and [`JobConnection`] traits for job storage and advisory locks
//! - [`InMemoryJobStore`] for testing
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryJobStore, MemoryConnection};
pub use postgres::{PostgresConnection, PostgresJobStore, MIGRATOR};
pub use store::{JobConnection, JobStore, StoreError};
