//! Persistence layer for dispatch jobs
//!
//! This module provides:
//! - [`JobStore`] trait with the conditional-update primitives the engine needs
//! - [`InMemoryJobStore`] for tests and single-process runs
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{JobStore, Pagination, StatusSnapshot, StoreError};
