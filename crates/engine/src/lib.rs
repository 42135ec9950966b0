//! # Dispatch Engine
//!
//! Lease-based job dispatch over a shared store. Several worker processes
//! share one backlog; ownership of a job is a lease recorded on the row and
//! taken, extended and released only through single-statement conditional
//! updates, so no two workers ever process the same job at once.
//!
//! ## Features
//!
//! - **Oldest-first claiming**: bounded candidate scans, silent race misses
//! - **Bounded concurrency**: semaphore admission, never drops a claimed job
//! - **In-band lease renewal**: each job races its work against its renewal
//! - **Bounded retries**: transient failures requeue, the Nth failure is terminal
//! - **Stale lease reclamation**: abandoned work returns to Pending
//! - **Prometheus metrics**: claims, outcomes, renewals, errors, in-flight, duration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DispatchEngine                          │
//! │  (poll loop: scan → claim → dispatch, reclaim loop)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            JobProcessor ∥ LeaseMonitor (per job)             │
//! │  (work slices raced against renewal, then OutcomeResolver)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobStore                              │
//! │  (PostgreSQL dispatch_requests, or in-memory for tests)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use docdispatch_engine::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryJobStore::new());
//! store
//!     .create(NewDispatch::new("user@example.com", "invoice.pdf"), chrono::Utc::now())
//!     .await?;
//!
//! let engine = DispatchEngine::with_random_verdict(
//!     store,
//!     DispatchConfig::default().with_max_concurrency(4),
//!     DispatchMetrics::new(),
//! );
//!
//! let token = CancellationToken::new();
//! engine.run(token).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod job;
pub mod metrics;
pub mod persistence;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::DispatchConfig;
    pub use crate::job::{DispatchJob, JobResolution, JobStatus, NewDispatch};
    pub use crate::metrics::DispatchMetrics;
    pub use crate::persistence::{
        InMemoryJobStore, JobStore, Pagination, PostgresJobStore, StatusSnapshot, StoreError,
    };
    pub use crate::worker::{
        DispatchEngine, EngineError, EngineStatus, JobOutcome, RandomVerdict, Verdict,
        VerdictStrategy,
    };
}

// Re-export main types at crate root
pub use config::DispatchConfig;
pub use job::{DispatchJob, JobResolution, JobStatus, NewDispatch};
pub use metrics::DispatchMetrics;
pub use persistence::{
    InMemoryJobStore, JobStore, Pagination, PostgresJobStore, StatusSnapshot, StoreError,
};
pub use worker::{
    DispatchEngine, EngineError, EngineStatus, JobOutcome, RandomVerdict, Verdict,
    VerdictStrategy,
};
