//! Dispatch worker
//!
//! This module provides:
//! - [`DispatchEngine`] - Poll loop, dispatcher and stale lease reclaimer
//! - [`JobPoller`] - Candidate scanning and conditional-update claiming
//! - [`Dispatcher`] - Semaphore-bounded fan-out of claimed jobs
//! - [`LeaseMonitor`] - Per-job lease renewal
//! - [`JobProcessor`] - Sliced work raced against the lease monitor
//! - [`OutcomeResolver`] - Retry/terminal state machine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DispatchEngine                          │
//! │  ┌─────────────┐                    ┌─────────────────────┐  │
//! │  │  JobPoller  │                    │  Stale Reclaimer    │  │
//! │  │ scan+claim  │                    │  (lease duration)   │  │
//! │  └──────┬──────┘                    └─────────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          Dispatcher (Semaphore-limited)              │    │
//! │  │  [Job 1] [Job 2] [Job 3] ... [Job C]                 │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │ each job                                           │
//! │         ▼                                                    │
//! │  JobProcessor ──select── LeaseMonitor                        │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  OutcomeResolver ──▶ JobStore::resolve                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod engine;
mod lease;
mod poller;
mod pool;
mod processor;
mod resolver;

pub use engine::{DispatchEngine, EngineError, EngineStatus};
pub use lease::{LeaseMonitor, RenewalOutcome};
pub use poller::JobPoller;
pub use pool::{DispatchSummary, Dispatcher};
pub use processor::JobProcessor;
pub use resolver::{decide, JobOutcome, OutcomeResolver, RandomVerdict, Verdict, VerdictStrategy};
