// HTTP API
//
// - dispatches: submission and query
// - ops: remediation actions and status overview
// - system: health and Prometheus metrics

pub mod common;
pub mod dispatches;
pub mod ops;
pub mod system;

pub use common::{ErrorResponse, PagedResponse};
