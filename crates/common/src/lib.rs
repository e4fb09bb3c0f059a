//! Shared configuration, error types, IDs, memory accounting, metrics and the
//! fixed-point decimal value for tundra crates.
//!
//! Architecture role:
//! - defines engine configuration passed from the client to execution nodes
//! - provides common [`TundraError`] / [`Result`] contracts
//! - hosts the prometheus registry and the query memory budget
//!
//! Key modules:
//! - [`config`]
//! - [`decimal`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod decimal;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::{EngineConfig, MAX_HASH_LEVEL};
pub use decimal::Decimal12;
pub use error::{ErrorKind, Result, TundraError};
pub use ids::*;
pub use memory::{MemoryBudget, MemoryPressure, MemoryPressureSignal, MemoryReservation};
pub use metrics::{global_metrics, MetricsRegistry, ScanTotals};
