//! Execution layer: expressions, the multi-threaded scan node and hash aggregation.
//!
//! Architecture role:
//! - runtime state (config, metrics, memory budget, cancellation) shared by nodes
//! - pull-based [`ExecNode`] contract
//! - expression compilation and the scalar UDF registry
//! - [`ScanNode`] fan-out over scan ranges, [`AggregationNode`] on top
//!
//! Key modules:
//! - [`context`]
//! - [`exec_node`]
//! - [`expressions`]
//! - [`scan`]
//! - [`aggregate`]

pub mod aggregate;
pub mod batch;
mod builtins;
pub mod context;
pub mod exec_node;
pub mod expressions;
pub mod partition;
pub mod scalar;
pub mod scan;
pub mod udf;

pub use aggregate::{AggExpr, AggregateMode, AggregationNode};
pub use batch::RowBatch;
pub use context::{CancellationToken, RuntimeState};
pub use exec_node::{ExecNode, ValuesNode};
pub use expressions::{compile_expr, Expr, PhysicalExpr};
pub use partition::{PartRangeKey, PartitionIndex, PartitionInfo};
pub use scalar::ScalarValue;
pub use scan::{ScanNode, ScanRange, Scanner, ScannerCounter, ScannerFactory};
