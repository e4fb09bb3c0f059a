//! Concurrent scan: worker threads, the bounded batch queue and the scan node.

mod node;
mod queue;
mod scanner;
mod status;
mod worker;

pub use node::{ScanNode, ScanStats};
pub use queue::{BatchQueue, PushOutcome, QueueStats};
pub use scanner::{
    ScanRange, ScanRangeTask, Scanner, ScannerCounter, ScannerCounts, ScannerFactory,
};
pub use status::FirstErrorCell;
