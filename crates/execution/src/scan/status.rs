use std::sync::OnceLock;

use tundra_common::TundraError;

/// Set-once slot holding the first failure recorded by any scan worker.
///
/// Later failures are rejected so the root cause is what surfaces.
#[derive(Debug, Default)]
pub struct FirstErrorCell {
    slot: OnceLock<TundraError>,
}

impl FirstErrorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` if nothing was recorded yet. Returns `true` when `err` won.
    pub fn record(&self, err: TundraError) -> bool {
        self.slot.set(err).is_ok()
    }

    pub fn get(&self) -> Option<&TundraError> {
        self.slot.get()
    }

    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }
}
