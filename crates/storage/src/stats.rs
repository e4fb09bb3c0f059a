use serde::{Deserialize, Serialize};

/// Size information for one table, from the catalog or parquet footers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: Option<u64>,
    pub bytes: Option<u64>,
    #[serde(default)]
    pub row_groups: Option<u64>,
}

impl TableStats {
    /// Sum of two stats; unknown on either side stays unknown.
    pub fn merge(self, other: Self) -> Self {
        let add = |a: Option<u64>, b: Option<u64>| Some(a? + b?);
        Self {
            rows: add(self.rows, other.rows),
            bytes: add(self.bytes, other.bytes),
            row_groups: add(self.row_groups, other.row_groups),
        }
    }
}
