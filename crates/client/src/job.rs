use std::fs;
use std::path::Path;

use arrow_schema::Schema;
use serde::{Deserialize, Serialize};
use tundra_common::{EngineConfig, Result, TundraError};
use tundra_execution::aggregate::AggExpr;
use tundra_execution::expressions::Expr;
use tundra_execution::partition::PartitionInfo;
use tundra_execution::scan::ScanRange;

/// One aggregate output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAggregate {
    pub name: String,
    pub expr: AggExpr,
}

/// A scan, optionally followed by a grouped aggregation.
///
/// Input comes from `table` (resolved through the catalog) or from explicit
/// `ranges`; with explicit ranges the schema is `schema` or, when absent, the
/// schema of the first range's parquet file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub query_id: u64,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub ranges: Vec<ScanRange>,
    #[serde(default)]
    pub schema: Option<Schema>,
    /// Byte size of catalog-derived parquet ranges.
    #[serde(default)]
    pub range_bytes: Option<u64>,
    #[serde(default)]
    pub conjuncts: Vec<Expr>,
    #[serde(default)]
    pub partition_exprs: Vec<Expr>,
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
    #[serde(default)]
    pub group_by: Vec<Expr>,
    #[serde(default)]
    pub aggregates: Vec<NamedAggregate>,
    /// Overrides the runner's engine configuration for this job.
    #[serde(default)]
    pub config: Option<EngineConfig>,
}

impl JobSpec {
    pub fn from_json(s: &str) -> Result<Self> {
        let job: Self = serde_json::from_str(s)
            .map_err(|e| TundraError::Construction(format!("invalid job: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.table, self.ranges.is_empty()) {
            (Some(_), false) => Err(TundraError::Construction(
                "job sets both 'table' and 'ranges'".to_string(),
            )),
            (None, true) => Err(TundraError::Construction(
                "job needs a 'table' or explicit 'ranges'".to_string(),
            )),
            _ => Ok(()),
        }?;
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }

    /// True when the job aggregates its scan output.
    pub fn is_aggregation(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_expressions_and_aggregates_from_json() {
        let job = JobSpec::from_json(
            r#"{
                "table": "sales",
                "conjuncts": [{"BinaryOp": {"left": {"Column": "amount"}, "op": "Gt", "right": {"Literal": {"Int64": 0}}}}],
                "group_by": [{"Column": "region"}],
                "aggregates": [
                    {"name": "n", "expr": "CountStar"},
                    {"name": "total", "expr": {"Sum": {"Column": "amount"}}}
                ]
            }"#,
        )
        .expect("job");
        assert_eq!(job.table.as_deref(), Some("sales"));
        assert!(job.is_aggregation());
        assert_eq!(job.aggregates[0].expr, AggExpr::CountStar);
        assert_eq!(job.group_by, vec![Expr::Column("region".to_string())]);
    }

    #[test]
    fn rejects_jobs_without_input() {
        let err = JobSpec::from_json("{}").expect_err("no input");
        assert_eq!(err.kind(), tundra_common::ErrorKind::Construction);
    }
}
