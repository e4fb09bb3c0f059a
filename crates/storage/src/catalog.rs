use std::collections::HashMap;
use std::fs;
use std::path::Path;

use arrow_schema::Schema;
use serde::{Deserialize, Serialize};
use tundra_common::{Result, TundraError};
use tundra_execution::scan::ScanRange;

use crate::memory::MEMORY_SCHEME;
use crate::stats::TableStats;

/// Default byte size of one parquet scan range.
pub const DEFAULT_RANGE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Parquet,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// A parquet file or a directory of parquet files; ignored for memory tables.
    #[serde(default)]
    pub uri: String,
    pub format: TableFormat,
    #[serde(default)]
    pub schema: Option<Schema>,
    #[serde(default)]
    pub stats: TableStats,
    /// Copied into every scan range of the table.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl TableDef {
    /// Parquet files behind `uri`, sorted by path.
    pub fn data_paths(&self) -> Result<Vec<String>> {
        let path = Path::new(self.uri.strip_prefix("file://").unwrap_or(&self.uri));
        if !path.is_dir() {
            return Ok(vec![path.to_string_lossy().into_owned()]);
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            if p.extension().is_some_and(|ext| ext == "parquet") {
                files.push(p.to_string_lossy().into_owned());
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(TundraError::Construction(format!(
                "no parquet files under {}",
                path.display()
            )));
        }
        Ok(files)
    }

    /// Split the table into scan ranges of at most `range_bytes` bytes.
    ///
    /// Memory tables become a single range over all registered batches.
    pub fn scan_ranges(&self, range_bytes: u64, first_id: u64) -> Result<Vec<ScanRange>> {
        if self.format == TableFormat::Memory {
            return Ok(vec![ScanRange {
                id: first_id,
                uri: format!("{MEMORY_SCHEME}{}", self.name),
                offset: 0,
                length: 0,
                options: self.options.clone(),
            }]);
        }
        if range_bytes == 0 {
            return Err(TundraError::Construction(
                "scan range size must be > 0".to_string(),
            ));
        }
        let mut ranges = Vec::new();
        let mut id = first_id;
        for path in self.data_paths()? {
            let len = fs::metadata(&path)?.len();
            let mut offset = 0;
            loop {
                let length = range_bytes.min(len - offset);
                ranges.push(ScanRange {
                    id,
                    uri: path.clone(),
                    offset,
                    length: length.max(1),
                    options: self.options.clone(),
                });
                id += 1;
                offset += length;
                if offset >= len {
                    break;
                }
            }
        }
        Ok(ranges)
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, TableDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn get(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| TundraError::Construction(format!("unknown table: {name}")))
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load a JSON array of [`TableDef`]s.
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let tables: Vec<TableDef> = serde_json::from_str(&s)
            .map_err(|e| TundraError::Construction(format!("invalid catalog: {e}")))?;
        let mut cat = Catalog::new();
        for t in tables {
            cat.register_table(t);
        }
        Ok(cat)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("tundra_catalog_{tag}_{nanos}"))
    }

    #[test]
    fn splits_files_into_contiguous_ranges() {
        let path = temp_path("split.parquet");
        fs::write(&path, vec![0_u8; 250]).expect("write");
        let table = TableDef {
            name: "t".to_string(),
            uri: path.to_string_lossy().into_owned(),
            format: TableFormat::Parquet,
            schema: None,
            stats: TableStats::default(),
            options: HashMap::new(),
        };
        let ranges = table.scan_ranges(100, 10).expect("ranges");
        let spans: Vec<_> = ranges.iter().map(|r| (r.id, r.offset, r.length)).collect();
        assert_eq!(spans, vec![(10, 0, 100), (11, 100, 100), (12, 200, 50)]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn loads_catalog_json_and_reports_unknown_tables() {
        let path = temp_path("catalog.json");
        fs::write(
            &path,
            r#"[{"name":"sales","format":"memory"},{"name":"lineitem","uri":"/data/li","format":"parquet","options":{"k":"v"}}]"#,
        )
        .expect("write");
        let cat = Catalog::load_from_json(&path).expect("load");
        assert_eq!(cat.table_names(), vec!["lineitem", "sales"]);
        let ranges = cat.get("sales").expect("sales").scan_ranges(1, 0).expect("ranges");
        assert_eq!(ranges[0].uri, "mem://sales");
        assert_eq!(cat.get("lineitem").expect("li").options["k"], "v");
        assert!(cat.get("missing").is_err());
        let _ = fs::remove_file(path);
    }
}
