use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tundra_common::{EngineConfig, ErrorKind, PlanNodeId, QueryId};
use tundra_execution::expressions::{col, lit, BinaryOp};
use tundra_execution::scan::{ScanNode, ScanRange, ScannerCounter, ScannerFactory};
use tundra_execution::{ExecNode, RuntimeState};
use tundra_storage::{
    parquet_schema, parquet_stats, StorageScannerFactory, TableDef, TableFormat, TableStats,
};

fn temp_file(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("tundra_{tag}_{nanos}.parquet"))
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("tag", DataType::Utf8, false),
    ]))
}

/// `rows` rows in row groups of `group_rows`.
fn write_fixture(rows: i64, group_rows: usize) -> PathBuf {
    let path = temp_file("fixture");
    let file = File::create(&path).expect("create");
    let props = WriterProperties::builder()
        .set_max_row_group_size(group_rows)
        .build();
    let mut writer = ArrowWriter::try_new(file, schema(), Some(props)).expect("writer");
    let ids: Vec<i64> = (0..rows).collect();
    let tags: Vec<String> = ids.iter().map(|i| format!("t{}", i % 3)).collect();
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(tags)),
        ],
    )
    .expect("batch");
    writer.write(&batch).expect("write");
    writer.close().expect("close");
    path
}

fn table(path: &PathBuf) -> TableDef {
    TableDef {
        name: "fixture".to_string(),
        uri: path.to_string_lossy().into_owned(),
        format: TableFormat::Parquet,
        schema: None,
        stats: TableStats::default(),
        options: HashMap::new(),
    }
}

fn scan_ids(node: &mut ScanNode, state: &RuntimeState) -> Vec<i64> {
    node.open(state).expect("open");
    let mut ids = Vec::new();
    while let Some(batch) = node.get_next(state).expect("next") {
        let col = batch
            .record_batch()
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("ids")
            .clone();
        ids.extend(col.values().iter().copied());
    }
    node.close(state).expect("close");
    ids.sort_unstable();
    ids
}

#[test]
fn byte_ranges_read_every_row_group_exactly_once() {
    let path = write_fixture(1_000, 100);
    let stats = parquet_stats(&path).expect("stats");
    assert_eq!(stats.rows, Some(1_000));
    assert_eq!(stats.row_groups, Some(10));

    let len = fs::metadata(&path).expect("metadata").len();
    for range_bytes in [len, len / 3 + 1, 512, 97] {
        let ranges = table(&path).scan_ranges(range_bytes, 0).expect("ranges");
        let config = EngineConfig {
            scanner_threads: 3,
            max_buffered_batches: 2,
            batch_size_rows: 64,
            ..EngineConfig::default()
        };
        let state = RuntimeState::new(QueryId(1), config);
        let mut node = ScanNode::new(
            PlanNodeId(1),
            parquet_schema(&path).expect("schema"),
            Arc::new(StorageScannerFactory::new(64)),
            ranges,
        );
        let ids = scan_ids(&mut node, &state);
        assert_eq!(ids, (0..1_000).collect::<Vec<_>>(), "range size {range_bytes}");
    }
    let _ = fs::remove_file(path);
}

#[test]
fn conjuncts_apply_to_parquet_batches() {
    let path = write_fixture(300, 50);
    let state = RuntimeState::new(QueryId(2), EngineConfig::default());
    let mut node = ScanNode::new(
        PlanNodeId(1),
        parquet_schema(&path).expect("schema"),
        Arc::new(StorageScannerFactory::new(1024)),
        table(&path).scan_ranges(1024, 0).expect("ranges"),
    )
    .with_conjuncts(vec![col("tag").binary(BinaryOp::Eq, lit("t1"))]);
    let ids = scan_ids(&mut node, &state);
    assert_eq!(ids.len(), 100);
    assert!(ids.iter().all(|i| i % 3 == 1));
    let _ = fs::remove_file(path);
}

#[test]
fn missing_file_surfaces_as_io_error() {
    let state = RuntimeState::new(QueryId(3), EngineConfig::default());
    let range = ScanRange {
        id: 0,
        uri: temp_file("missing").to_string_lossy().into_owned(),
        offset: 0,
        length: 0,
        options: HashMap::new(),
    };
    let factory = StorageScannerFactory::new(16);
    let err = factory
        .create_scanner(&range, &Arc::new(ScannerCounter::default()))
        .err()
        .expect("missing file");
    assert_eq!(err.kind(), ErrorKind::Io);

    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), vec![range]);
    node.open(&state).expect("open");
    let err = node.get_next(&state).expect_err("io failure");
    assert_eq!(err.kind(), ErrorKind::Io);
    node.close(&state).expect("close");
}

#[test]
fn memory_and_parquet_ranges_share_one_factory() {
    let path = write_fixture(20, 10);
    let factory = StorageScannerFactory::new(8);
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(vec![100, 101])),
            Arc::new(StringArray::from(vec!["m", "m"])),
        ],
    )
    .expect("batch");
    factory
        .memory()
        .register("extra", schema(), vec![batch])
        .expect("register");
    let mut ranges = table(&path).scan_ranges(u64::MAX, 0).expect("ranges");
    ranges.extend(factory.memory().ranges("extra", 1, 10).expect("memory ranges"));

    let state = RuntimeState::new(QueryId(4), EngineConfig::default());
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges);
    let ids = scan_ids(&mut node, &state);
    let mut expected: Vec<i64> = (0..20).collect();
    expected.extend([100, 101]);
    assert_eq!(ids, expected);
    let _ = fs::remove_file(path);
}
