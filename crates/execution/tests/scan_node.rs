use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use tundra_common::{EngineConfig, ErrorKind, PlanNodeId, QueryId, Result, TundraError};
use tundra_execution::aggregate::{AggExpr, AggregateMode, AggregationNode};
use tundra_execution::expressions::{col, compile_expr, lit, BinaryOp};
use tundra_execution::partition::{PartRangeKey, PartitionInfo};
use tundra_execution::scan::{ScanNode, ScanRange, Scanner, ScannerCounter, ScannerFactory};
use tundra_execution::{ExecNode, RuntimeState, ScalarValue};

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

fn ranges(n: u64) -> Vec<ScanRange> {
    (0..n)
        .map(|id| ScanRange {
            id,
            uri: format!("test://{id}"),
            offset: 0,
            length: 0,
            options: HashMap::new(),
        })
        .collect()
}

/// Emits `rows_per_range` rows per range in batches of `batch_rows`;
/// `k = row % cardinality`, `v = range id`.
struct SyntheticFactory {
    rows_per_range: usize,
    batch_rows: usize,
    cardinality: i64,
    infinite: bool,
    delay: Duration,
    fail_range: Option<u64>,
    /// The failing scanner waits for this before erroring.
    release_failure: Arc<AtomicBool>,
    created: Arc<AtomicU64>,
}

impl SyntheticFactory {
    fn new(rows_per_range: usize, batch_rows: usize, cardinality: i64) -> Self {
        Self {
            rows_per_range,
            batch_rows,
            cardinality,
            infinite: false,
            delay: Duration::ZERO,
            fail_range: None,
            release_failure: Arc::new(AtomicBool::new(true)),
            created: Arc::new(AtomicU64::new(0)),
        }
    }
}

struct SyntheticScanner {
    schema: SchemaRef,
    range: u64,
    emitted: usize,
    total: usize,
    batch_rows: usize,
    cardinality: i64,
    infinite: bool,
    delay: Duration,
    fail: Option<Arc<AtomicBool>>,
    on_exhausted: Option<Arc<AtomicBool>>,
}

impl Scanner for SyntheticScanner {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if let Some(release) = &self.fail {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !release.load(Ordering::Acquire) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(TundraError::Io(std::io::Error::other(format!(
                "range {} unreadable",
                self.range
            ))));
        }
        if !self.infinite && self.emitted >= self.total {
            if let Some(flag) = &self.on_exhausted {
                flag.store(true, Ordering::Release);
            }
            return Ok(None);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let n = if self.infinite {
            self.batch_rows
        } else {
            self.batch_rows.min(self.total - self.emitted)
        };
        let ks: Vec<i64> = (self.emitted..self.emitted + n)
            .map(|r| r as i64 % self.cardinality)
            .collect();
        self.emitted += n;
        let batch = RecordBatch::try_new(
            Arc::clone(&self.schema),
            vec![
                Arc::new(Int64Array::from(ks)),
                Arc::new(Int64Array::from(vec![self.range as i64; n])),
            ],
        )
        .map_err(|e| TundraError::Internal(e.to_string()))?;
        Ok(Some(batch))
    }
}

impl ScannerFactory for SyntheticFactory {
    fn create_scanner(
        &self,
        range: &ScanRange,
        _counter: &Arc<ScannerCounter>,
    ) -> Result<Box<dyn Scanner>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let fail = (self.fail_range == Some(range.id)).then(|| Arc::clone(&self.release_failure));
        // The last range releases the failing scanner once it is exhausted.
        let last = self.fail_range.is_some() && range.id == 3;
        Ok(Box::new(SyntheticScanner {
            schema: schema(),
            range: range.id,
            emitted: 0,
            total: self.rows_per_range,
            batch_rows: self.batch_rows,
            cardinality: self.cardinality,
            infinite: self.infinite,
            delay: self.delay,
            fail,
            on_exhausted: last.then(|| Arc::clone(&self.release_failure)),
        }))
    }
}

fn state(threads: usize, capacity: usize) -> RuntimeState {
    let config = EngineConfig {
        scanner_threads: threads,
        max_buffered_batches: capacity,
        ..EngineConfig::default()
    };
    RuntimeState::new(QueryId(7), config)
}

fn drain(node: &mut ScanNode, state: &RuntimeState) -> Result<Vec<RecordBatch>> {
    let mut out = Vec::new();
    while let Some(batch) = node.get_next(state)? {
        out.push(batch.into_record_batch());
    }
    Ok(out)
}

#[test]
fn three_ranges_two_workers_aggregate_to_ten_groups() {
    let state = state(2, 2);
    let factory = Arc::new(SyntheticFactory::new(100, 25, 10));
    let scan = ScanNode::new(PlanNodeId(1), schema(), factory, ranges(3));
    let mut agg = AggregationNode::try_new(
        PlanNodeId(2),
        Box::new(scan),
        vec![col("k")],
        vec![(AggExpr::CountStar, "n".to_string())],
        AggregateMode::Update,
        true,
    )
    .expect("aggregation");

    agg.open(&state).expect("open");
    let mut groups = 0;
    let mut total = 0;
    while let Some(batch) = agg.get_next(&state).expect("next") {
        let counts = batch
            .record_batch()
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("counts")
            .clone();
        groups += counts.len();
        total += counts.values().iter().sum::<i64>();
        assert!(counts.values().iter().all(|c| *c == 30));
    }
    agg.close(&state).expect("close");
    assert_eq!(groups, 10);
    assert_eq!(total, 300);
}

#[test]
fn io_failure_on_second_range_surfaces_after_other_worker_finishes() {
    let state = state(2, 2);
    let mut factory = SyntheticFactory::new(100, 10, 10);
    // Worker 0 owns ranges 0 and 1, worker 1 owns ranges 2 and 3.
    factory.fail_range = Some(1);
    factory.release_failure = Arc::new(AtomicBool::new(false));
    let release = Arc::clone(&factory.release_failure);
    let created = Arc::clone(&factory.created);
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(4));

    node.open(&state).expect("open");
    let err = drain(&mut node, &state).expect_err("io failure");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(release.load(Ordering::Acquire), "worker 1 exhausted its last range");
    assert_eq!(created.load(Ordering::SeqCst), 4);

    // Fail-fast on every later call.
    assert_eq!(node.get_next(&state).expect_err("still failed").kind(), ErrorKind::Io);
    node.close(&state).expect("close");
    node.close(&state).expect("close is idempotent");

    let stats = node.stats();
    assert_eq!(
        stats.queue.produced,
        stats.queue.delivered + stats.queue.discarded
    );
}

#[test]
fn close_mid_scan_stops_workers_promptly() {
    let state = state(4, 2);
    let mut factory = SyntheticFactory::new(0, 16, 4);
    factory.infinite = true;
    factory.delay = Duration::from_millis(1);
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(8));

    node.open(&state).expect("open");
    for _ in 0..5 {
        assert!(node.get_next(&state).expect("batch").is_some());
    }
    let started = Instant::now();
    node.close(&state).expect("close");
    assert!(started.elapsed() < Duration::from_secs(5));

    let after_close = node.stats().queue;
    thread::sleep(Duration::from_millis(50));
    let later = node.stats().queue;
    assert_eq!(after_close.produced, later.produced, "no pushes after close");
    assert_eq!(later.produced, later.delivered + later.discarded);
    assert_eq!(later.delivered, 5);
}

#[test]
fn close_releases_producers_blocked_on_a_full_queue() {
    let state = state(3, 1);
    let factory = SyntheticFactory::new(1_000, 1, 5);
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(3));
    node.open(&state).expect("open");
    thread::sleep(Duration::from_millis(50));
    assert!(node.stats().queue.max_depth <= 1);
    let started = Instant::now();
    node.close(&state).expect("close");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn cancellation_token_wakes_blocked_consumer() {
    let state = Arc::new(state(1, 1));
    let mut factory = SyntheticFactory::new(0, 1, 1);
    factory.infinite = true;
    factory.delay = Duration::from_millis(300);
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(1));
    node.open(&state).expect("open");

    let canceller = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state.cancellation().cancel();
        })
    };
    let err = node.get_next(&state).expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    canceller.join().expect("canceller");
    drop(node);
}

#[test]
fn conjuncts_filter_rows_and_every_batch_is_accounted_for() {
    let state = state(3, 2);
    let factory = SyntheticFactory::new(90, 7, 9);
    let schema = schema();
    let mut node = ScanNode::new(PlanNodeId(1), schema, Arc::new(factory), ranges(5))
        .with_conjuncts(vec![col("k").binary(BinaryOp::Lt, lit(3_i64))]);
    node.open(&state).expect("open");
    let batches = drain(&mut node, &state).expect("drain");
    node.close(&state).expect("close");

    let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
    assert_eq!(rows, 5 * 30);
    let stats = node.stats();
    assert_eq!(stats.rows.rows_read, 5 * 90);
    assert_eq!(stats.rows.rows_filtered, 5 * 60);
    assert_eq!(stats.queue.produced, stats.queue.delivered + stats.queue.discarded);
    assert_eq!(stats.queue.discarded, 0);
}

#[test]
fn partition_ids_follow_key_ranges() {
    let state = state(2, 4);
    let factory = SyntheticFactory::new(20, 20, 20);
    let key = |v: i64| PartRangeKey::Key(vec![ScalarValue::Int64(v)]);
    let infos = vec![
        PartitionInfo {
            id: 10,
            start: PartRangeKey::NegInfinite,
            end: key(5),
        },
        PartitionInfo {
            id: 20,
            start: key(5),
            end: key(15),
        },
    ];
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(2))
        .with_partitions(vec![col("k")], infos);
    node.prepare(&state).expect("prepare");

    let probe = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(vec![0, 4, 5, 14, 15, 99])),
            Arc::new(Int64Array::from(vec![0; 6])),
        ],
    )
    .expect("probe batch");
    let exprs = vec![compile_expr(&col("k"), &schema()).expect("expr")];
    let found: Vec<_> = (0..probe.num_rows())
        .map(|row| node.get_partition_id(&exprs, &probe, row).expect("lookup"))
        .collect();
    assert_eq!(found, vec![Some(10), Some(10), Some(20), Some(20), None, None]);

    node.open(&state).expect("open");
    let mut seen = Vec::new();
    while let Some(batch) = node.get_next(&state).expect("next") {
        let ks = batch
            .record_batch()
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("k")
            .clone();
        let ids = batch.partition_ids().expect("partition ids").to_vec();
        for (k, id) in ks.values().iter().zip(ids) {
            seen.push((*k, id));
        }
    }
    node.close(&state).expect("close");
    // Keys 15..20 match no partition and are dropped.
    assert_eq!(seen.len(), 2 * 15);
    assert!(seen.iter().all(|(k, id)| if *k < 5 { *id == 10 } else { *id == 20 }));
    assert_eq!(node.stats().rows.rows_without_partition, 2 * 5);
}

#[test]
fn bad_partition_layout_fails_at_prepare() {
    let state = state(1, 1);
    let factory = SyntheticFactory::new(1, 1, 1);
    let key = |v: i64| PartRangeKey::Key(vec![ScalarValue::Int64(v)]);
    let mut node = ScanNode::new(PlanNodeId(1), schema(), Arc::new(factory), ranges(1))
        .with_partitions(
            vec![col("k")],
            vec![
                PartitionInfo {
                    id: 1,
                    start: key(0),
                    end: key(10),
                },
                PartitionInfo {
                    id: 2,
                    start: key(5),
                    end: key(20),
                },
            ],
        );
    let err = node.open(&state).expect_err("overlap");
    assert_eq!(err.kind(), ErrorKind::Construction);
    node.close(&state).expect("close after failed open");
}

#[test]
fn scan_totals_reach_prometheus() {
    let state = state(2, 2);
    let factory = SyntheticFactory::new(10, 5, 2);
    let mut node = ScanNode::new(PlanNodeId(3), schema(), Arc::new(factory), ranges(2));
    node.open(&state).expect("open");
    let batches = drain(&mut node, &state).expect("drain");
    node.close(&state).expect("close");
    assert_eq!(batches.len(), 4);

    let text = state.metrics().render_prometheus();
    assert!(text.contains("tundra_scan_batches_delivered_total"));
    assert!(text.contains("node_id=\"3\""));
}

#[test]
fn more_threads_than_ranges_and_no_ranges() {
    let state = state(8, 2);
    let mut node = ScanNode::new(
        PlanNodeId(1),
        schema(),
        Arc::new(SyntheticFactory::new(10, 10, 1)),
        ranges(2),
    );
    node.open(&state).expect("open");
    assert_eq!(drain(&mut node, &state).expect("drain").len(), 2);
    node.close(&state).expect("close");

    let mut empty = ScanNode::new(
        PlanNodeId(2),
        schema(),
        Arc::new(SyntheticFactory::new(10, 10, 1)),
        Vec::new(),
    );
    empty.open(&state).expect("open");
    assert!(empty.get_next(&state).expect("eos").is_none());
    empty.close(&state).expect("close");
}

#[test]
fn every_range_is_scanned_once_across_workers() {
    let mut seen = Vec::new();
    let state = state(3, 3);
    let mut node = ScanNode::new(
        PlanNodeId(1),
        schema(),
        Arc::new(SyntheticFactory::new(12, 4, 3)),
        ranges(6),
    );
    node.open(&state).expect("open");
    while let Some(b) = node.get_next(&state).expect("next") {
        let v = b
            .record_batch()
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("v")
            .value(0);
        seen.push(v);
    }
    node.close(&state).expect("close");
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(node.stats().rows.rows_returned, 72);
}
