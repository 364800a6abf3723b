// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end alter jobs over in-memory tablets.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arrow::array::{ArrayRef, StringArray};
use arrow::record_batch::RecordBatch;

use crate::common::*;
use novarocks_schema_change::SchemaChangeJob;
use novarocks_schema_change::common::ids::SlotId;
use novarocks_schema_change::olap::delete_handler::{DeleteCondition, DeletePredicate};
use novarocks_schema_change::olap::expr::{CompareOp, SlotCompare};
use novarocks_schema_change::olap::olap_common::{
    AggregationType, AlterTabletType, KeysType, TabletState, Version,
};
use novarocks_schema_change::olap::schema_change::{AlterMaterializedViewParam, WHERE_SIGN};
use novarocks_schema_change::olap::storage_engine::SchemaChangeOptions;
use novarocks_schema_change::olap::tablet::Tablet;
use novarocks_schema_change::olap::tablet_schema::{TabletColumn, TabletSchema};
use novarocks_schema_change::{Status, StorageEngine};

mod common;

fn kv_schema(keys_type: KeysType) -> TabletSchema {
    schema(keys_type, vec![int_key(0, "k"), bigint_value(1, "v")])
}

fn kv_block(tablet: &Tablet, keys: Vec<i32>) -> RecordBatch {
    let values = keys.iter().map(|k| i64::from(*k) * 10).collect::<Vec<_>>();
    block(tablet, vec![ints(keys), longs(values)])
}

#[test]
fn test_direct_conversion_conserves_rows() {
    let engine = engine();
    let new_schema = schema(
        KeysType::DupKeys,
        vec![
            int_key(0, "k"),
            bigint_value(1, "v"),
            TabletColumn::new_value(2, "c", "INT").with_default("7"),
        ],
    );
    let (base, new) = register_tablets(&engine, kv_schema(KeysType::DupKeys), new_schema, false);
    add_rowset(&engine, &base, Version::new(0, 1), &[]);
    add_rowset(&engine, &base, Version::new(2, 2), &[kv_block(&base, (0..1000).collect())]);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-conserve")
        .process_alter_tablet(&req)
        .expect("alter tablet");

    assert_eq!(new.tablet_state(), TabletState::Running);
    let rowsets = new.rowsets();
    assert_eq!(rowsets.len(), 2);
    assert_eq!(rowsets[0].version(), Version::new(0, 1));
    assert_eq!(rowsets[0].num_rows(), 0);
    assert_eq!(rowsets[1].num_rows(), 1000);

    let rows = collect_rows(&new);
    assert_eq!(i32_values(&rows, 0), (0..1000).collect::<Vec<_>>());
    assert!(i32_values(&rows, 2).iter().all(|c| *c == 7));
    assert_eq!(base.num_rows(), 1000);
    assert!(!engine.tablet_in_converting(NEW_TABLET_ID));
    assert!(engine.pending_rowsets().is_empty());
}

#[test]
fn test_where_filter_waives_row_check() {
    for lossy in [false, true] {
        let factory = if lossy {
            TestRowsetFactory::lossy()
        } else {
            TestRowsetFactory::default()
        };
        let engine =
            StorageEngine::with_rowset_factory(SchemaChangeOptions::default(), Arc::new(factory));
        let (base, new) = register_tablets(
            &engine,
            kv_schema(KeysType::DupKeys),
            kv_schema(KeysType::DupKeys),
            false,
        );
        add_rowset(&engine, &base, Version::new(0, 1), &[]);
        add_rowset(&engine, &base, Version::new(2, 2), &[kv_block(&base, (0..1000).collect())]);

        let req = request(&base, &new, 2, AlterTabletType::Rollup).with_materialized_view_param(
            AlterMaterializedViewParam {
                column_name: WHERE_SIGN.to_string(),
                origin_column_name: None,
                mv_expr: Some(Arc::new(SlotCompare {
                    slot_id: SlotId::new(0),
                    op: CompareOp::Ge,
                    literal: "400".to_string(),
                })),
            },
        );
        SchemaChangeJob::new(Arc::clone(&engine), &req, "job-where")
            .process_alter_tablet(&req)
            .expect("alter tablet with where");

        let rows = collect_rows(&new);
        if lossy {
            assert!(rows.num_rows() < 600, "lossy rows={}", rows.num_rows());
        } else {
            assert_eq!(rows.num_rows(), 600);
            assert_eq!(i32_values(&rows, 0), (400..1000).collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_row_count_mismatch_leaves_new_tablet_untouched() {
    let engine = StorageEngine::with_rowset_factory(
        SchemaChangeOptions::default(),
        Arc::new(TestRowsetFactory::lossy()),
    );
    let new_schema = schema(
        KeysType::DupKeys,
        vec![
            int_key(0, "k"),
            bigint_value(1, "v"),
            TabletColumn::new_value(2, "c", "INT"),
        ],
    );
    let (base, new) = register_tablets(&engine, kv_schema(KeysType::DupKeys), new_schema, false);
    add_rowset(&engine, &base, Version::new(0, 1), &[]);
    add_rowset(&engine, &base, Version::new(2, 2), &[kv_block(&base, (0..100).collect())]);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-lossy")
        .process_alter_tablet(&req)
        .expect_err("row count mismatch");

    assert!(err.is_row_count_mismatch(), "err={}", err);
    assert_eq!(new.tablet_state(), TabletState::NotReady);
    assert!(new.rowsets().is_empty());
    assert_eq!(base.num_rows(), 100);
    assert_eq!(base.rowsets().len(), 2);
    // The converted [0-1] rowset is handed to garbage collection.
    assert_eq!(engine.unused_rowset_count(), 1);
    assert!(!engine.tablet_in_converting(NEW_TABLET_ID));
}

#[test]
fn test_linked_schema_change_reads_nothing() {
    let factory = Arc::new(TestRowsetFactory::default());
    let blocks_read = Arc::clone(&factory.blocks_read);
    let engine = StorageEngine::with_rowset_factory(SchemaChangeOptions::default(), factory);
    let (base, new) = register_tablets(
        &engine,
        kv_schema(KeysType::DupKeys),
        kv_schema(KeysType::DupKeys),
        false,
    );
    add_rowset(&engine, &base, Version::new(0, 1), &[]);
    let source = add_rowset(&engine, &base, Version::new(2, 2), &[kv_block(&base, (0..1000).collect())]);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-linked")
        .process_alter_tablet(&req)
        .expect("linked alter");

    assert_eq!(blocks_read.load(Ordering::SeqCst), 0);
    let linked = new.rowsets().pop().expect("linked rowset");
    assert_eq!(linked.version(), Version::new(2, 2));
    assert_eq!(linked.num_rows(), source.num_rows());
    assert_ne!(linked.rowset_id(), source.rowset_id());
}

#[test]
fn test_empty_source_is_converted_without_reading() {
    let factory = Arc::new(TestRowsetFactory::default());
    let blocks_read = Arc::clone(&factory.blocks_read);
    let engine = StorageEngine::with_rowset_factory(SchemaChangeOptions::default(), factory);
    let new_schema = schema(
        KeysType::DupKeys,
        vec![
            int_key(0, "k"),
            bigint_value(1, "v"),
            TabletColumn::new_value(2, "c", "INT").with_default("7"),
        ],
    );
    let (base, new) = register_tablets(&engine, kv_schema(KeysType::DupKeys), new_schema, false);
    add_rowset(&engine, &base, Version::new(0, 1), &[]);

    let req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-empty")
        .process_alter_tablet(&req)
        .expect("empty alter");

    assert_eq!(blocks_read.load(Ordering::SeqCst), 0);
    assert_eq!(new.tablet_state(), TabletState::Running);
    let rowsets = new.rowsets();
    assert_eq!(rowsets.len(), 1);
    assert_eq!(rowsets[0].version(), Version::new(0, 1));
    assert_eq!(rowsets[0].num_rows(), 0);
    assert_eq!(engine.unused_rowset_count(), 0);
}

#[test]
fn test_sorting_reorders_keys_and_keeps_last_write() {
    let engine = engine();
    let base_schema = schema(
        KeysType::DupKeys,
        vec![int_key(0, "a"), int_key(1, "b"), bigint_value(2, "v")],
    );
    let new_schema = schema(
        KeysType::UniqueKeys,
        vec![int_key(1, "b"), int_key(0, "a"), bigint_value(2, "v")],
    );
    let (base, new) = register_tablets(&engine, base_schema, new_schema, false);
    add_rowset(&engine, &base, Version::new(0, 1), &[]);
    add_rowset(
        &engine,
        &base,
        Version::new(2, 2),
        &[block(
            &base,
            vec![
                ints([1, 2, 1, 3]),
                ints([2, 1, 2, 0]),
                longs([10, 20, 11, 30]),
            ],
        )],
    );

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-sort")
        .process_alter_tablet(&req)
        .expect("sorting alter");

    let rows = collect_rows(&new);
    assert_eq!(i32_values(&rows, 0), vec![0, 1, 2]);
    assert_eq!(i32_values(&rows, 1), vec![3, 2, 1]);
    assert_eq!(i64_values(&rows, 2), vec![Some(30), Some(20), Some(11)]);
}

#[test]
fn test_sorting_under_row_budget_merges_runs_globally() {
    let options = SchemaChangeOptions {
        sort_max_buffered_rows: 250,
        batch_size: 100,
        ..SchemaChangeOptions::default()
    };
    let engine = StorageEngine::new(options);
    let (base, new) = swap_keys_tablets(&engine);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-runs")
        .process_alter_tablet(&req)
        .expect("multi-run sorting alter");

    // Runs of 200 rows each were spilled and then merged.
    assert_eq!(engine.unused_rowset_count(), 5);
    assert_sorted_by_b_then_a(&new);

    // Run guards die with the job, so every run can be reclaimed.
    assert_eq!(engine.gc_unused_rowsets(), 5);
    assert_eq!(engine.unused_rowset_count(), 0);
}

fn swap_keys_tablets(engine: &Arc<StorageEngine>) -> (Arc<Tablet>, Arc<Tablet>) {
    let base_schema = schema(
        KeysType::DupKeys,
        vec![int_key(0, "a"), int_key(1, "b"), bigint_value(2, "v")],
    );
    let new_schema = schema(
        KeysType::DupKeys,
        vec![int_key(1, "b"), int_key(0, "a"), bigint_value(2, "v")],
    );
    let (base, new) = register_tablets(engine, base_schema, new_schema, false);
    let a = (0..1000).map(|i| (i * 7919) % 1000).collect::<Vec<i32>>();
    let b = (0..1000).map(|i| i % 10).collect::<Vec<i32>>();
    let v = (0..1000).map(i64::from).collect::<Vec<i64>>();
    add_rowset(engine, &base, Version::new(0, 1), &[]);
    add_rowset(
        engine,
        &base,
        Version::new(2, 2),
        &[block(&base, vec![ints(a), ints(b), longs(v)])],
    );
    (base, new)
}

fn assert_sorted_by_b_then_a(new: &Tablet) {
    let rows = collect_rows(new);
    assert_eq!(rows.num_rows(), 1000);
    let keys = i32_values(&rows, 0)
        .into_iter()
        .zip(i32_values(&rows, 1))
        .collect::<Vec<_>>();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "output is not sorted by (b, a)");
}

#[test]
fn test_sorting_under_byte_budget_merges_runs_globally() {
    // 1000 rows of 16 bytes; the budget holds a bit over half of them.
    let budget = 10_000;
    let options = SchemaChangeOptions {
        memory_limitation_bytes: budget,
        batch_size: 50,
        ..SchemaChangeOptions::default()
    };
    let engine = StorageEngine::new(options);
    let (base, new) = swap_keys_tablets(&engine);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-byte-budget")
        .process_alter_tablet(&req)
        .expect("byte budget sorting alter");

    assert!(engine.unused_rowset_count() > 1, "expected several runs");
    assert_sorted_by_b_then_a(&new);
    let peak = engine.mem_tracker().peak_consumption();
    assert!(peak > 0);
    assert!(peak <= budget as i64, "peak={peak} budget={budget}");
}

#[test]
fn test_sorting_merges_many_runs_in_passes() {
    // Runs of 80 rows; a pass can only read three of them at once.
    let options = SchemaChangeOptions {
        memory_limitation_bytes: 2_400,
        batch_size: 20,
        ..SchemaChangeOptions::default()
    };
    let engine = StorageEngine::new(options);
    let (base, new) = swap_keys_tablets(&engine);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-passes")
        .process_alter_tablet(&req)
        .expect("multi-pass sorting alter");

    // 13 runs from the input plus the runs written by intermediate passes.
    let runs = engine.unused_rowset_count();
    assert!(runs > 13, "runs={runs}");
    assert_sorted_by_b_then_a(&new);
    assert_eq!(engine.gc_unused_rowsets(), runs);
    assert_eq!(engine.unused_rowset_count(), 0);
}

#[test]
fn test_sorting_fails_fast_when_budget_is_too_small() {
    let options = SchemaChangeOptions {
        memory_limitation_bytes: 16,
        ..SchemaChangeOptions::default()
    };
    let engine = StorageEngine::new(options);
    let base_schema = schema(
        KeysType::DupKeys,
        vec![int_key(0, "a"), int_key(1, "b"), bigint_value(2, "v")],
    );
    let new_schema = schema(
        KeysType::DupKeys,
        vec![int_key(1, "b"), int_key(0, "a"), bigint_value(2, "v")],
    );
    let (base, new) = register_tablets(&engine, base_schema, new_schema, false);
    add_rowset(
        &engine,
        &base,
        Version::new(0, 1),
        &[block(&base, vec![ints(0..100), ints(0..100), longs(0..100)])],
    );

    let req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-oom")
        .process_alter_tablet(&req)
        .expect_err("memory limit");
    assert!(err.is_mem_limit_exceeded(), "err={}", err);
    assert!(new.rowsets().is_empty());
}

#[test]
fn test_single_flight_admission() {
    let gate = ReaderGate::new();
    let engine = StorageEngine::with_rowset_factory(
        SchemaChangeOptions::default(),
        Arc::new(TestRowsetFactory::with_gate(Arc::clone(&gate))),
    );
    let new_schema = schema(
        KeysType::DupKeys,
        vec![
            int_key(0, "k"),
            bigint_value(1, "v"),
            TabletColumn::new_value(2, "c", "INT"),
        ],
    );
    let (base, new) = register_tablets(&engine, kv_schema(KeysType::DupKeys), new_schema, false);
    add_rowset(&engine, &base, Version::new(0, 1), &[kv_block(&base, (0..10).collect())]);
    let req = request(&base, &new, 1, AlterTabletType::SchemaChange);

    let first = {
        let engine = Arc::clone(&engine);
        let req = req.clone();
        std::thread::spawn(move || {
            SchemaChangeJob::new(engine, &req, "job-first").process_alter_tablet(&req)
        })
    };
    gate.entered.wait();

    let second = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-second");
    assert!(second.tablet_in_converting(NEW_TABLET_ID));
    let err = second.process_alter_tablet(&req).expect_err("conflict");
    assert!(err.is_alter_conflict(), "err={}", err);
    assert!(err.is_retryable());

    gate.release.wait();
    first
        .join()
        .expect("first job thread")
        .expect("first job succeeds");
    assert!(!engine.tablet_in_converting(NEW_TABLET_ID));

    // Admitted again; the tablet is already converted so only validation runs.
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-third")
        .process_alter_tablet(&req)
        .expect("re-admitted");
    assert_eq!(new.num_rows(), 10);
}

#[test]
fn test_merge_on_write_delete_bitmap_is_recomputed() {
    let engine = engine();
    let new_schema = schema(
        KeysType::UniqueKeys,
        vec![
            int_key(0, "k"),
            bigint_value(1, "v"),
            TabletColumn::new_value(2, "c", "INT"),
        ],
    );
    let (base, new) = register_tablets(&engine, kv_schema(KeysType::UniqueKeys), new_schema, true);
    add_rowset(&engine, &base, Version::new(0, 1), &[kv_block(&base, vec![1, 2, 3])]);
    add_rowset(&engine, &base, Version::new(2, 2), &[kv_block(&base, vec![2, 3])]);

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-mow")
        .process_alter_tablet(&req)
        .expect("merge-on-write alter");

    let first = new.rowsets()[0].rowset_id();
    let bitmap = new.delete_bitmap();
    assert_eq!(bitmap.cardinality(), 2);
    assert!(!bitmap.contains(first, 0, 0));
    assert!(bitmap.contains(first, 0, 1));
    assert!(bitmap.contains(first, 0, 2));
    assert_eq!(bitmap.get(&(first, 0, 2)).map(|b| b.len()), Some(2));
}

#[test]
fn test_aggregate_keys_are_folded_when_a_key_is_dropped() {
    let engine = engine();
    let base_schema = schema(
        KeysType::AggKeys,
        vec![
            int_key(0, "k1"),
            int_key(1, "k2"),
            bigint_value(2, "v").with_aggregation(AggregationType::Sum),
        ],
    );
    let new_schema = schema(
        KeysType::AggKeys,
        vec![
            int_key(0, "k1"),
            bigint_value(2, "v").with_aggregation(AggregationType::Sum),
        ],
    );
    let (base, new) = register_tablets(&engine, base_schema, new_schema, false);
    add_rowset(
        &engine,
        &base,
        Version::new(0, 1),
        &[block(
            &base,
            vec![ints([1, 1, 2]), ints([1, 2, 1]), longs([10, 5, 7])],
        )],
    );

    let req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-agg")
        .process_alter_tablet(&req)
        .expect("aggregate alter");

    let rows = collect_rows(&new);
    assert_eq!(i32_values(&rows, 0), vec![1, 2]);
    assert_eq!(i64_values(&rows, 1), vec![Some(15), Some(7)]);
}

#[test]
fn test_delete_predicates_are_applied_while_converting() {
    let engine = engine();
    let (base, new) = register_tablets(
        &engine,
        kv_schema(KeysType::DupKeys),
        kv_schema(KeysType::DupKeys),
        false,
    );
    add_rowset(&engine, &base, Version::new(0, 1), &[kv_block(&base, (0..10).collect())]);
    add_delete_rowset(
        &engine,
        &base,
        Version::new(2, 2),
        DeletePredicate {
            version: 2,
            conditions: vec![DeleteCondition::new("k", CompareOp::Lt, "5")],
        },
    );

    let req = request(&base, &new, 2, AlterTabletType::SchemaChange);
    SchemaChangeJob::new(Arc::clone(&engine), &req, "job-delete")
        .process_alter_tablet(&req)
        .expect("alter with delete predicate");

    let rows = collect_rows(&new);
    assert_eq!(i32_values(&rows, 0), vec![5, 6, 7, 8, 9]);
    assert_eq!(base.num_rows(), 10);
}

#[test]
fn test_lossy_cast_is_a_data_quality_error() {
    let engine = engine();
    let base_schema = schema(
        KeysType::DupKeys,
        vec![int_key(0, "k"), TabletColumn::new_value(1, "s", "VARCHAR(16)")],
    );
    let new_schema = schema(
        KeysType::DupKeys,
        vec![int_key(0, "k"), TabletColumn::new_value(1, "s", "INT")],
    );
    let (base, new) = register_tablets(&engine, base_schema, new_schema, false);
    let strings: ArrayRef = Arc::new(StringArray::from(vec!["1", "x"]));
    add_rowset(&engine, &base, Version::new(0, 1), &[block(&base, vec![ints([1, 2]), strings])]);

    let req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-cast")
        .process_alter_tablet(&req)
        .expect_err("bad cast");
    assert!(err.is_data_quality(), "err={}", err);
    assert_eq!(new.tablet_state(), TabletState::NotReady);
}

#[test]
fn test_alter_version_beyond_base_is_rejected() {
    let engine = engine();
    let (base, new) = register_tablets(
        &engine,
        kv_schema(KeysType::DupKeys),
        kv_schema(KeysType::DupKeys),
        false,
    );
    add_rowset(&engine, &base, Version::new(0, 1), &[kv_block(&base, vec![1])]);

    let req = request(&base, &new, 5, AlterTabletType::SchemaChange);
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-version")
        .process_alter_tablet(&req)
        .expect_err("version too new");
    assert!(
        err.to_string().contains("less than request version"),
        "err={}",
        err
    );
    assert!(new.rowsets().is_empty());
}

#[test]
fn test_missing_desc_tbl_and_tablets_are_reported() {
    let engine = engine();
    let (base, new) = register_tablets(
        &engine,
        kv_schema(KeysType::DupKeys),
        kv_schema(KeysType::DupKeys),
        false,
    );

    let mut req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    req.desc_tbl = None;
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-desc")
        .process_alter_tablet(&req)
        .expect_err("no desc tbl");
    assert!(err.to_string().contains("desc_tbl is not set"), "err={}", err);

    let mut req = request(&base, &new, 1, AlterTabletType::SchemaChange);
    req.new_tablet_id = 424242;
    let err = SchemaChangeJob::new(Arc::clone(&engine), &req, "job-missing")
        .process_alter_tablet(&req)
        .expect_err("no new tablet");
    assert!(matches!(err, Status::NotFound(_)), "err={}", err);
}
