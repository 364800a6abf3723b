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
//! Fixtures shared by the schema change integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;

use novarocks_schema_change::common::status::StatusResult;
use novarocks_schema_change::olap::delete_handler::{DeleteHandler, DeletePredicate};
use novarocks_schema_change::olap::expr::DescriptorTbl;
use novarocks_schema_change::olap::olap_common::{
    AlterTabletType, KeysType, SegmentsOverlap, TabletState, Version,
};
use novarocks_schema_change::olap::rowset::{
    MemRowsetFactory, MemRowsetReader, MemRowsetWriter, RowsetFactory, RowsetReader,
    RowsetSharedPtr, RowsetWriter, RowsetWriterContext,
};
use novarocks_schema_change::olap::schema_change::AlterTabletRequest;
use novarocks_schema_change::olap::storage_engine::{SchemaChangeOptions, StorageEnv};
use novarocks_schema_change::olap::tablet::{Tablet, TabletSharedPtr};
use novarocks_schema_change::olap::tablet_schema::{TabletColumn, TabletSchema};
use novarocks_schema_change::{StorageEngine, novarocks_logging};

pub const BASE_TABLET_ID: i64 = 10001;
pub const NEW_TABLET_ID: i64 = 10002;

pub fn engine() -> Arc<StorageEngine> {
    novarocks_logging::init_from_config();
    StorageEngine::new(SchemaChangeOptions::default())
}

pub fn int_key(unique_id: i32, name: &str) -> TabletColumn {
    TabletColumn::new_key(unique_id, name, "INT")
}

pub fn bigint_value(unique_id: i32, name: &str) -> TabletColumn {
    TabletColumn::new_value(unique_id, name, "BIGINT")
}

pub fn schema(keys_type: KeysType, columns: Vec<TabletColumn>) -> TabletSchema {
    TabletSchema::new(keys_type, columns).expect("tablet schema")
}

/// Register a base tablet in `Running` state and a new tablet in `NotReady` state.
pub fn register_tablets(
    engine: &StorageEngine,
    base_schema: TabletSchema,
    new_schema: TabletSchema,
    merge_on_write: bool,
) -> (TabletSharedPtr, TabletSharedPtr) {
    let base = Arc::new(
        Tablet::new(BASE_TABLET_ID, Arc::new(base_schema), TabletState::Running)
            .with_merge_on_write(merge_on_write),
    );
    let new = Arc::new(
        Tablet::new(NEW_TABLET_ID, Arc::new(new_schema), TabletState::NotReady)
            .with_merge_on_write(merge_on_write),
    );
    engine.add_tablet(Arc::clone(&base)).expect("add base tablet");
    engine.add_tablet(Arc::clone(&new)).expect("add new tablet");
    (base, new)
}

pub fn block(tablet: &Tablet, columns: Vec<ArrayRef>) -> RecordBatch {
    let schema = tablet.tablet_schema().to_arrow_schema().expect("arrow schema");
    RecordBatch::try_new(schema, columns).expect("record batch")
}

pub fn ints(values: impl IntoIterator<Item = i32>) -> ArrayRef {
    Arc::new(Int32Array::from_iter_values(values))
}

pub fn longs(values: impl IntoIterator<Item = i64>) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(values))
}

/// Write `blocks` as one rowset of `tablet` at `version`.
pub fn add_rowset(
    engine: &StorageEngine,
    tablet: &Tablet,
    version: Version,
    blocks: &[RecordBatch],
) -> RowsetSharedPtr {
    write_rowset(engine, tablet, version, blocks, None)
}

/// An empty rowset carrying a delete predicate committed at its version.
pub fn add_delete_rowset(
    engine: &StorageEngine,
    tablet: &Tablet,
    version: Version,
    predicate: DeletePredicate,
) -> RowsetSharedPtr {
    write_rowset(engine, tablet, version, &[], Some(predicate))
}

fn write_rowset(
    engine: &StorageEngine,
    tablet: &Tablet,
    version: Version,
    blocks: &[RecordBatch],
    delete_predicate: Option<DeletePredicate>,
) -> RowsetSharedPtr {
    let mut writer = MemRowsetWriter::new(RowsetWriterContext {
        rowset_id: engine.next_rowset_id(),
        tablet_id: tablet.tablet_id(),
        tablet_schema: Arc::clone(tablet.tablet_schema()),
        version,
        segments_overlap: SegmentsOverlap::NonOverlapping,
        newest_write_timestamp: 0,
        delete_predicate,
    })
    .expect("rowset writer");
    for block in blocks {
        writer.add_block(block).expect("add block");
    }
    let rowset = writer.build().expect("build rowset");
    tablet.add_rowset(Arc::clone(&rowset)).expect("add rowset");
    rowset
}

pub fn request(
    base: &Tablet,
    new: &Tablet,
    alter_version: i64,
    alter_tablet_type: AlterTabletType,
) -> AlterTabletRequest {
    AlterTabletRequest::new(base.tablet_id(), new.tablet_id(), alter_version, alter_tablet_type)
        .with_desc_tbl(DescriptorTbl::from_schema(base.tablet_schema()))
}

/// Every row of `tablet` in version order, segment by segment.
pub fn collect_rows(tablet: &Tablet) -> RecordBatch {
    let schema = tablet.tablet_schema().to_arrow_schema().expect("arrow schema");
    let segments = tablet
        .rowsets()
        .iter()
        .flat_map(|rs| rs.segments().to_vec())
        .collect::<Vec<_>>();
    concat_batches(&schema, &segments).expect("concat rows")
}

pub fn i32_values(batch: &RecordBatch, idx: usize) -> Vec<i32> {
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column");
    array.values().to_vec()
}

pub fn i64_values(batch: &RecordBatch, idx: usize) -> Vec<Option<i64>> {
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect()
}

/// Two-phase gate: the first gated reader waits on `entered`, then on `release`.
#[derive(Debug)]
pub struct ReaderGate {
    pub entered: Barrier,
    pub release: Barrier,
}

impl ReaderGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        })
    }
}

/// Rowset factory that can count reads, lose rows on write or park a reader.
#[derive(Debug, Default)]
pub struct TestRowsetFactory {
    inner: MemRowsetFactory,
    pub drop_last_row_of_each_block: AtomicBool,
    pub blocks_read: Arc<AtomicUsize>,
    gate: Mutex<Option<Arc<ReaderGate>>>,
}

impl TestRowsetFactory {
    pub fn lossy() -> Self {
        let factory = Self::default();
        factory
            .drop_last_row_of_each_block
            .store(true, Ordering::SeqCst);
        factory
    }

    /// Park the first reader of a non-empty rowset at its first block.
    pub fn with_gate(gate: Arc<ReaderGate>) -> Self {
        let factory = Self::default();
        *factory.gate.lock().expect("gate lock") = Some(gate);
        factory
    }
}

impl RowsetFactory for TestRowsetFactory {
    fn create_rowset_writer(
        &self,
        context: RowsetWriterContext,
    ) -> StatusResult<Box<dyn RowsetWriter>> {
        let inner = self.inner.create_rowset_writer(context)?;
        if self.drop_last_row_of_each_block.load(Ordering::SeqCst) {
            Ok(Box::new(LossyRowsetWriter { inner }))
        } else {
            Ok(inner)
        }
    }

    fn create_rowset_reader(
        &self,
        rowset: RowsetSharedPtr,
        delete_handler: Option<Arc<DeleteHandler>>,
        batch_size: usize,
    ) -> StatusResult<Box<dyn RowsetReader>> {
        let gate = if rowset.num_rows() > 0 {
            self.gate.lock().expect("gate lock").take()
        } else {
            None
        };
        Ok(Box::new(TestRowsetReader {
            inner: MemRowsetReader::new(rowset, delete_handler, batch_size),
            blocks_read: Arc::clone(&self.blocks_read),
            gate,
        }))
    }
}

struct TestRowsetReader {
    inner: MemRowsetReader,
    blocks_read: Arc<AtomicUsize>,
    gate: Option<Arc<ReaderGate>>,
}

impl RowsetReader for TestRowsetReader {
    fn rowset(&self) -> &RowsetSharedPtr {
        self.inner.rowset()
    }

    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>> {
        if let Some(gate) = self.gate.take() {
            gate.entered.wait();
            gate.release.wait();
        }
        self.blocks_read.fetch_add(1, Ordering::SeqCst);
        self.inner.next_block()
    }

    fn filtered_rows(&self) -> usize {
        self.inner.filtered_rows()
    }
}

/// Silently loses the last row of every block it is given.
struct LossyRowsetWriter {
    inner: Box<dyn RowsetWriter>,
}

impl RowsetWriter for LossyRowsetWriter {
    fn rowset_id(&self) -> novarocks_schema_change::common::ids::RowsetId {
        self.inner.rowset_id()
    }

    fn context(&self) -> &RowsetWriterContext {
        self.inner.context()
    }

    fn add_block(&mut self, block: &RecordBatch) -> StatusResult<()> {
        let rows = block.num_rows();
        if rows > 1 {
            self.inner.add_block(&block.slice(0, rows - 1))
        } else {
            self.inner.add_block(block)
        }
    }

    fn add_rowset_for_linked_schema_change(&mut self, rowset: &RowsetSharedPtr) -> StatusResult<()> {
        self.inner.add_rowset_for_linked_schema_change(rowset)
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.inner.flush()
    }

    fn build(&mut self) -> StatusResult<RowsetSharedPtr> {
        self.inner.build()
    }

    fn num_rows(&self) -> usize {
        self.inner.num_rows()
    }

    fn num_rows_filtered(&self) -> usize {
        self.inner.num_rows_filtered()
    }
}
