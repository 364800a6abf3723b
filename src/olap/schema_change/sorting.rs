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
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tracing::{debug, warn};

use crate::common::ids::TabletId;
use crate::common::status::{Status, StatusResult};
use crate::olap::block::record_batch_slice_bytes;
use crate::olap::block_changer::BlockChanger;
use crate::olap::block_merger::{BlockMerger, SortedRun};
use crate::olap::olap_common::Version;
use crate::olap::rowset::{
    PendingRowsetGuard, RowsetReader, RowsetSharedPtr, RowsetWriter, RowsetWriterContext,
};
use crate::olap::schema_change::{RowCounters, SchemaChange, check_row_nums_exact};
use crate::olap::storage_engine::StorageEnv;
use crate::olap::tablet::TabletSharedPtr;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

/// Share of the memory limit the sort buffer may hold before it is spilled
/// into a temporary rowset; the rest stays available to the merge.
const HOLD_BLOCK_MEMORY_RATE: f64 = 0.66;

/// Re-sorts converted rows under a memory budget.
///
/// Changed blocks are sorted as they arrive and buffered until the budget is
/// reached, then merged into a temporary rowset (a run). After the last block
/// the runs are read back and merged into the target writer, in several passes
/// when one pass over every run would not fit the budget.
pub struct SchemaChangeWithSorting {
    changer: Arc<BlockChanger>,
    merger: BlockMerger,
    env: Arc<dyn StorageEnv>,
    memory_limitation: usize,
    mem_tracker: Arc<MemTracker>,
    max_buffered_rows: usize,
    batch_size: usize,
    temp_delta_versions: Version,
    src_rowsets: Vec<RowsetSharedPtr>,
    counters: RowCounters,
}

/// One sorted block waiting in the buffer; the merge takes over its accounting.
struct BufferedBlock(Option<(RecordBatch, TrackedBytes)>);

impl SortedRun for BufferedBlock {
    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>> {
        Ok(self.0.take().map(|(block, _)| block))
    }
}

impl SchemaChangeWithSorting {
    pub fn new(
        changer: Arc<BlockChanger>,
        env: Arc<dyn StorageEnv>,
        parent_tracker: &Arc<MemTracker>,
        memory_limitation: usize,
        max_buffered_rows: usize,
        batch_size: usize,
    ) -> StatusResult<Self> {
        let merger = BlockMerger::new(changer.new_schema(), Arc::clone(changer.output_schema()))?;
        let limit = i64::try_from(memory_limitation).unwrap_or(i64::MAX);
        let mem_tracker = MemTracker::new_child(
            format!("SchemaChangeWithSorting:{}", changer.new_schema().schema_hash()),
            limit,
            parent_tracker,
        );
        Ok(Self {
            changer,
            merger,
            env,
            memory_limitation,
            mem_tracker,
            max_buffered_rows,
            batch_size: batch_size.max(1),
            temp_delta_versions: Version::new(-1, 0),
            src_rowsets: Vec::new(),
            counters: RowCounters::default(),
        })
    }

    fn take_src_rowsets(&mut self) -> Vec<RowsetSharedPtr> {
        std::mem::take(&mut self.src_rowsets)
    }

    /// Sort and merge the changed blocks, calling `on_run` for every run rowset built.
    fn sort_and_write(
        &mut self,
        reader: &mut dyn RowsetReader,
        writer: &mut dyn RowsetWriter,
        on_run: &mut dyn FnMut(&RowsetSharedPtr),
    ) -> StatusResult<()> {
        let source = Arc::clone(reader.rowset());
        let tablet_id = writer.context().tablet_id;
        self.temp_delta_versions.start = self.temp_delta_versions.end;
        self.src_rowsets.clear();

        let hold_limit = self.memory_limitation as f64 * HOLD_BLOCK_MEMORY_RATE;
        let mut blocks: Vec<BufferedBlock> = Vec::new();
        let mut buffered_rows = 0usize;
        let mut sorted_rows = 0usize;
        let mut sorted_bytes = 0usize;
        while let Some(ref_block) = reader.next_block()? {
            let changed = self.changer.change_block(&ref_block)?;
            self.counters.filtered_rows += changed.filtered_rows;
            let block = changed.block;
            if block.num_rows() == 0 {
                continue;
            }
            let block_bytes = record_batch_slice_bytes(&block)?;
            let over_rows = self.max_buffered_rows > 0
                && buffered_rows + block.num_rows() > self.max_buffered_rows;
            let consumption = self.mem_tracker.consumption().max(0) as f64;
            if consumption + block_bytes as f64 > hold_limit || over_rows {
                self.create_run(tablet_id, &source, &mut blocks, on_run)?;
                buffered_rows = 0;
                if self
                    .mem_tracker
                    .limit_exceeded(i64::try_from(block_bytes).unwrap_or(i64::MAX))
                {
                    return Err(Status::MemLimitExceeded(format!(
                        "Memory limitation is too small for Schema Change: memory_limitation={} block_bytes={} consumption={}",
                        self.memory_limitation,
                        block_bytes,
                        self.mem_tracker.consumption()
                    )));
                }
            }
            let sorted = self.merger.sort_block(&block)?;
            drop(block);
            let bytes = record_batch_slice_bytes(&sorted)?;
            buffered_rows += sorted.num_rows();
            sorted_rows += sorted.num_rows();
            sorted_bytes += bytes;
            let tracked = TrackedBytes::new(bytes, Arc::clone(&self.mem_tracker));
            blocks.push(BufferedBlock(Some((sorted, tracked))));
        }
        self.create_run(tablet_id, &source, &mut blocks, on_run)?;

        let fan_in = self.merge_fan_in(sorted_bytes.div_ceil(sorted_rows.max(1)));
        let mut live = self.src_rowsets.clone();
        while live.len() > fan_in {
            let mut next = Vec::with_capacity(live.len().div_ceil(fan_in));
            for group in live.chunks(fan_in) {
                match group {
                    [run] => next.push(Arc::clone(run)),
                    runs => {
                        let readers = self.open_runs(runs)?;
                        next.push(self.write_run(tablet_id, &source, readers, on_run)?);
                    }
                }
            }
            debug!(
                runs = live.len(),
                merged_into = next.len(),
                fan_in,
                "merged sorting runs into fewer runs"
            );
            live = next;
        }

        match live.as_slice() {
            [] => writer.flush(),
            [run] => {
                let run = Arc::clone(run);
                writer.add_rowset_for_linked_schema_change(&run)?;
                writer.flush()
            }
            runs => {
                let readers = self.open_runs(runs)?;
                let merged_rows = self.merger.merge_runs(
                    readers,
                    self.batch_size,
                    &self.mem_tracker,
                    |block| writer.add_block(&block),
                )?;
                self.counters.merged_rows += merged_rows;
                debug!(
                    tracker = self.mem_tracker.label(),
                    runs = runs.len(),
                    merged_rows,
                    peak_bytes = self.mem_tracker.peak_consumption(),
                    "merged sorting runs"
                );
                writer.flush()
            }
        }
    }

    /// How many runs one merge pass may read at once within the memory limit:
    /// each run holds a block of `batch_size` rows plus its encoded keys, and
    /// one output block is built on top.
    fn merge_fan_in(&self, bytes_per_row: usize) -> usize {
        let block_bytes = self.batch_size.saturating_mul(bytes_per_row.max(1));
        let per_run = block_bytes.saturating_mul(2);
        (self.memory_limitation.saturating_sub(block_bytes) / per_run).max(2)
    }

    fn open_runs(&self, runs: &[RowsetSharedPtr]) -> StatusResult<Vec<Box<dyn RowsetReader>>> {
        let factory = self.env.rowset_factory();
        runs.iter()
            .map(|run| factory.create_rowset_reader(Arc::clone(run), None, self.batch_size))
            .collect()
    }

    /// Merge the buffered blocks into one temporary rowset, releasing their memory.
    fn create_run(
        &mut self,
        tablet_id: TabletId,
        source: &RowsetSharedPtr,
        blocks: &mut Vec<BufferedBlock>,
        on_run: &mut dyn FnMut(&RowsetSharedPtr),
    ) -> StatusResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(blocks);
        self.write_run(tablet_id, source, buffered, on_run)?;
        Ok(())
    }

    /// Merge `runs` into a new temporary rowset tagged with the next temporary version.
    fn write_run<R: SortedRun>(
        &mut self,
        tablet_id: TabletId,
        source: &RowsetSharedPtr,
        runs: Vec<R>,
        on_run: &mut dyn FnMut(&RowsetSharedPtr),
    ) -> StatusResult<RowsetSharedPtr> {
        let version = Version::new(
            self.temp_delta_versions.end,
            self.temp_delta_versions.end + 1,
        );
        let context = RowsetWriterContext {
            rowset_id: self.env.next_rowset_id(),
            tablet_id,
            tablet_schema: Arc::clone(self.changer.new_schema()),
            version,
            segments_overlap: source.meta().segments_overlap,
            newest_write_timestamp: source.newest_write_timestamp(),
            delete_predicate: None,
        };
        let mut run_writer = self.env.rowset_factory().create_rowset_writer(context)?;
        let merged_rows = self.merger.merge_runs(
            runs,
            self.batch_size,
            &self.mem_tracker,
            |block| run_writer.add_block(&block),
        )?;
        let run = run_writer.build()?;
        on_run(&run);
        debug!(
            rowset_id = %run.rowset_id(),
            version = %version,
            rows = run.num_rows(),
            merged_rows,
            "built sorting run"
        );

        self.counters.merged_rows += merged_rows;
        self.src_rowsets.push(Arc::clone(&run));
        self.temp_delta_versions.end += 2;
        Ok(run)
    }
}

impl SchemaChange for SchemaChangeWithSorting {
    fn name(&self) -> &'static str {
        "sorting"
    }

    fn counters(&self) -> &RowCounters {
        &self.counters
    }

    fn counters_mut(&mut self) -> &mut RowCounters {
        &mut self.counters
    }

    fn inner_process(
        &mut self,
        reader: &mut dyn RowsetReader,
        writer: &mut dyn RowsetWriter,
        _new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        self.sort_and_write(reader, writer, &mut |_| {})
    }

    fn check_row_nums(&self, reader: &dyn RowsetReader, writer: &dyn RowsetWriter) -> bool {
        self.changer.has_where() || check_row_nums_exact(&self.counters, reader, writer)
    }
}

/// Sorting schema change on local storage.
///
/// Every run rowset is protected by a pending guard while the job lives, and
/// is handed to garbage collection once the rowset it came from is converted.
pub struct LocalSchemaChangeWithSorting {
    base: SchemaChangeWithSorting,
    env: Arc<dyn StorageEnv>,
    pending_rs_guards: Vec<PendingRowsetGuard>,
}

impl LocalSchemaChangeWithSorting {
    pub fn new(
        changer: Arc<BlockChanger>,
        env: Arc<dyn StorageEnv>,
        parent_tracker: &Arc<MemTracker>,
        memory_limitation: usize,
        max_buffered_rows: usize,
        batch_size: usize,
    ) -> StatusResult<Self> {
        let base = SchemaChangeWithSorting::new(
            changer,
            Arc::clone(&env),
            parent_tracker,
            memory_limitation,
            max_buffered_rows,
            batch_size,
        )?;
        Ok(Self {
            base,
            env,
            pending_rs_guards: Vec::new(),
        })
    }
}

impl SchemaChange for LocalSchemaChangeWithSorting {
    fn name(&self) -> &'static str {
        "local_sorting"
    }

    fn counters(&self) -> &RowCounters {
        self.base.counters()
    }

    fn counters_mut(&mut self) -> &mut RowCounters {
        self.base.counters_mut()
    }

    fn inner_process(
        &mut self,
        reader: &mut dyn RowsetReader,
        writer: &mut dyn RowsetWriter,
        _new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        let env = Arc::clone(&self.env);
        let guards = &mut self.pending_rs_guards;
        let res = self.base.sort_and_write(reader, writer, &mut |run| {
            guards.push(env.add_pending_rowset(run.rowset_id()));
        });
        for run in self.base.take_src_rowsets() {
            self.env.add_unused_rowset(run);
        }
        if let Err(e) = &res {
            warn!(
                version = %reader.version(),
                error = %e,
                "internal sorting failed"
            );
        }
        res
    }

    fn check_row_nums(&self, reader: &dyn RowsetReader, writer: &dyn RowsetWriter) -> bool {
        self.base.check_row_nums(reader, writer)
    }
}
