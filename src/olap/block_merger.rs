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
//! Key ordering and duplicate-key merging for sort-based schema change.
//!
//! Blocks are sorted by the key columns of the new schema with the arrival
//! ordinal as the final tie-break, so rows with equal keys stay in read order.
//! Sorted runs are merged with a heap keyed by row-format keys; equal keys
//! pop in run order, which is again read order. Runs are streamed block by
//! block so the merge holds one block per run plus a window of encoded keys.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, PrimitiveBuilder, UInt32Array};
use arrow::compute::{
    SortColumn, SortOptions, interleave, lexsort_to_indices, take, take_record_batch,
};
use arrow::datatypes::{
    ArrowNativeTypeOp, ArrowPrimitiveType, DataType, Decimal128Type, Float32Type, Float64Type,
    Int8Type, Int16Type, Int32Type, Int64Type, SchemaRef,
};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, Rows, SortField};

use crate::common::status::{Status, StatusResult};
use crate::olap::block::record_batch_slice_bytes;
use crate::olap::olap_common::{AggregationType, KeysType};
use crate::olap::rowset::RowsetReader;
use crate::olap::tablet_schema::TabletSchema;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

/// What happens to rows whose keys are equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergePolicy {
    KeepAll,
    /// Keep one row per key: the largest sequence value, ties to the later row.
    KeepLast { sequence_col_idx: Option<usize> },
    /// Fold value columns with their aggregation, one entry per column.
    Aggregate { aggregations: Vec<AggregationType> },
}

impl MergePolicy {
    pub fn from_schema(schema: &TabletSchema) -> Self {
        match schema.keys_type() {
            KeysType::DupKeys => MergePolicy::KeepAll,
            KeysType::UniqueKeys | KeysType::PrimaryKeys => MergePolicy::KeepLast {
                sequence_col_idx: schema.sequence_col_idx(),
            },
            KeysType::AggKeys => MergePolicy::Aggregate {
                aggregations: schema.columns().iter().map(|c| c.aggregation).collect(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct MergedBlock {
    pub block: RecordBatch,
    pub merged_rows: usize,
}

#[derive(Debug)]
pub struct BlockMerger {
    num_key_columns: usize,
    policy: MergePolicy,
    output_schema: SchemaRef,
    key_converter: RowConverter,
}

impl BlockMerger {
    pub fn new(schema: &TabletSchema, output_schema: SchemaRef) -> StatusResult<Self> {
        let num_key_columns = schema.num_key_columns();
        let policy = MergePolicy::from_schema(schema);
        if num_key_columns == 0 && policy != MergePolicy::KeepAll {
            return Err(Status::InvalidArgument(format!(
                "{:?} table without key columns cannot merge rows",
                schema.keys_type()
            )));
        }
        let fields = output_schema
            .fields()
            .iter()
            .take(num_key_columns)
            .map(|f| SortField::new(f.data_type().clone()))
            .collect::<Vec<_>>();
        let key_converter = RowConverter::new(fields)?;
        Ok(Self {
            num_key_columns,
            policy,
            output_schema,
            key_converter,
        })
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Order a block by key, keeping read order among equal keys.
    pub fn sort_block(&self, batch: &RecordBatch) -> StatusResult<RecordBatch> {
        let num_rows = batch.num_rows();
        if num_rows <= 1 {
            return Ok(batch.clone());
        }
        let num_rows_u32 = u32::try_from(num_rows).map_err(|_| {
            Status::MemLimitExceeded(format!("sort run has too many rows: {num_rows}"))
        })?;
        let options = Some(SortOptions::default());
        let mut sort_columns = batch
            .columns()
            .iter()
            .take(self.num_key_columns)
            .map(|values| SortColumn {
                values: Arc::clone(values),
                options,
            })
            .collect::<Vec<_>>();
        sort_columns.push(SortColumn {
            values: Arc::new(UInt32Array::from_iter_values(0..num_rows_u32)),
            options,
        });
        let indices = lexsort_to_indices(&sort_columns, None)?;
        Ok(take_record_batch(batch, &indices)?)
    }

    /// Fold adjacent equal-key rows of a key-sorted block.
    pub fn merge_sorted_block(&self, batch: &RecordBatch) -> StatusResult<MergedBlock> {
        if self.policy == MergePolicy::KeepAll || batch.num_rows() <= 1 {
            return Ok(MergedBlock {
                block: batch.clone(),
                merged_rows: 0,
            });
        }
        let groups = self.group_ranges(batch)?;
        if groups.len() == batch.num_rows() {
            return Ok(MergedBlock {
                block: batch.clone(),
                merged_rows: 0,
            });
        }
        let block = match &self.policy {
            MergePolicy::KeepAll => batch.clone(),
            MergePolicy::KeepLast { sequence_col_idx } => {
                let picks = match sequence_col_idx {
                    Some(idx) => pick_by_order(batch.column(*idx), &groups, Ordering::Greater, true)?,
                    None => groups.iter().map(|&(_, end)| end - 1).collect(),
                };
                take_record_batch(batch, &to_indices(&picks)?)?
            }
            MergePolicy::Aggregate { aggregations } => {
                self.aggregate_groups(batch, &groups, aggregations)?
            }
        };
        Ok(MergedBlock {
            merged_rows: batch.num_rows() - block.num_rows(),
            block,
        })
    }

    fn group_ranges(&self, batch: &RecordBatch) -> StatusResult<Vec<(usize, usize)>> {
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return Ok(Vec::new());
        }
        let rows = self.convert_keys(batch)?;
        let mut ranges = Vec::new();
        let mut start = 0;
        for row in 1..num_rows {
            if rows.row(row) != rows.row(row - 1) {
                ranges.push((start, row));
                start = row;
            }
        }
        ranges.push((start, num_rows));
        Ok(ranges)
    }

    fn convert_keys(&self, batch: &RecordBatch) -> StatusResult<Rows> {
        Ok(self
            .key_converter
            .convert_columns(&batch.columns()[..self.num_key_columns])?)
    }

    fn aggregate_groups(
        &self,
        batch: &RecordBatch,
        groups: &[(usize, usize)],
        aggregations: &[AggregationType],
    ) -> StatusResult<RecordBatch> {
        let mut columns = Vec::with_capacity(batch.num_columns());
        for (idx, column) in batch.columns().iter().enumerate() {
            let merged = if idx < self.num_key_columns {
                let picks = groups.iter().map(|&(start, _)| start).collect::<Vec<_>>();
                take(column.as_ref(), &to_indices(&picks)?, None)?
            } else {
                let aggregation = aggregations.get(idx).copied().unwrap_or_default();
                aggregate_column(column, groups, aggregation)?
            };
            columns.push(merged);
        }
        Ok(RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?)
    }

    /// K-way merge of key-sorted runs, emitting blocks of about `batch_size` rows.
    ///
    /// Runs are pulled one block at a time. Every loaded block, the encoded
    /// keys of each cursor window and each output block are charged to
    /// `mem_tracker`. A block never splits a key group, so duplicates are
    /// folded across run boundaries. Returns the number of rows folded away.
    pub fn merge_runs<R, F>(
        &self,
        runs: Vec<R>,
        batch_size: usize,
        mem_tracker: &Arc<MemTracker>,
        mut sink: F,
    ) -> StatusResult<usize>
    where
        R: SortedRun,
        F: FnMut(RecordBatch) -> StatusResult<()>,
    {
        let batch_size = batch_size.max(1);
        let key_window = (batch_size / runs.len().max(1)).max(1);
        let mut sources: Vec<(RecordBatch, TrackedBytes)> = Vec::new();
        let mut cursors: Vec<Option<MergeCursor<R>>> = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for (run_idx, run) in runs.into_iter().enumerate() {
            let cursor = self.open_cursor(run, key_window, &mut sources, mem_tracker)?;
            if let Some(cursor) = &cursor {
                heap.push(MergeHeapEntry {
                    key: cursor.keys.0.row(0).owned(),
                    run_idx,
                    row_idx: 0,
                });
            }
            cursors.push(cursor);
        }

        let mut pending = Vec::with_capacity(batch_size);
        let mut last_key: Option<OwnedRow> = None;
        let mut merged_rows = 0usize;
        while let Some(entry) = heap.pop() {
            let new_group = last_key.as_ref().is_none_or(|key| *key != entry.key);
            if new_group && pending.len() >= batch_size {
                merged_rows += self.flush_pending(&sources, &mut pending, mem_tracker, &mut sink)?;
                compact_sources(&mut cursors, &mut sources);
            }
            let Some(cursor) = cursors.get_mut(entry.run_idx).and_then(Option::as_mut) else {
                return Err(Status::Internal(format!(
                    "merge cursor {} popped after its run ended",
                    entry.run_idx
                )));
            };
            pending.push((cursor.source_idx, entry.row_idx));
            match self.advance(cursor, entry.row_idx, key_window, &mut sources, mem_tracker)? {
                Some((row_idx, key)) => heap.push(MergeHeapEntry {
                    key,
                    run_idx: entry.run_idx,
                    row_idx,
                }),
                None => {
                    if let Some(slot) = cursors.get_mut(entry.run_idx) {
                        *slot = None;
                    }
                }
            }
            last_key = Some(entry.key);
        }
        if !pending.is_empty() {
            merged_rows += self.flush_pending(&sources, &mut pending, mem_tracker, &mut sink)?;
        }
        Ok(merged_rows)
    }

    fn open_cursor<R: SortedRun>(
        &self,
        mut run: R,
        key_window: usize,
        sources: &mut Vec<(RecordBatch, TrackedBytes)>,
        mem_tracker: &Arc<MemTracker>,
    ) -> StatusResult<Option<MergeCursor<R>>> {
        let Some(source_idx) = load_block(&mut run, sources, mem_tracker)? else {
            return Ok(None);
        };
        let block = &sources[source_idx].0;
        let keys = self.key_window(block, 0, key_window, mem_tracker)?;
        Ok(Some(MergeCursor {
            num_rows: block.num_rows(),
            run,
            source_idx,
            keys_start: 0,
            keys,
        }))
    }

    /// Move a cursor past `row_idx`, pulling the next block once the current one ends.
    fn advance<R: SortedRun>(
        &self,
        cursor: &mut MergeCursor<R>,
        row_idx: usize,
        key_window: usize,
        sources: &mut Vec<(RecordBatch, TrackedBytes)>,
        mem_tracker: &Arc<MemTracker>,
    ) -> StatusResult<Option<(usize, OwnedRow)>> {
        let next = row_idx + 1;
        if next < cursor.num_rows {
            if next >= cursor.keys_start + cursor.keys.0.num_rows() {
                let block = &sources[cursor.source_idx].0;
                cursor.keys = self.key_window(block, next, key_window, mem_tracker)?;
                cursor.keys_start = next;
            }
            let key = cursor.keys.0.row(next - cursor.keys_start).owned();
            return Ok(Some((next, key)));
        }
        let Some(source_idx) = load_block(&mut cursor.run, sources, mem_tracker)? else {
            return Ok(None);
        };
        let block = &sources[source_idx].0;
        cursor.keys = self.key_window(block, 0, key_window, mem_tracker)?;
        cursor.num_rows = block.num_rows();
        cursor.source_idx = source_idx;
        cursor.keys_start = 0;
        Ok(Some((0, cursor.keys.0.row(0).owned())))
    }

    fn key_window(
        &self,
        block: &RecordBatch,
        start: usize,
        window: usize,
        mem_tracker: &Arc<MemTracker>,
    ) -> StatusResult<(Rows, TrackedBytes)> {
        let len = window.min(block.num_rows().saturating_sub(start));
        let columns = block.columns()[..self.num_key_columns]
            .iter()
            .map(|column| column.slice(start, len))
            .collect::<Vec<_>>();
        let keys = self.key_converter.convert_columns(&columns)?;
        let tracked = TrackedBytes::new(keys.size(), Arc::clone(mem_tracker));
        Ok((keys, tracked))
    }

    fn flush_pending<F>(
        &self,
        sources: &[(RecordBatch, TrackedBytes)],
        pending: &mut Vec<(usize, usize)>,
        mem_tracker: &Arc<MemTracker>,
        sink: &mut F,
    ) -> StatusResult<usize>
    where
        F: FnMut(RecordBatch) -> StatusResult<()>,
    {
        let mut columns = Vec::with_capacity(self.output_schema.fields().len());
        for column_idx in 0..self.output_schema.fields().len() {
            let arrays = sources
                .iter()
                .map(|(block, _)| block.column(column_idx).as_ref())
                .collect::<Vec<&dyn Array>>();
            columns.push(interleave(&arrays, pending.as_slice())?);
        }
        pending.clear();
        let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?;
        let _output = TrackedBytes::new(record_batch_slice_bytes(&batch)?, Arc::clone(mem_tracker));
        let merged = self.merge_sorted_block(&batch)?;
        sink(merged.block)?;
        Ok(merged.merged_rows)
    }
}

/// A key-sorted sequence of blocks feeding [`BlockMerger::merge_runs`].
pub trait SortedRun {
    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>>;
}

impl SortedRun for Box<dyn RowsetReader> {
    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>> {
        RowsetReader::next_block(self.as_mut())
    }
}

/// Read position of one run: the source block it points into and the
/// encoded keys of the rows starting at `keys_start`.
struct MergeCursor<R> {
    run: R,
    source_idx: usize,
    num_rows: usize,
    keys_start: usize,
    keys: (Rows, TrackedBytes),
}

/// Pull the next non-empty block of `run` into `sources`, returning its index.
fn load_block<R: SortedRun>(
    run: &mut R,
    sources: &mut Vec<(RecordBatch, TrackedBytes)>,
    mem_tracker: &Arc<MemTracker>,
) -> StatusResult<Option<usize>> {
    while let Some(block) = run.next_block()? {
        if block.num_rows() == 0 {
            continue;
        }
        let tracked = TrackedBytes::new(record_batch_slice_bytes(&block)?, Arc::clone(mem_tracker));
        sources.push((block, tracked));
        return Ok(Some(sources.len() - 1));
    }
    Ok(None)
}

/// Drop every source block no live cursor points into. Only valid while no
/// rows are pending.
fn compact_sources<R>(
    cursors: &mut [Option<MergeCursor<R>>],
    sources: &mut Vec<(RecordBatch, TrackedBytes)>,
) {
    let mut previous = std::mem::take(sources)
        .into_iter()
        .map(Some)
        .collect::<Vec<_>>();
    for cursor in cursors.iter_mut().flatten() {
        if let Some(source) = previous.get_mut(cursor.source_idx).and_then(Option::take) {
            sources.push(source);
            cursor.source_idx = sources.len() - 1;
        }
    }
}

#[derive(Debug)]
struct MergeHeapEntry {
    key: OwnedRow,
    run_idx: usize,
    row_idx: usize,
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHeapEntry {}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap keeps the largest element on top; reverse to pop the smallest key.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.run_idx.cmp(&self.run_idx))
            .then_with(|| other.row_idx.cmp(&self.row_idx))
    }
}

fn to_indices(picks: &[usize]) -> StatusResult<UInt32Array> {
    picks
        .iter()
        .map(|&row| {
            u32::try_from(row)
                .map_err(|_| Status::Internal(format!("row index overflows u32: {row}")))
        })
        .collect::<StatusResult<Vec<_>>>()
        .map(UInt32Array::from)
}

fn aggregate_column(
    column: &ArrayRef,
    groups: &[(usize, usize)],
    aggregation: AggregationType,
) -> StatusResult<ArrayRef> {
    let picks = match aggregation {
        AggregationType::Sum => return sum_groups(column, groups),
        AggregationType::Min => pick_by_order(column, groups, Ordering::Less, false)?,
        AggregationType::Max => pick_by_order(column, groups, Ordering::Greater, false)?,
        AggregationType::None | AggregationType::Replace => {
            groups.iter().map(|&(_, end)| end - 1).collect()
        }
        AggregationType::ReplaceIfNotNull => groups
            .iter()
            .map(|&(start, end)| {
                (start..end)
                    .rev()
                    .find(|&row| column.is_valid(row))
                    .unwrap_or(end - 1)
            })
            .collect(),
    };
    Ok(take(column.as_ref(), &to_indices(&picks)?, None)?)
}

/// Per group, the row whose value compares `wanted` against every other.
///
/// Without `nulls_compete` nulls are skipped and only an all-null group picks a null.
/// Ties go to the later row when picking the greatest value.
fn pick_by_order(
    column: &ArrayRef,
    groups: &[(usize, usize)],
    wanted: Ordering,
    nulls_compete: bool,
) -> StatusResult<Vec<usize>> {
    let converter = RowConverter::new(vec![SortField::new(column.data_type().clone())])?;
    let rows = converter.convert_columns(std::slice::from_ref(column))?;
    let mut picks = Vec::with_capacity(groups.len());
    for &(start, end) in groups {
        let mut best: Option<usize> = None;
        for row in start..end {
            if !nulls_compete && column.is_null(row) {
                continue;
            }
            best = match best {
                None => Some(row),
                Some(current) => {
                    let ord = rows.row(row).cmp(&rows.row(current));
                    if ord == wanted || (ord == Ordering::Equal && wanted == Ordering::Greater) {
                        Some(row)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        picks.push(best.unwrap_or(end - 1));
    }
    Ok(picks)
}

fn sum_groups(column: &ArrayRef, groups: &[(usize, usize)]) -> StatusResult<ArrayRef> {
    match column.data_type() {
        DataType::Int8 => sum_primitive_groups::<Int8Type>(column, groups),
        DataType::Int16 => sum_primitive_groups::<Int16Type>(column, groups),
        DataType::Int32 => sum_primitive_groups::<Int32Type>(column, groups),
        DataType::Int64 => sum_primitive_groups::<Int64Type>(column, groups),
        DataType::Float32 => sum_primitive_groups::<Float32Type>(column, groups),
        DataType::Float64 => sum_primitive_groups::<Float64Type>(column, groups),
        DataType::Decimal128(_, _) => sum_primitive_groups::<Decimal128Type>(column, groups),
        other => Err(Status::NotSupported(format!(
            "SUM aggregation is not supported for {other:?}"
        ))),
    }
}

/// Sum each group, skipping nulls. An overflowing sum fails the merge.
fn sum_primitive_groups<T: ArrowPrimitiveType>(
    column: &ArrayRef,
    groups: &[(usize, usize)],
) -> StatusResult<ArrayRef> {
    let array = column.as_primitive::<T>();
    let mut builder = PrimitiveBuilder::<T>::with_capacity(groups.len())
        .with_data_type(column.data_type().clone());
    for &(start, end) in groups {
        let mut acc: Option<T::Native> = None;
        for row in start..end {
            if array.is_valid(row) {
                let value = array.value(row);
                acc = Some(match acc {
                    Some(sum) => sum.add_checked(value).map_err(|e| {
                        Status::DataQuality(format!(
                            "SUM overflows {} at row {row}: {e}",
                            column.data_type()
                        ))
                    })?,
                    None => value,
                });
            }
        }
        builder.append_option(acc);
    }
    Ok(Arc::new(builder.finish()))
}
