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
use std::fmt;
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::ids::{RowsetId, TabletId};
use crate::common::status::{Status, StatusResult};
use crate::olap::delete_handler::{DeleteHandler, DeletePredicate};
use crate::olap::olap_common::{SegmentsOverlap, Version};
use crate::olap::rowset::rowset_reader::{MemRowsetReader, RowsetReader};
use crate::olap::rowset::{Rowset, RowsetMeta, RowsetSharedPtr};
use crate::olap::tablet_schema::TabletSchemaSPtr;

#[derive(Clone, Debug)]
pub struct RowsetWriterContext {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub tablet_schema: TabletSchemaSPtr,
    pub version: Version,
    pub segments_overlap: SegmentsOverlap,
    pub newest_write_timestamp: i64,
    pub delete_predicate: Option<DeletePredicate>,
}

/// Accepts new-schema blocks and seals them into one rowset.
pub trait RowsetWriter: Send {
    fn rowset_id(&self) -> RowsetId;

    fn context(&self) -> &RowsetWriterContext;

    fn add_block(&mut self, block: &RecordBatch) -> StatusResult<()>;

    /// Reuse the segments of a storage-identical rowset without rewriting them.
    fn add_rowset_for_linked_schema_change(&mut self, rowset: &RowsetSharedPtr) -> StatusResult<()>;

    /// Seal buffered blocks into a segment.
    fn flush(&mut self) -> StatusResult<()>;

    fn build(&mut self) -> StatusResult<RowsetSharedPtr>;

    /// Rows accepted so far.
    fn num_rows(&self) -> usize;

    /// Rows the writer rejected on its own.
    fn num_rows_filtered(&self) -> usize;
}

/// Creates readers and writers for the engine's rowset storage.
pub trait RowsetFactory: Send + Sync + fmt::Debug {
    fn create_rowset_writer(
        &self,
        context: RowsetWriterContext,
    ) -> StatusResult<Box<dyn RowsetWriter>>;

    fn create_rowset_reader(
        &self,
        rowset: RowsetSharedPtr,
        delete_handler: Option<Arc<DeleteHandler>>,
        batch_size: usize,
    ) -> StatusResult<Box<dyn RowsetReader>>;
}

#[derive(Debug, Default)]
pub struct MemRowsetFactory;

impl RowsetFactory for MemRowsetFactory {
    fn create_rowset_writer(
        &self,
        context: RowsetWriterContext,
    ) -> StatusResult<Box<dyn RowsetWriter>> {
        Ok(Box::new(MemRowsetWriter::new(context)?))
    }

    fn create_rowset_reader(
        &self,
        rowset: RowsetSharedPtr,
        delete_handler: Option<Arc<DeleteHandler>>,
        batch_size: usize,
    ) -> StatusResult<Box<dyn RowsetReader>> {
        Ok(Box::new(MemRowsetReader::new(rowset, delete_handler, batch_size)))
    }
}

#[derive(Debug)]
pub struct MemRowsetWriter {
    context: RowsetWriterContext,
    output_schema: SchemaRef,
    pending: Vec<RecordBatch>,
    segments: Vec<RecordBatch>,
    num_rows: usize,
    built: bool,
}

impl MemRowsetWriter {
    pub fn new(context: RowsetWriterContext) -> StatusResult<Self> {
        let output_schema = context.tablet_schema.to_arrow_schema()?;
        Ok(Self {
            context,
            output_schema,
            pending: Vec::new(),
            segments: Vec::new(),
            num_rows: 0,
            built: false,
        })
    }

    fn check_open(&self) -> StatusResult<()> {
        if self.built {
            return Err(Status::Internal(format!(
                "rowset writer {} is already built",
                self.context.rowset_id
            )));
        }
        Ok(())
    }

    fn conform(&self, block: &RecordBatch) -> StatusResult<RecordBatch> {
        RecordBatch::try_new(Arc::clone(&self.output_schema), block.columns().to_vec()).map_err(
            |e| {
                Status::InvalidArgument(format!(
                    "block does not match rowset schema: rowset_id={} error={}",
                    self.context.rowset_id, e
                ))
            },
        )
    }
}

impl RowsetWriter for MemRowsetWriter {
    fn rowset_id(&self) -> RowsetId {
        self.context.rowset_id
    }

    fn context(&self) -> &RowsetWriterContext {
        &self.context
    }

    fn add_block(&mut self, block: &RecordBatch) -> StatusResult<()> {
        self.check_open()?;
        if block.num_rows() == 0 {
            return Ok(());
        }
        let block = self.conform(block)?;
        self.num_rows += block.num_rows();
        self.pending.push(block);
        Ok(())
    }

    fn add_rowset_for_linked_schema_change(&mut self, rowset: &RowsetSharedPtr) -> StatusResult<()> {
        self.check_open()?;
        if !rowset.schema().storage_equivalent(&self.context.tablet_schema) {
            return Err(Status::InvalidArgument(format!(
                "cannot link rowset {} with a different storage schema",
                rowset.rowset_id()
            )));
        }
        self.flush()?;
        for segment in rowset.segments() {
            let segment = self.conform(segment)?;
            self.segments.push(segment);
        }
        self.num_rows += rowset.num_rows();
        Ok(())
    }

    fn flush(&mut self) -> StatusResult<()> {
        self.check_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let segment = concat_batches(&self.output_schema, &self.pending)?;
        self.pending.clear();
        self.segments.push(segment);
        Ok(())
    }

    fn build(&mut self) -> StatusResult<RowsetSharedPtr> {
        self.flush()?;
        self.built = true;
        let segments = std::mem::take(&mut self.segments);
        let meta = RowsetMeta {
            rowset_id: self.context.rowset_id,
            tablet_id: self.context.tablet_id,
            version: self.context.version,
            num_rows: self.num_rows,
            num_segments: segments.len(),
            segments_overlap: self.context.segments_overlap,
            newest_write_timestamp: self.context.newest_write_timestamp,
            delete_predicate: self.context.delete_predicate.clone(),
        };
        Ok(Arc::new(Rowset::new(
            meta,
            Arc::clone(&self.context.tablet_schema),
            segments,
        )))
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_rows_filtered(&self) -> usize {
        0
    }
}
