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
//! Immutable versioned runs of rows and the reader/writer seams around them.
//!
//! Segments are kept as Arrow batches; the physical file layout is owned by
//! whatever [`RowsetFactory`] the engine is built with.

pub mod pending_rowset_helper;
pub mod rowset_reader;
pub mod rowset_writer;

use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use crate::common::ids::{RowsetId, TabletId};
use crate::olap::delete_handler::DeletePredicate;
use crate::olap::olap_common::{SegmentsOverlap, Version};
use crate::olap::tablet_schema::TabletSchemaSPtr;

pub use pending_rowset_helper::{PendingRowsetGuard, PendingRowsetSet};
pub use rowset_reader::{MemRowsetReader, RowsetReader};
pub use rowset_writer::{
    MemRowsetFactory, MemRowsetWriter, RowsetFactory, RowsetWriter, RowsetWriterContext,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub version: Version,
    pub num_rows: usize,
    pub num_segments: usize,
    pub segments_overlap: SegmentsOverlap,
    pub newest_write_timestamp: i64,
    pub delete_predicate: Option<DeletePredicate>,
}

#[derive(Debug)]
pub struct Rowset {
    meta: RowsetMeta,
    schema: TabletSchemaSPtr,
    segments: Vec<RecordBatch>,
}

pub type RowsetSharedPtr = Arc<Rowset>;

impl Rowset {
    pub fn new(meta: RowsetMeta, schema: TabletSchemaSPtr, segments: Vec<RecordBatch>) -> Self {
        Self {
            meta,
            schema,
            segments,
        }
    }

    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    pub fn version(&self) -> Version {
        self.meta.version
    }

    pub fn start_version(&self) -> i64 {
        self.meta.version.start
    }

    pub fn end_version(&self) -> i64 {
        self.meta.version.end
    }

    pub fn num_rows(&self) -> usize {
        self.meta.num_rows
    }

    pub fn empty(&self) -> bool {
        self.segments.iter().all(|s| s.num_rows() == 0)
    }

    pub fn schema(&self) -> &TabletSchemaSPtr {
        &self.schema
    }

    pub fn segments(&self) -> &[RecordBatch] {
        &self.segments
    }

    pub fn delete_predicate(&self) -> Option<&DeletePredicate> {
        self.meta.delete_predicate.as_ref()
    }

    pub fn newest_write_timestamp(&self) -> i64 {
        self.meta.newest_write_timestamp
    }
}
