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

use crate::common::status::StatusResult;
use crate::olap::delete_handler::DeleteHandler;
use crate::olap::olap_common::Version;
use crate::olap::rowset::RowsetSharedPtr;

/// Sequential block reader over one immutable rowset.
pub trait RowsetReader: Send {
    fn rowset(&self) -> &RowsetSharedPtr;

    fn version(&self) -> Version {
        self.rowset().version()
    }

    /// Next non-empty block, or `None` once the rowset is exhausted.
    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>>;

    /// Rows the reader dropped itself, e.g. rows hidden by newer delete predicates.
    fn filtered_rows(&self) -> usize;
}

/// Reads in-memory segments in slices of `batch_size` rows.
#[derive(Debug)]
pub struct MemRowsetReader {
    rowset: RowsetSharedPtr,
    delete_handler: Option<Arc<DeleteHandler>>,
    batch_size: usize,
    segment_idx: usize,
    offset: usize,
    filtered_rows: usize,
}

impl MemRowsetReader {
    pub fn new(
        rowset: RowsetSharedPtr,
        delete_handler: Option<Arc<DeleteHandler>>,
        batch_size: usize,
    ) -> Self {
        Self {
            rowset,
            delete_handler,
            batch_size: batch_size.max(1),
            segment_idx: 0,
            offset: 0,
            filtered_rows: 0,
        }
    }
}

impl RowsetReader for MemRowsetReader {
    fn rowset(&self) -> &RowsetSharedPtr {
        &self.rowset
    }

    fn next_block(&mut self) -> StatusResult<Option<RecordBatch>> {
        loop {
            let Some(segment) = self.rowset.segments().get(self.segment_idx) else {
                return Ok(None);
            };
            if self.offset >= segment.num_rows() {
                self.segment_idx += 1;
                self.offset = 0;
                continue;
            }
            let len = self.batch_size.min(segment.num_rows() - self.offset);
            let block = segment.slice(self.offset, len);
            self.offset += len;

            let block = match self.delete_handler.as_ref() {
                Some(handler) if !handler.is_empty() => {
                    let (kept, filtered) =
                        handler.filter_block(&block, self.rowset.end_version())?;
                    self.filtered_rows += filtered;
                    kept
                }
                _ => block,
            };
            if block.num_rows() > 0 {
                return Ok(Some(block));
            }
        }
    }

    fn filtered_rows(&self) -> usize {
        self.filtered_rows
    }
}
