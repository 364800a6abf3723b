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
//! Conversion of historical rowsets from a base schema to a new schema.
//!
//! A [`SchemaChange`] converts one rowset; [`SchemaChangeJob`] plans the
//! alteration, picks the strategy and drives it over every historical version.

mod directly;
mod job;
mod linked;
mod params;
mod sorting;

use tracing::{info, warn};

use crate::common::status::{Status, StatusResult};
use crate::olap::rowset::{RowsetReader, RowsetWriter};
use crate::olap::tablet::TabletSharedPtr;

pub use directly::SchemaChangeDirectly;
pub use job::{SchemaChangeJob, SchemaChangeKind};
pub use linked::LinkedSchemaChange;
pub use params::{
    AlterMaterializedViewParam, AlterTabletRequest, SHADOW_COLUMN_PREFIX, SchemaChangeParams,
    WHERE_SIGN,
};
pub use sorting::{LocalSchemaChangeWithSorting, SchemaChangeWithSorting};

/// Rows a strategy removed while converting the current rowset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowCounters {
    /// Rows dropped by the `where` filter of the block changer.
    pub filtered_rows: usize,
    /// Rows folded into another row with the same key.
    pub merged_rows: usize,
}

impl RowCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Converts one base rowset into one new-schema rowset.
pub trait SchemaChange: Send {
    fn name(&self) -> &'static str;

    fn counters(&self) -> &RowCounters;

    fn counters_mut(&mut self) -> &mut RowCounters;

    fn process(
        &mut self,
        reader: &mut dyn RowsetReader,
        writer: &mut dyn RowsetWriter,
        new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        let source = reader.rowset();
        if source.empty() || source.num_rows() == 0 {
            return writer.flush();
        }

        self.counters_mut().reset();
        self.inner_process(reader, writer, new_tablet)?;

        if !self.check_row_nums(reader, writer) {
            return Err(Status::RowCountMismatch(format!(
                "SchemaChange check row nums failed: tablet_id={} version={}",
                new_tablet.tablet_id(),
                reader.version()
            )));
        }

        let counters = self.counters();
        info!(
            strategy = self.name(),
            tablet_id = new_tablet.tablet_id(),
            version = %reader.version(),
            source_rows = reader.rowset().num_rows(),
            merged_rows = counters.merged_rows,
            filtered_rows = counters.filtered_rows,
            new_index_rows = writer.num_rows(),
            "all row nums"
        );
        Ok(())
    }

    fn inner_process(
        &mut self,
        _reader: &mut dyn RowsetReader,
        _writer: &mut dyn RowsetWriter,
        _new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        Err(Status::NotSupported("inner process unsupported.".to_string()))
    }

    fn check_row_nums(&self, reader: &dyn RowsetReader, writer: &dyn RowsetWriter) -> bool {
        check_row_nums_exact(self.counters(), reader, writer)
    }
}

/// `source - reader_filtered == written + writer_filtered + merged + filtered`.
pub fn check_row_nums_exact(
    counters: &RowCounters,
    reader: &dyn RowsetReader,
    writer: &dyn RowsetWriter,
) -> bool {
    let source_rows = reader.rowset().num_rows();
    let expected = source_rows.saturating_sub(reader.filtered_rows());
    let actual = writer.num_rows()
        + writer.num_rows_filtered()
        + counters.merged_rows
        + counters.filtered_rows;
    if expected != actual {
        warn!(
            version = %reader.version(),
            source_rows,
            source_filtered_rows = reader.filtered_rows(),
            written_rows = writer.num_rows(),
            writer_filtered_rows = writer.num_rows_filtered(),
            merged_rows = counters.merged_rows,
            filtered_rows = counters.filtered_rows,
            "fail to check row num"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::common::ids::RowsetId;
    use crate::olap::olap_common::{KeysType, SegmentsOverlap, TabletState, Version};
    use crate::olap::rowset::{MemRowsetReader, MemRowsetWriter, RowsetWriterContext};
    use crate::olap::tablet::Tablet;
    use crate::olap::tablet_schema::{TabletColumn, TabletSchema};

    #[derive(Default)]
    struct Unfinished {
        counters: RowCounters,
    }

    impl SchemaChange for Unfinished {
        fn name(&self) -> &'static str {
            "unfinished"
        }

        fn counters(&self) -> &RowCounters {
            &self.counters
        }

        fn counters_mut(&mut self) -> &mut RowCounters {
            &mut self.counters
        }
    }

    fn writer(tablet: &Tablet, id: i64) -> MemRowsetWriter {
        MemRowsetWriter::new(RowsetWriterContext {
            rowset_id: RowsetId(id),
            tablet_id: tablet.tablet_id(),
            tablet_schema: Arc::clone(tablet.tablet_schema()),
            version: Version::new(2, 2),
            segments_overlap: SegmentsOverlap::NonOverlapping,
            newest_write_timestamp: 0,
            delete_predicate: None,
        })
        .expect("writer")
    }

    #[test]
    fn default_inner_process_is_not_supported() {
        let schema = TabletSchema::new(KeysType::DupKeys, vec![TabletColumn::new_key(0, "k", "INT")])
            .expect("schema");
        let tablet = Arc::new(Tablet::new(1, Arc::new(schema), TabletState::NotReady));

        let mut source_writer = writer(&tablet, 1);
        let block = arrow::record_batch::RecordBatch::try_new(
            tablet.tablet_schema().to_arrow_schema().expect("arrow schema"),
            vec![Arc::new(arrow::array::Int32Array::from(vec![1, 2]))],
        )
        .expect("record batch");
        source_writer.add_block(&block).expect("add");
        let source = source_writer.build().expect("build");

        let mut reader = MemRowsetReader::new(source, None, 16);
        let mut target = writer(&tablet, 2);
        let err = Unfinished::default()
            .process(&mut reader, &mut target, &tablet)
            .expect_err("unsupported");
        assert!(matches!(err, Status::NotSupported(_)), "err={}", err);
    }
}
