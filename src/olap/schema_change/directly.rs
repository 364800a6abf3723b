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

use crate::common::status::StatusResult;
use crate::olap::block_changer::BlockChanger;
use crate::olap::rowset::{RowsetReader, RowsetWriter};
use crate::olap::schema_change::{RowCounters, SchemaChange, check_row_nums_exact};
use crate::olap::tablet::TabletSharedPtr;

/// Streams every block through the changer and appends it to the writer.
///
/// Input order is preserved, so this strategy is only chosen when the key
/// order of the new schema follows from the base schema.
#[derive(Debug)]
pub struct SchemaChangeDirectly {
    changer: Arc<BlockChanger>,
    counters: RowCounters,
}

impl SchemaChangeDirectly {
    pub fn new(changer: Arc<BlockChanger>) -> Self {
        Self {
            changer,
            counters: RowCounters::default(),
        }
    }
}

impl SchemaChange for SchemaChangeDirectly {
    fn name(&self) -> &'static str {
        "directly"
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
        while let Some(ref_block) = reader.next_block()? {
            let changed = self.changer.change_block(&ref_block)?;
            self.counters.filtered_rows += changed.filtered_rows;
            writer.add_block(&changed.block)?;
        }
        writer.flush()
    }

    fn check_row_nums(&self, reader: &dyn RowsetReader, writer: &dyn RowsetWriter) -> bool {
        // A where clause is allowed to drop rows the writer never sees.
        self.changer.has_where() || check_row_nums_exact(&self.counters, reader, writer)
    }
}
