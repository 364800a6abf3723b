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

use tracing::{info, warn};

use crate::common::status::StatusResult;
use crate::olap::block_changer::BlockChanger;
use crate::olap::rowset::{RowsetReader, RowsetWriter};
use crate::olap::schema_change::{RowCounters, SchemaChange, SchemaChangeDirectly};
use crate::olap::tablet::TabletSharedPtr;

/// Reuses the base rowset's segments when old and new storage layouts match.
///
/// A rowset stored with a different layout than the target writer expects is
/// rewritten through [`SchemaChangeDirectly`] instead.
#[derive(Debug)]
pub struct LinkedSchemaChange {
    changer: Arc<BlockChanger>,
    counters: RowCounters,
}

impl LinkedSchemaChange {
    pub fn new(changer: Arc<BlockChanger>) -> Self {
        Self {
            changer,
            counters: RowCounters::default(),
        }
    }
}

impl SchemaChange for LinkedSchemaChange {
    fn name(&self) -> &'static str {
        "linked"
    }

    fn counters(&self) -> &RowCounters {
        &self.counters
    }

    fn counters_mut(&mut self) -> &mut RowCounters {
        &mut self.counters
    }

    fn process(
        &mut self,
        reader: &mut dyn RowsetReader,
        writer: &mut dyn RowsetWriter,
        new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        let rowset = Arc::clone(reader.rowset());
        if !rowset
            .schema()
            .storage_equivalent(&writer.context().tablet_schema)
        {
            info!(
                rowset_id = %rowset.rowset_id(),
                tablet_id = new_tablet.tablet_id(),
                "storage layout of base rowset differs from new tablet, use direct schema change"
            );
            let mut directly = SchemaChangeDirectly::new(Arc::clone(&self.changer));
            directly.process(reader, writer, new_tablet)?;
            self.counters = *directly.counters();
            return Ok(());
        }

        writer
            .add_rowset_for_linked_schema_change(&rowset)
            .inspect_err(|e| {
                warn!(
                    rowset_id = %rowset.rowset_id(),
                    version = %rowset.version(),
                    tablet_id = new_tablet.tablet_id(),
                    error = %e,
                    "fail to convert rowset"
                );
            })
    }
}
