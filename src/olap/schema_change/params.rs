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
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::common::ids::TabletId;
use crate::olap::delete_handler::DeleteHandler;
use crate::olap::expr::{BlockExprRef, DescriptorTbl};
use crate::olap::olap_common::AlterTabletType;
use crate::olap::rowset::RowsetReader;

/// Materialized-view parameter carrying the rollup filter instead of a column.
pub const WHERE_SIGN: &str = "__DORIS_WHERE_SIGN__";

/// Prefix of the temporary columns the frontend creates during an alter.
pub const SHADOW_COLUMN_PREFIX: &str = "__doris_shadow_";

/// How one column of a rollup is computed from the base block.
#[derive(Clone, Debug, Default)]
pub struct AlterMaterializedViewParam {
    pub column_name: String,
    pub origin_column_name: Option<String>,
    pub mv_expr: Option<BlockExprRef>,
}

/// An alter task as received from the frontend.
#[derive(Clone, Debug)]
pub struct AlterTabletRequest {
    pub base_tablet_id: TabletId,
    pub new_tablet_id: TabletId,
    /// Every version up to this one must be converted.
    pub alter_version: i64,
    pub alter_tablet_type: AlterTabletType,
    pub materialized_view_params: Vec<AlterMaterializedViewParam>,
    pub desc_tbl: Option<DescriptorTbl>,
    /// Compatibility version of the frontend; the engine default applies when unset.
    pub be_exec_version: Option<i32>,
}

impl AlterTabletRequest {
    pub fn new(
        base_tablet_id: TabletId,
        new_tablet_id: TabletId,
        alter_version: i64,
        alter_tablet_type: AlterTabletType,
    ) -> Self {
        Self {
            base_tablet_id,
            new_tablet_id,
            alter_version,
            alter_tablet_type,
            materialized_view_params: Vec::new(),
            desc_tbl: None,
            be_exec_version: None,
        }
    }

    pub fn with_desc_tbl(mut self, desc_tbl: DescriptorTbl) -> Self {
        self.desc_tbl = Some(desc_tbl);
        self
    }

    pub fn with_materialized_view_param(mut self, param: AlterMaterializedViewParam) -> Self {
        self.materialized_view_params.push(param);
        self
    }

    pub fn with_be_exec_version(mut self, version: i32) -> Self {
        self.be_exec_version = Some(version);
        self
    }
}

/// Everything a conversion needs besides the two tablets.
pub struct SchemaChangeParams {
    pub alter_tablet_type: AlterTabletType,
    pub enable_unique_key_merge_on_write: bool,
    pub ref_rowset_readers: Vec<Box<dyn RowsetReader>>,
    pub delete_handler: Arc<DeleteHandler>,
    /// Keyed by lower-cased column name.
    pub materialized_params_map: HashMap<String, AlterMaterializedViewParam>,
    pub desc_tbl: DescriptorTbl,
    pub be_exec_version: i32,
}

impl SchemaChangeParams {
    pub fn new(alter_tablet_type: AlterTabletType, desc_tbl: DescriptorTbl) -> Self {
        Self {
            alter_tablet_type,
            enable_unique_key_merge_on_write: false,
            ref_rowset_readers: Vec::new(),
            delete_handler: Arc::new(DeleteHandler::default()),
            materialized_params_map: HashMap::new(),
            desc_tbl,
            be_exec_version: 0,
        }
    }

    pub fn add_materialized_param(&mut self, param: AlterMaterializedViewParam) {
        self.materialized_params_map
            .insert(param.column_name.to_lowercase(), param);
    }

    pub fn materialized_param(&self, column_name: &str) -> Option<&AlterMaterializedViewParam> {
        self.materialized_params_map
            .get(&column_name.to_lowercase())
    }
}

impl fmt::Debug for SchemaChangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaChangeParams")
            .field("alter_tablet_type", &self.alter_tablet_type)
            .field(
                "enable_unique_key_merge_on_write",
                &self.enable_unique_key_merge_on_write,
            )
            .field("ref_rowset_readers", &self.ref_rowset_readers.len())
            .field("delete_handler", &self.delete_handler)
            .field("materialized_params_map", &self.materialized_params_map)
            .field("be_exec_version", &self.be_exec_version)
            .finish_non_exhaustive()
    }
}
