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
use arrow::array::ArrayRef;

use crate::olap::expr::BlockExprRef;

/// How one column of the new schema is derived from a base block.
#[derive(Clone, Debug, Default)]
pub enum ColumnMapping {
    /// Not resolved yet; a finished mapping never contains this.
    #[default]
    Unset,
    /// Copy (and cast if needed) column `ref_column_idx` of the base schema.
    Reference { ref_column_idx: usize },
    /// Materialize a one-row default into every row.
    DefaultValue { value: ArrayRef },
    /// Evaluate a materialized-view expression over the base block.
    Expression { expr: BlockExprRef },
}

impl ColumnMapping {
    pub fn ref_column_idx(&self) -> Option<usize> {
        match self {
            ColumnMapping::Reference { ref_column_idx } => Some(*ref_column_idx),
            _ => None,
        }
    }

    pub fn is_expression(&self) -> bool {
        matches!(self, ColumnMapping::Expression { .. })
    }

    pub fn is_default_value(&self) -> bool {
        matches!(self, ColumnMapping::DefaultValue { .. })
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, ColumnMapping::Unset)
    }
}

/// One mapping per new-schema column, index aligned with the new schema.
pub type SchemaMapping = Vec<ColumnMapping>;
