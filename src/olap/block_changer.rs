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
//! Translate one base-schema block into a new-schema block.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::compute::{cast, filter_record_batch};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::common::status::{Status, StatusResult};
use crate::olap::block::repeat_singleton_array;
use crate::olap::column_mapping::{ColumnMapping, SchemaMapping};
use crate::olap::expr::{BlockExprRef, DescriptorTbl, ExprInput, predicate_keep_mask};
use crate::olap::olap_common::AlterTabletType;
use crate::olap::tablet_schema::TabletSchemaSPtr;

/// From this compatibility version on, rollup casts are checked like schema-change casts.
pub const STRICT_ROLLUP_CAST_VERSION: i32 = 3;

/// A converted block and the rows the `where` filter removed from its input.
#[derive(Clone, Debug)]
pub struct ChangedBlock {
    pub block: RecordBatch,
    pub filtered_rows: usize,
}

#[derive(Debug)]
pub struct BlockChanger {
    schema_mapping: SchemaMapping,
    new_schema: TabletSchemaSPtr,
    output_schema: SchemaRef,
    desc_tbl: DescriptorTbl,
    where_expr: Option<BlockExprRef>,
    alter_type: AlterTabletType,
    fe_compatible_version: i32,
}

impl BlockChanger {
    pub fn new(new_schema: TabletSchemaSPtr, desc_tbl: DescriptorTbl) -> StatusResult<Self> {
        let output_schema = new_schema.to_arrow_schema()?;
        Ok(Self {
            schema_mapping: vec![ColumnMapping::Unset; new_schema.num_columns()],
            new_schema,
            output_schema,
            desc_tbl,
            where_expr: None,
            alter_type: AlterTabletType::SchemaChange,
            fe_compatible_version: -1,
        })
    }

    pub fn get_mutable_column_mapping(&mut self, column_index: usize) -> Option<&mut ColumnMapping> {
        self.schema_mapping.get_mut(column_index)
    }

    pub fn schema_mapping(&self) -> &SchemaMapping {
        &self.schema_mapping
    }

    pub fn new_schema(&self) -> &TabletSchemaSPtr {
        &self.new_schema
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn set_where_expr(&mut self, where_expr: BlockExprRef) {
        self.where_expr = Some(where_expr);
    }

    pub fn has_where(&self) -> bool {
        self.where_expr.is_some()
    }

    pub fn set_type(&mut self, alter_type: AlterTabletType) {
        self.alter_type = alter_type;
    }

    pub fn alter_type(&self) -> AlterTabletType {
        self.alter_type
    }

    pub fn set_compatible_version(&mut self, version: i32) {
        self.fe_compatible_version = version;
    }

    pub fn compatible_version(&self) -> i32 {
        self.fe_compatible_version
    }

    pub fn change_block(&self, ref_block: &RecordBatch) -> StatusResult<ChangedBlock> {
        let (ref_block, filtered_rows) = self.apply_where(ref_block)?;
        let row_count = ref_block.num_rows();

        let need_expr_input = self.schema_mapping.iter().any(ColumnMapping::is_expression);
        let expr_input = if need_expr_input {
            Some(self.desc_tbl.bind(&ref_block)?)
        } else {
            None
        };

        let mut columns = Vec::with_capacity(self.schema_mapping.len());
        for (idx, mapping) in self.schema_mapping.iter().enumerate() {
            let target = self.new_schema.column(idx);
            let target_type = self.output_schema.field(idx).data_type();
            let column = match mapping {
                ColumnMapping::Reference { ref_column_idx } => {
                    let source = ref_block.columns().get(*ref_column_idx).ok_or_else(|| {
                        Status::Internal(format!(
                            "referenced column index out of range: column={} ref_column_idx={} base_columns={}",
                            target.name,
                            ref_column_idx,
                            ref_block.num_columns()
                        ))
                    })?;
                    self.cast_to_target(source, target_type, &target.name)?
                }
                ColumnMapping::Expression { expr } => {
                    let input = expr_input.as_ref().ok_or_else(|| {
                        Status::Internal("expression input was not bound".to_string())
                    })?;
                    let result = evaluate_expr(expr, input, &target.name)?;
                    self.cast_to_target(&result, target_type, &target.name)?
                }
                ColumnMapping::DefaultValue { value } => {
                    let value = if value.data_type() == target_type {
                        Arc::clone(value)
                    } else {
                        cast(value.as_ref(), target_type)?
                    };
                    repeat_singleton_array(&value, row_count)?
                }
                ColumnMapping::Unset => {
                    return Err(Status::Internal(format!(
                        "column mapping is not resolved: column={}",
                        target.name
                    )));
                }
            };
            if !target.is_nullable && column.null_count() > 0 {
                return Err(Status::DataQuality(format!(
                    "null values written into not-null column: column={} null_count={}",
                    target.name,
                    column.null_count()
                )));
            }
            columns.push(column);
        }

        let block = RecordBatch::try_new_with_options(
            Arc::clone(&self.output_schema),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(row_count)),
        )?;
        Ok(ChangedBlock {
            block,
            filtered_rows,
        })
    }

    fn apply_where(&self, ref_block: &RecordBatch) -> StatusResult<(RecordBatch, usize)> {
        let Some(where_expr) = self.where_expr.as_ref() else {
            return Ok((ref_block.clone(), 0));
        };
        if ref_block.num_rows() == 0 {
            return Ok((ref_block.clone(), 0));
        }
        let input = self.desc_tbl.bind(ref_block)?;
        let predicate = evaluate_expr(where_expr, &input, "<where>")?;
        let keep = predicate_keep_mask(&predicate, ref_block.num_rows())?;
        let kept = keep.true_count();
        if kept == ref_block.num_rows() {
            return Ok((ref_block.clone(), 0));
        }
        let filtered = filter_record_batch(ref_block, &keep)?;
        Ok((filtered, ref_block.num_rows() - kept))
    }

    fn cast_to_target(
        &self,
        source: &ArrayRef,
        target_type: &DataType,
        target_name: &str,
    ) -> StatusResult<ArrayRef> {
        if source.data_type() == target_type {
            return Ok(Arc::clone(source));
        }
        if !schema_change_allowed(source.data_type(), target_type) {
            return Err(Status::NotSupported(format!(
                "cannot change column {} from {:?} to {:?}",
                target_name,
                source.data_type(),
                target_type
            )));
        }
        let casted = cast(source.as_ref(), target_type).map_err(|e| {
            Status::DataQuality(format!(
                "cast column {} from {:?} to {:?} failed: {}",
                target_name,
                source.data_type(),
                target_type,
                e
            ))
        })?;
        self.check_cast_valid(source, &casted, target_name)?;
        Ok(casted)
    }

    /// A cast never turns NULL into a value, so extra nulls mean a value did not fit.
    fn check_cast_valid(
        &self,
        ref_column: &ArrayRef,
        new_column: &ArrayRef,
        target_name: &str,
    ) -> StatusResult<()> {
        if ref_column.len() != new_column.len() {
            return Err(Status::DataQuality(format!(
                "column size is changed: column={} src_size={} dst_size={}",
                target_name,
                ref_column.len(),
                new_column.len()
            )));
        }
        if self.alter_type == AlterTabletType::Rollup
            && self.fe_compatible_version < STRICT_ROLLUP_CAST_VERSION
        {
            return Ok(());
        }
        if new_column.null_count() <= ref_column.null_count() {
            return Ok(());
        }
        let row = (0..ref_column.len())
            .find(|&row| !ref_column.is_null(row) && new_column.is_null(row))
            .unwrap_or_default();
        Err(Status::DataQuality(format!(
            "is_null of data is changed: column={} row={} from={:?} to={:?}",
            target_name,
            row,
            ref_column.data_type(),
            new_column.data_type()
        )))
    }
}

fn evaluate_expr(expr: &BlockExprRef, input: &ExprInput, context: &str) -> StatusResult<ArrayRef> {
    let result = expr
        .evaluate(input)
        .map_err(|e| e.with_context(format!("evaluate expression for {context}")))?;
    if result.len() != input.num_rows() {
        return Err(Status::Internal(format!(
            "expression for {} returned {} rows, expected {}",
            context,
            result.len(),
            input.num_rows()
        )));
    }
    Ok(result)
}

/// Column type changes a schema change may perform.
pub fn schema_change_allowed(from: &DataType, to: &DataType) -> bool {
    use DataType::*;
    if from == to {
        return true;
    }
    let is_integer = |t: &DataType| matches!(t, Int8 | Int16 | Int32 | Int64);
    let is_float = |t: &DataType| matches!(t, Float32 | Float64);
    let is_decimal = |t: &DataType| matches!(t, Decimal128(_, _));
    let is_temporal = |t: &DataType| matches!(t, Date32 | Timestamp(_, _));
    match (from, to) {
        (Utf8, _) => {
            is_integer(to) || is_float(to) || is_decimal(to) || is_temporal(to) || *to == Boolean
        }
        (_, Utf8) => true,
        (Boolean, _) => is_integer(to),
        _ if is_integer(from) => is_integer(to) || is_float(to) || is_decimal(to),
        _ if is_float(from) => is_float(to) || is_decimal(to),
        _ if is_decimal(from) => is_decimal(to) || is_float(to),
        _ if is_temporal(from) => is_temporal(to),
        _ => false,
    }
}
