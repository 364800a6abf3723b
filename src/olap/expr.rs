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
//! Expression seam used by materialized-view columns and the rollup `where` filter.
//!
//! Expressions see the base block through an [`ExprInput`]: the columns the
//! descriptor table names, each tagged with its slot id.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Scalar};
use arrow::compute::kernels::cmp;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;

use crate::common::ids::SlotId;
use crate::common::status::{Status, StatusResult};
use crate::olap::block::parse_default_literal_to_singleton_array;
use crate::olap::tablet_schema::TabletSchema;

pub const FIELD_META_SLOT_ID: &str = "novarocks.slot_id";

pub fn field_with_slot_id(field: Field, slot_id: SlotId) -> Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(meta)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub id: SlotId,
    pub col_name: String,
    pub is_nullable: Option<bool>,
}

/// Slots visible to expressions of one alter request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTbl {
    slots: Vec<SlotDescriptor>,
}

impl DescriptorTbl {
    pub fn new(slots: Vec<SlotDescriptor>) -> Self {
        Self { slots }
    }

    /// One slot per base column, slot id equal to the column ordinal.
    pub fn from_schema(schema: &TabletSchema) -> Self {
        let slots = schema
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, column)| SlotDescriptor {
                id: SlotId::new(idx as u32),
                col_name: column.name.clone(),
                is_nullable: Some(column.is_nullable),
            })
            .collect();
        Self { slots }
    }

    pub fn slots(&self) -> &[SlotDescriptor] {
        &self.slots
    }

    pub fn slot_by_name(&self, name: &str) -> Option<&SlotDescriptor> {
        self.slots
            .iter()
            .find(|slot| slot.col_name.eq_ignore_ascii_case(name))
    }

    /// Bind descriptor slots to the columns of a base block by name.
    pub fn bind(&self, source: &RecordBatch) -> StatusResult<ExprInput> {
        let source_schema = source.schema();
        let mut fields = Vec::new();
        let mut arrays = Vec::new();
        let mut slot_index = HashMap::new();

        for slot in &self.slots {
            let Some((source_idx, source_field)) = source_schema
                .fields()
                .iter()
                .enumerate()
                .find(|(_, f)| f.name().eq_ignore_ascii_case(&slot.col_name))
            else {
                continue;
            };
            if slot_index.insert(slot.id, fields.len()).is_some() {
                return Err(Status::InvalidArgument(format!(
                    "descriptor table contains duplicate slot id: slot_id={}",
                    slot.id
                )));
            }
            fields.push(field_with_slot_id(
                Field::new(
                    &slot.col_name,
                    source_field.data_type().clone(),
                    slot.is_nullable.unwrap_or(source_field.is_nullable())
                        || source_field.is_nullable(),
                ),
                slot.id,
            ));
            arrays.push(Arc::clone(source.column(source_idx)));
        }

        if fields.is_empty() && !self.slots.is_empty() {
            return Err(Status::InvalidArgument(
                "cannot map descriptor slots to base block for expression evaluation".to_string(),
            ));
        }
        let batch = RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            arrays,
            &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(source.num_rows())),
        )?;
        Ok(ExprInput { batch, slot_index })
    }
}

/// Base block columns addressed by slot id.
#[derive(Clone, Debug)]
pub struct ExprInput {
    batch: RecordBatch,
    slot_index: HashMap<SlotId, usize>,
}

impl ExprInput {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn column(&self, slot_id: SlotId) -> StatusResult<&ArrayRef> {
        let idx = self.slot_index.get(&slot_id).copied().ok_or_else(|| {
            Status::InvalidArgument(format!("slot {slot_id} is not bound to the input block"))
        })?;
        Ok(self.batch.column(idx))
    }
}

/// An expression evaluated against one base block.
pub trait BlockExpr: fmt::Debug + Send + Sync {
    /// Returns one value per input row.
    fn evaluate(&self, input: &ExprInput) -> StatusResult<ArrayRef>;
}

pub type BlockExprRef = Arc<dyn BlockExpr>;

/// Reads a bound slot unchanged.
#[derive(Clone, Debug)]
pub struct SlotRef {
    pub slot_id: SlotId,
}

impl BlockExpr for SlotRef {
    fn evaluate(&self, input: &ExprInput) -> StatusResult<ArrayRef> {
        input.column(self.slot_id).cloned()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FromStr for CompareOp {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" => Ok(CompareOp::Eq),
            "!=" | "<>" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            other => Err(Status::InvalidArgument(format!(
                "unsupported comparison operator: {other}"
            ))),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

/// Compare every value of `array` with a literal parsed by the array type.
pub fn compare_with_literal(
    array: &ArrayRef,
    op: CompareOp,
    literal: &str,
) -> StatusResult<BooleanArray> {
    let literal = Scalar::new(parse_default_literal_to_singleton_array(
        array.data_type(),
        literal,
    )?);
    let result = match op {
        CompareOp::Eq => cmp::eq(array, &literal),
        CompareOp::Ne => cmp::neq(array, &literal),
        CompareOp::Lt => cmp::lt(array, &literal),
        CompareOp::Le => cmp::lt_eq(array, &literal),
        CompareOp::Gt => cmp::gt(array, &literal),
        CompareOp::Ge => cmp::gt_eq(array, &literal),
    }?;
    Ok(result)
}

/// `slot <op> literal`, the predicate shape used by rollup filters.
#[derive(Clone, Debug)]
pub struct SlotCompare {
    pub slot_id: SlotId,
    pub op: CompareOp,
    pub literal: String,
}

impl BlockExpr for SlotCompare {
    fn evaluate(&self, input: &ExprInput) -> StatusResult<ArrayRef> {
        let column = input.column(self.slot_id)?;
        Ok(Arc::new(compare_with_literal(column, self.op, &self.literal)?))
    }
}

/// Keep mask of a predicate result; NULL counts as false.
pub fn predicate_keep_mask(predicate: &ArrayRef, num_rows: usize) -> StatusResult<BooleanArray> {
    let predicate = predicate
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| {
            Status::InvalidArgument(format!(
                "where predicate must produce BOOLEAN, got {:?}",
                predicate.data_type()
            ))
        })?;
    if predicate.len() != num_rows {
        return Err(Status::Internal(format!(
            "where predicate row count mismatch: expected_rows={} actual_rows={}",
            num_rows,
            predicate.len()
        )));
    }
    Ok((0..predicate.len())
        .map(|row| Some(!predicate.is_null(row) && predicate.value(row)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::DataType;

    fn block() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None, Some(3)])),
                Arc::new(StringArray::from(vec!["x", "y", "z"])),
            ],
        )
        .expect("record batch")
    }

    #[test]
    fn bind_tags_slots_by_name() {
        let desc_tbl = DescriptorTbl::new(vec![
            SlotDescriptor {
                id: SlotId::new(7),
                col_name: "B".to_string(),
                is_nullable: None,
            },
            SlotDescriptor {
                id: SlotId::new(9),
                col_name: "missing".to_string(),
                is_nullable: None,
            },
        ]);
        let input = desc_tbl.bind(&block()).expect("bind");
        assert_eq!(input.num_rows(), 3);
        assert_eq!(input.batch().num_columns(), 1);
        assert_eq!(
            input.batch().schema().field(0).metadata().get(FIELD_META_SLOT_ID),
            Some(&"7".to_string())
        );
        let err = input.column(SlotId::new(9)).expect_err("unbound slot");
        assert!(err.to_string().contains("not bound"), "err={}", err);
    }

    #[test]
    fn null_predicate_values_are_dropped() {
        let desc_tbl = DescriptorTbl::new(vec![SlotDescriptor {
            id: SlotId::new(0),
            col_name: "a".to_string(),
            is_nullable: None,
        }]);
        let input = desc_tbl.bind(&block()).expect("bind");
        let expr = SlotCompare {
            slot_id: SlotId::new(0),
            op: "<".parse().expect("op"),
            literal: "3".to_string(),
        };
        let result = expr.evaluate(&input).expect("evaluate");
        let keep = predicate_keep_mask(&result, 3).expect("mask");
        assert_eq!(
            keep.iter().collect::<Vec<_>>(),
            vec![Some(true), Some(false), Some(false)]
        );
    }
}
