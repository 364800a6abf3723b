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
use arrow::array::{Array, BooleanArray};
use arrow::compute::kernels::boolean::{and_kleene, or_kleene};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;

use crate::common::status::{Status, StatusResult};
use crate::olap::expr::{CompareOp, compare_with_literal};
use crate::olap::tablet_schema::TabletSchema;

/// `column op literal`; every condition of a predicate must hold to delete a row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteCondition {
    pub column_name: String,
    pub op: CompareOp,
    pub value: String,
}

impl DeleteCondition {
    pub fn new(column_name: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            op,
            value: value.into(),
        }
    }
}

/// A delete committed at `version`; it hides matching rows of older rowsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletePredicate {
    pub version: i64,
    pub conditions: Vec<DeleteCondition>,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteHandler {
    predicates: Vec<DeletePredicate>,
}

impl DeleteHandler {
    /// Keep the predicates committed at or before `end_version`.
    pub fn init(
        schema: &TabletSchema,
        predicates: &[DeletePredicate],
        end_version: i64,
    ) -> StatusResult<Self> {
        let mut kept = Vec::new();
        for predicate in predicates {
            if predicate.version > end_version {
                continue;
            }
            for condition in &predicate.conditions {
                if schema.field_index(&condition.column_name).is_none() {
                    return Err(Status::InvalidArgument(format!(
                        "delete condition references unknown column: column={} version={}",
                        condition.column_name, predicate.version
                    )));
                }
            }
            kept.push(predicate.clone());
        }
        kept.sort_by_key(|p| p.version);
        Ok(Self { predicates: kept })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn predicates(&self) -> &[DeletePredicate] {
        &self.predicates
    }

    /// Drop rows of a rowset ending at `rowset_end_version` that a newer delete matches.
    ///
    /// Returns the surviving block and the number of rows dropped.
    pub fn filter_block(
        &self,
        block: &RecordBatch,
        rowset_end_version: i64,
    ) -> StatusResult<(RecordBatch, usize)> {
        let mut deleted: Option<BooleanArray> = None;
        for predicate in self
            .predicates
            .iter()
            .filter(|p| p.version > rowset_end_version)
        {
            let matched = predicate_match(predicate, block)?;
            deleted = Some(match deleted {
                Some(prev) => or_kleene(&prev, &matched)?,
                None => matched,
            });
        }
        let Some(deleted) = deleted else {
            return Ok((block.clone(), 0));
        };
        let keep = (0..deleted.len())
            .map(|row| Some(!(deleted.is_valid(row) && deleted.value(row))))
            .collect::<BooleanArray>();
        let kept = keep.true_count();
        if kept == block.num_rows() {
            return Ok((block.clone(), 0));
        }
        Ok((filter_record_batch(block, &keep)?, block.num_rows() - kept))
    }
}

fn predicate_match(predicate: &DeletePredicate, block: &RecordBatch) -> StatusResult<BooleanArray> {
    let schema = block.schema();
    let mut matched: Option<BooleanArray> = None;
    for condition in &predicate.conditions {
        let idx = schema
            .fields()
            .iter()
            .position(|f| f.name().eq_ignore_ascii_case(&condition.column_name))
            .ok_or_else(|| {
                Status::Internal(format!(
                    "delete condition column missing from block: {}",
                    condition.column_name
                ))
            })?;
        let result = compare_with_literal(block.column(idx), condition.op, &condition.value)?;
        matched = Some(match matched {
            Some(prev) => and_kleene(&prev, &result)?,
            None => result,
        });
    }
    Ok(matched.unwrap_or_else(|| BooleanArray::from(vec![false; block.num_rows()])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::olap::olap_common::KeysType;
    use crate::olap::tablet_schema::TabletColumn;
    use arrow::array::Int32Array;
    use std::sync::Arc;

    fn schema() -> TabletSchema {
        TabletSchema::new(
            KeysType::DupKeys,
            vec![
                TabletColumn::new_key(0, "k", "INT"),
                TabletColumn::new_value(1, "v", "INT"),
            ],
        )
        .expect("schema")
    }

    fn block() -> RecordBatch {
        RecordBatch::try_new(
            schema().to_arrow_schema().expect("arrow schema"),
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3, 4])),
                Arc::new(Int32Array::from(vec![Some(10), None, Some(30), Some(40)])),
            ],
        )
        .expect("record batch")
    }

    #[test]
    fn newer_predicates_filter_older_rowsets() {
        let predicates = vec![
            DeletePredicate {
                version: 3,
                conditions: vec![DeleteCondition::new("k", CompareOp::Le, "2")],
            },
            DeletePredicate {
                version: 5,
                conditions: vec![
                    DeleteCondition::new("k", CompareOp::Ge, "3"),
                    DeleteCondition::new("v", CompareOp::Eq, "40"),
                ],
            },
            DeletePredicate {
                version: 9,
                conditions: vec![DeleteCondition::new("k", CompareOp::Eq, "3")],
            },
        ];
        let handler = DeleteHandler::init(&schema(), &predicates, 6).expect("init");
        assert_eq!(handler.predicates().len(), 2);

        let (kept, filtered) = handler.filter_block(&block(), 2).expect("filter");
        assert_eq!(filtered, 3);
        assert_eq!(kept.num_rows(), 1);

        let (kept, filtered) = handler.filter_block(&block(), 4).expect("filter");
        assert_eq!(filtered, 1);
        assert_eq!(kept.num_rows(), 3);

        let (_, filtered) = handler.filter_block(&block(), 5).expect("filter");
        assert_eq!(filtered, 0);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = DeleteHandler::init(
            &schema(),
            &[DeletePredicate {
                version: 2,
                conditions: vec![DeleteCondition::new("nope", CompareOp::Eq, "1")],
            }],
            2,
        )
        .expect_err("unknown column");
        assert!(err.to_string().contains("unknown column"), "err={}", err);
    }
}
