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
use std::collections::HashSet;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::common::status::{Status, StatusResult};
use crate::olap::olap_common::{AggregationType, KeysType};

/// One column of a tablet schema, typed by its SQL type name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletColumn {
    pub unique_id: i32,
    pub name: String,
    pub column_type: String,
    pub is_key: bool,
    pub is_nullable: bool,
    pub aggregation: AggregationType,
    pub default_value: Option<String>,
}

impl TabletColumn {
    pub fn new_key(unique_id: i32, name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            unique_id,
            name: name.into(),
            column_type: column_type.into(),
            is_key: true,
            is_nullable: false,
            aggregation: AggregationType::None,
            default_value: None,
        }
    }

    pub fn new_value(
        unique_id: i32,
        name: impl Into<String>,
        column_type: impl Into<String>,
    ) -> Self {
        Self {
            unique_id,
            name: name.into(),
            column_type: column_type.into(),
            is_key: false,
            is_nullable: true,
            aggregation: AggregationType::None,
            default_value: None,
        }
    }

    pub fn with_nullable(mut self, is_nullable: bool) -> Self {
        self.is_nullable = is_nullable;
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationType) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    /// Upper-cased type name with whitespace removed, e.g. `DECIMAL(10,2)`.
    pub fn normalized_type(&self) -> String {
        self.column_type
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase()
    }

    pub fn arrow_type(&self) -> StatusResult<DataType> {
        let type_name = self.normalized_type();
        let base = type_name
            .split('(')
            .next()
            .unwrap_or(type_name.as_str())
            .trim();
        match base {
            "BOOLEAN" => Ok(DataType::Boolean),
            "TINYINT" => Ok(DataType::Int8),
            "SMALLINT" => Ok(DataType::Int16),
            "INT" => Ok(DataType::Int32),
            "BIGINT" => Ok(DataType::Int64),
            "LARGEINT" => Ok(DataType::Decimal128(38, 0)),
            "FLOAT" => Ok(DataType::Float32),
            "DOUBLE" => Ok(DataType::Float64),
            "DATE" | "DATEV2" => Ok(DataType::Date32),
            "DATETIME" | "DATETIMEV2" => Ok(DataType::Timestamp(TimeUnit::Microsecond, None)),
            "CHAR" | "VARCHAR" | "STRING" => Ok(DataType::Utf8),
            "DECIMAL" | "DECIMALV3" | "DECIMAL32" | "DECIMAL64" | "DECIMAL128I" => {
                let (precision, scale) = self.decimal_precision_scale()?;
                Ok(DataType::Decimal128(precision, scale))
            }
            other => Err(Status::NotSupported(format!(
                "unsupported column type: column='{}' type='{}'",
                self.name, other
            ))),
        }
    }

    fn decimal_precision_scale(&self) -> StatusResult<(u8, i8)> {
        let type_name = self.normalized_type();
        if let Some(start) = type_name.find('(')
            && let Some(end_rel) = type_name[start + 1..].find(')')
        {
            let end = start + 1 + end_rel;
            let args = type_name[start + 1..end].split(',').collect::<Vec<_>>();
            if args.len() == 2 {
                let precision = args[0].parse::<u8>().map_err(|e| {
                    Status::InvalidArgument(format!(
                        "parse decimal precision from type '{}' failed: {}",
                        self.column_type, e
                    ))
                })?;
                let scale = args[1].parse::<i8>().map_err(|e| {
                    Status::InvalidArgument(format!(
                        "parse decimal scale from type '{}' failed: {}",
                        self.column_type, e
                    ))
                })?;
                return Ok((precision, scale));
            }
        }
        Ok((38, 0))
    }

    pub fn to_arrow_field(&self) -> StatusResult<Field> {
        Ok(Field::new(&self.name, self.arrow_type()?, self.is_nullable))
    }
}

/// Ordered columns of a tablet; key columns come first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletSchema {
    columns: Vec<TabletColumn>,
    keys_type: KeysType,
    num_short_key_columns: usize,
    schema_hash: i32,
    sequence_col_idx: Option<usize>,
}

pub type TabletSchemaSPtr = Arc<TabletSchema>;

impl TabletSchema {
    pub fn new(keys_type: KeysType, columns: Vec<TabletColumn>) -> StatusResult<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        let mut in_key_prefix = true;
        for column in &columns {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(Status::InvalidArgument(format!(
                    "duplicate column name in tablet schema: {}",
                    column.name
                )));
            }
            if column.is_key && !in_key_prefix {
                return Err(Status::InvalidArgument(format!(
                    "key column must precede value columns: {}",
                    column.name
                )));
            }
            in_key_prefix &= column.is_key;
        }
        let num_keys = columns.iter().filter(|c| c.is_key).count();
        Ok(Self {
            columns,
            keys_type,
            num_short_key_columns: num_keys.min(3),
            schema_hash: 0,
            sequence_col_idx: None,
        })
    }

    pub fn with_short_key_columns(mut self, num_short_key_columns: usize) -> Self {
        self.num_short_key_columns = num_short_key_columns;
        self
    }

    pub fn with_schema_hash(mut self, schema_hash: i32) -> Self {
        self.schema_hash = schema_hash;
        self
    }

    pub fn with_sequence_column(mut self, name: &str) -> StatusResult<Self> {
        let idx = self.field_index(name).ok_or_else(|| {
            Status::InvalidArgument(format!("sequence column not found: {name}"))
        })?;
        self.sequence_col_idx = Some(idx);
        Ok(self)
    }

    pub fn columns(&self) -> &[TabletColumn] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &TabletColumn {
        &self.columns[idx]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    pub fn num_short_key_columns(&self) -> usize {
        self.num_short_key_columns
    }

    pub fn keys_type(&self) -> KeysType {
        self.keys_type
    }

    pub fn schema_hash(&self) -> i32 {
        self.schema_hash
    }

    pub fn sequence_col_idx(&self) -> Option<usize> {
        self.sequence_col_idx
    }

    /// Case-insensitive lookup by column name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn key_column_indexes(&self) -> Vec<usize> {
        (0..self.num_key_columns()).collect()
    }

    pub fn to_arrow_schema(&self) -> StatusResult<SchemaRef> {
        let fields = self
            .columns
            .iter()
            .map(TabletColumn::to_arrow_field)
            .collect::<StatusResult<Vec<_>>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }

    /// True when both schemas store exactly the same columns.
    pub fn storage_equivalent(&self, other: &TabletSchema) -> bool {
        if self.columns.len() != other.columns.len() || self.keys_type != other.keys_type {
            return false;
        }
        self.columns.iter().zip(other.columns.iter()).all(|(l, r)| {
            l.unique_id == r.unique_id
                && l.name == r.name
                && l.normalized_type() == r.normalized_type()
                && l.is_key == r.is_key
                && l.is_nullable == r.is_nullable
                && l.aggregation == r.aggregation
        })
    }
}
