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
//! Helpers over Arrow record batches, the block unit of the storage layer.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
    UInt32Array, new_empty_array, new_null_array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::common::status::{Status, StatusResult};

pub type Block = RecordBatch;

/// Bytes referenced by the rows of the batch, ignoring the unused parts of shared buffers.
pub fn record_batch_slice_bytes(batch: &RecordBatch) -> StatusResult<usize> {
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(column.to_data().get_slice_memory_size()?);
    }
    Ok(total)
}

/// Repeat a one-row array `row_count` times.
pub fn repeat_singleton_array(singleton: &ArrayRef, row_count: usize) -> StatusResult<ArrayRef> {
    if singleton.len() != 1 {
        return Err(Status::Internal(format!(
            "singleton default array length mismatch: len={}",
            singleton.len()
        )));
    }
    if row_count == 0 {
        return Ok(new_empty_array(singleton.data_type()));
    }
    let index = UInt32Array::from(vec![0_u32; row_count]);
    Ok(take(singleton.as_ref(), &index, None)?)
}

/// Parse a stored default literal into a one-row array of `data_type`.
///
/// The literal `NULL` (any case) yields a null singleton.
pub fn parse_default_literal_to_singleton_array(
    data_type: &DataType,
    literal: &str,
) -> StatusResult<ArrayRef> {
    let normalized = literal.trim();
    if normalized.eq_ignore_ascii_case("null") {
        return Ok(new_null_array(data_type, 1));
    }
    let unquoted = strip_wrapping_quotes(normalized);
    let bad_literal = |type_name: &str, detail: String| {
        Status::InvalidArgument(format!(
            "parse {type_name} default literal '{unquoted}' failed: {detail}"
        ))
    };
    let array: ArrayRef = match data_type {
        DataType::Boolean => {
            let parsed = match unquoted.to_ascii_lowercase().as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(bad_literal("BOOLEAN", "not a boolean".to_string())),
            };
            Arc::new(BooleanArray::from(vec![Some(parsed)]))
        }
        DataType::Int8 => Arc::new(Int8Array::from(vec![Some(
            unquoted
                .parse::<i8>()
                .map_err(|e| bad_literal("TINYINT", e.to_string()))?,
        )])),
        DataType::Int16 => Arc::new(Int16Array::from(vec![Some(
            unquoted
                .parse::<i16>()
                .map_err(|e| bad_literal("SMALLINT", e.to_string()))?,
        )])),
        DataType::Int32 => Arc::new(Int32Array::from(vec![Some(
            unquoted
                .parse::<i32>()
                .map_err(|e| bad_literal("INT", e.to_string()))?,
        )])),
        DataType::Int64 => Arc::new(Int64Array::from(vec![Some(
            unquoted
                .parse::<i64>()
                .map_err(|e| bad_literal("BIGINT", e.to_string()))?,
        )])),
        DataType::Float32 => Arc::new(Float32Array::from(vec![Some(
            unquoted
                .parse::<f32>()
                .map_err(|e| bad_literal("FLOAT", e.to_string()))?,
        )])),
        DataType::Float64 => Arc::new(Float64Array::from(vec![Some(
            unquoted
                .parse::<f64>()
                .map_err(|e| bad_literal("DOUBLE", e.to_string()))?,
        )])),
        DataType::Date32 => Arc::new(Date32Array::from(vec![Some(
            parse_date32_literal(unquoted).map_err(|e| bad_literal("DATE", e))?,
        )])),
        DataType::Timestamp(TimeUnit::Microsecond, None) => {
            Arc::new(TimestampMicrosecondArray::from(vec![Some(
                parse_timestamp_literal(unquoted).map_err(|e| bad_literal("DATETIME", e))?,
            )]))
        }
        DataType::Decimal128(precision, scale) => {
            let parsed = parse_decimal128_literal(unquoted, *precision, *scale)
                .map_err(|e| bad_literal("DECIMAL", e))?;
            Arc::new(
                Decimal128Array::from(vec![Some(parsed)])
                    .with_precision_and_scale(*precision, *scale)?,
            )
        }
        DataType::Utf8 => Arc::new(StringArray::from(vec![Some(unquoted.to_string())])),
        other => {
            return Err(Status::NotSupported(format!(
                "unsupported default literal type: {other:?}"
            )));
        }
    };
    Ok(array)
}

fn strip_wrapping_quotes(raw: &str) -> &str {
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

fn parse_date32_literal(raw: &str) -> Result<i32, String> {
    const UNIX_EPOCH_DAY_OFFSET: i32 = 719_163;
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.num_days_from_ce() - UNIX_EPOCH_DAY_OFFSET);
    }
    if let Ok(date_time) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(date_time.date().num_days_from_ce() - UNIX_EPOCH_DAY_OFFSET);
    }
    Err("expected yyyy-mm-dd".to_string())
}

fn parse_timestamp_literal(raw: &str) -> Result<i64, String> {
    if let Ok(date_time) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(date_time.and_utc().timestamp_micros());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        && let Some(date_time) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(date_time.and_utc().timestamp_micros());
    }
    Err("expected yyyy-mm-dd hh:mm:ss".to_string())
}

fn parse_decimal128_literal(raw: &str, precision: u8, scale: i8) -> Result<i128, String> {
    let scale = usize::try_from(scale).map_err(|_| format!("invalid decimal scale {scale}"))?;
    let mut value = raw.trim();
    let negative = value.starts_with('-');
    if negative || value.starts_with('+') {
        value = &value[1..];
    }
    let (integer_digits, mut fractional_digits) = match value.split_once('.') {
        Some((int_part, frac_part)) => (int_part.to_string(), frac_part.to_string()),
        None => (value.to_string(), String::new()),
    };
    if fractional_digits.len() > scale {
        return Err(format!("scale overflow: scale={scale}"));
    }
    while fractional_digits.len() < scale {
        fractional_digits.push('0');
    }
    let combined = format!("{integer_digits}{fractional_digits}");
    if combined.is_empty() || !combined.chars().all(|c| c.is_ascii_digit()) {
        return Err("not a decimal number".to_string());
    }
    if combined.trim_start_matches('0').len() > usize::from(precision) {
        return Err(format!("precision overflow: precision={precision}"));
    }
    let parsed = combined.parse::<i128>().map_err(|e| e.to_string())?;
    Ok(if negative { -parsed } else { parsed })
}
