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
//! Merge-on-write delete bitmaps.
//!
//! A row location is `(rowset, segment, ordinal)`. The bitmap entry for a
//! location is tagged with the version that superseded it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::row::{OwnedRow, RowConverter, SortField};
use roaring::RoaringBitmap;

use crate::common::ids::RowsetId;
use crate::common::status::{Status, StatusResult};
use crate::olap::rowset::RowsetSharedPtr;
use crate::olap::tablet_schema::TabletSchema;

pub type SegmentId = u32;

/// `(rowset, segment, version)` of one bitmap.
pub type BitmapKey = (RowsetId, SegmentId, i64);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteBitmap {
    delete_bitmap: BTreeMap<BitmapKey, RoaringBitmap>,
}

impl DeleteBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: BitmapKey, row_id: u32) {
        self.delete_bitmap.entry(key).or_default().insert(row_id);
    }

    /// True if the row is deleted at any version.
    pub fn contains(&self, rowset_id: RowsetId, segment_id: SegmentId, row_id: u32) -> bool {
        self.delete_bitmap
            .range((rowset_id, segment_id, i64::MIN)..=(rowset_id, segment_id, i64::MAX))
            .any(|(_, bitmap)| bitmap.contains(row_id))
    }

    pub fn get(&self, key: &BitmapKey) -> Option<&RoaringBitmap> {
        self.delete_bitmap.get(key)
    }

    /// Number of deleted rows in one rowset.
    pub fn rowset_cardinality(&self, rowset_id: RowsetId) -> u64 {
        self.delete_bitmap
            .iter()
            .filter(|((id, _, _), _)| *id == rowset_id)
            .map(|(_, bitmap)| bitmap.len())
            .sum()
    }

    pub fn cardinality(&self) -> u64 {
        self.delete_bitmap.values().map(RoaringBitmap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.delete_bitmap.is_empty()
    }

    pub fn merge(&mut self, other: &DeleteBitmap) {
        for (key, bitmap) in &other.delete_bitmap {
            *self.delete_bitmap.entry(*key).or_default() |= bitmap;
        }
    }

    pub fn remove_rowset(&mut self, rowset_id: RowsetId) {
        self.delete_bitmap.retain(|(id, _, _), _| *id != rowset_id);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BitmapKey, &RoaringBitmap)> {
        self.delete_bitmap.iter()
    }
}

#[derive(Clone, Copy)]
struct RowLocation {
    rowset_id: RowsetId,
    segment_id: SegmentId,
    row_id: u32,
    seq: Option<usize>,
}

/// Recompute the delete bitmap of a unique-key tablet from scratch.
///
/// Rowsets are visited in version order; an earlier location of a key is
/// deleted by any later one. With a sequence column the larger sequence value
/// survives instead, ties going to the later row.
pub fn calc_delete_bitmap(
    schema: &TabletSchema,
    rowsets: &[RowsetSharedPtr],
) -> StatusResult<DeleteBitmap> {
    let arrow_schema = schema.to_arrow_schema()?;
    let num_keys = schema.num_key_columns();
    if num_keys == 0 {
        return Err(Status::InvalidArgument(
            "delete bitmap requires key columns".to_string(),
        ));
    }
    let key_converter = RowConverter::new(
        arrow_schema
            .fields()
            .iter()
            .take(num_keys)
            .map(|f| SortField::new(f.data_type().clone()))
            .collect(),
    )?;
    let seq_converter = match schema.sequence_col_idx() {
        Some(idx) => Some((
            idx,
            RowConverter::new(vec![SortField::new(
                arrow_schema.field(idx).data_type().clone(),
            )])?,
        )),
        None => None,
    };

    let mut ordered = rowsets.iter().map(Arc::clone).collect::<Vec<_>>();
    ordered.sort_by_key(|rs| rs.version());

    let mut bitmap = DeleteBitmap::new();
    let mut latest: HashMap<OwnedRow, RowLocation> = HashMap::new();
    // Sequence values stay alive for comparisons against later rowsets.
    let mut seq_values: Vec<OwnedRow> = Vec::new();

    for rowset in &ordered {
        let version = rowset.end_version();
        for (segment_idx, segment) in rowset.segments().iter().enumerate() {
            let segment_id = SegmentId::try_from(segment_idx).map_err(|_| {
                Status::Internal(format!("segment id overflows u32: {segment_idx}"))
            })?;
            let keys = key_converter.convert_columns(&segment.columns()[..num_keys])?;
            let seqs = match seq_converter.as_ref() {
                Some((idx, converter)) => {
                    Some(converter.convert_columns(std::slice::from_ref(segment.column(*idx)))?)
                }
                None => None,
            };
            for row in 0..segment.num_rows() {
                let row_id = u32::try_from(row)
                    .map_err(|_| Status::Internal(format!("row id overflows u32: {row}")))?;
                let seq = match seqs.as_ref() {
                    Some(seqs) => {
                        seq_values.push(seqs.row(row).owned());
                        Some(seq_values.len() - 1)
                    }
                    None => None,
                };
                let current = RowLocation {
                    rowset_id: rowset.rowset_id(),
                    segment_id,
                    row_id,
                    seq,
                };
                let key = keys.row(row).owned();
                match latest.get(&key).copied() {
                    None => {
                        latest.insert(key, current);
                    }
                    Some(previous) => {
                        let current_wins = match (previous.seq, current.seq) {
                            (Some(prev), Some(cur)) => seq_values[cur] >= seq_values[prev],
                            _ => true,
                        };
                        let (loser, winner) = if current_wins {
                            (previous, current)
                        } else {
                            (current, previous)
                        };
                        bitmap.add((loser.rowset_id, loser.segment_id, version), loser.row_id);
                        latest.insert(key, winner);
                    }
                }
            }
        }
    }
    Ok(bitmap)
}
