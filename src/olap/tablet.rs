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
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::common::ids::{RowsetId, TabletId};
use crate::common::status::{Status, StatusResult};
use crate::olap::delete_bitmap::{DeleteBitmap, calc_delete_bitmap};
use crate::olap::delete_handler::DeletePredicate;
use crate::olap::olap_common::{KeysType, TabletState, Version};
use crate::olap::rowset::RowsetSharedPtr;
use crate::olap::tablet_schema::TabletSchemaSPtr;

#[derive(Debug)]
struct TabletHeader {
    rowsets: BTreeMap<Version, RowsetSharedPtr>,
    delete_bitmap: DeleteBitmap,
    state: TabletState,
}

/// Delete bitmap computed by an alter job over a known rowset set.
#[derive(Debug)]
pub struct DeleteBitmapSnapshot {
    pub delete_bitmap: DeleteBitmap,
    /// Rowsets the bitmap was computed from.
    pub basis: Vec<RowsetId>,
}

#[derive(Debug)]
pub struct Tablet {
    tablet_id: TabletId,
    schema: TabletSchemaSPtr,
    enable_unique_key_merge_on_write: bool,
    header: RwLock<TabletHeader>,
}

pub type TabletSharedPtr = Arc<Tablet>;

impl Tablet {
    pub fn new(tablet_id: TabletId, schema: TabletSchemaSPtr, state: TabletState) -> Self {
        Self {
            tablet_id,
            schema,
            enable_unique_key_merge_on_write: false,
            header: RwLock::new(TabletHeader {
                rowsets: BTreeMap::new(),
                delete_bitmap: DeleteBitmap::new(),
                state,
            }),
        }
    }

    pub fn with_merge_on_write(mut self, enable: bool) -> Self {
        self.enable_unique_key_merge_on_write = enable;
        self
    }

    fn read_header(&self) -> RwLockReadGuard<'_, TabletHeader> {
        self.header.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_header(&self) -> RwLockWriteGuard<'_, TabletHeader> {
        self.header.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn tablet_schema(&self) -> &TabletSchemaSPtr {
        &self.schema
    }

    pub fn keys_type(&self) -> KeysType {
        self.schema.keys_type()
    }

    pub fn enable_unique_key_merge_on_write(&self) -> bool {
        self.enable_unique_key_merge_on_write
    }

    pub fn tablet_state(&self) -> TabletState {
        self.read_header().state
    }

    pub fn set_tablet_state(&self, state: TabletState) {
        self.write_header().state = state;
    }

    pub fn add_rowset(&self, rowset: RowsetSharedPtr) -> StatusResult<()> {
        let mut header = self.write_header();
        insert_rowset(&mut header.rowsets, self.tablet_id, rowset)
    }

    /// All rowsets in version order.
    pub fn rowsets(&self) -> Vec<RowsetSharedPtr> {
        self.read_header().rowsets.values().cloned().collect()
    }

    pub fn has_version(&self, version: Version) -> bool {
        self.read_header().rowsets.contains_key(&version)
    }

    pub fn get_rowset_with_max_version(&self) -> Option<RowsetSharedPtr> {
        self.read_header()
            .rowsets
            .values()
            .max_by_key(|rs| rs.end_version())
            .cloned()
    }

    pub fn max_version(&self) -> Option<Version> {
        self.get_rowset_with_max_version().map(|rs| rs.version())
    }

    /// End of the contiguous version path starting at 0, or -1 if there is none.
    pub fn max_continuous_version(&self) -> i64 {
        max_continuous_version_of(self.read_header().rowsets.keys().copied())
    }

    /// Versions forming a gap-free path covering `span`.
    pub fn capture_consistent_versions(&self, span: Version) -> StatusResult<Vec<Version>> {
        let header = self.read_header();
        let mut path = Vec::new();
        let mut next = span.start;
        while next <= span.end {
            let step = header
                .rowsets
                .keys()
                .filter(|v| v.start == next && v.end <= span.end)
                .max_by_key(|v| v.end)
                .copied()
                .ok_or_else(|| {
                    Status::NotFound(format!(
                        "tablet {} misses version {} while capturing {}",
                        self.tablet_id, next, span
                    ))
                })?;
            path.push(step);
            next = step.end + 1;
        }
        Ok(path)
    }

    pub fn check_version_integrity(&self, span: Version) -> StatusResult<()> {
        self.capture_consistent_versions(span).map(|_| ())
    }

    pub fn capture_rowsets(&self, versions: &[Version]) -> StatusResult<Vec<RowsetSharedPtr>> {
        let header = self.read_header();
        versions
            .iter()
            .map(|v| {
                header.rowsets.get(v).cloned().ok_or_else(|| {
                    Status::NotFound(format!("tablet {} has no rowset {}", self.tablet_id, v))
                })
            })
            .collect()
    }

    pub fn delete_predicates(&self) -> Vec<DeletePredicate> {
        self.read_header()
            .rowsets
            .values()
            .filter_map(|rs| rs.delete_predicate().cloned())
            .collect()
    }

    /// Remove every rowset whose end version is at most `end_version`.
    pub fn remove_rowsets_up_to(&self, end_version: i64) -> Vec<RowsetSharedPtr> {
        let mut header = self.write_header();
        let stale = header
            .rowsets
            .keys()
            .filter(|v| v.end <= end_version)
            .copied()
            .collect::<Vec<_>>();
        let mut removed = Vec::with_capacity(stale.len());
        for version in stale {
            if let Some(rowset) = header.rowsets.remove(&version) {
                header.delete_bitmap.remove_rowset(rowset.rowset_id());
                removed.push(rowset);
            }
        }
        removed
    }

    pub fn num_rows(&self) -> usize {
        self.read_header()
            .rowsets
            .values()
            .map(|rs| rs.num_rows())
            .sum()
    }

    pub fn delete_bitmap(&self) -> DeleteBitmap {
        self.read_header().delete_bitmap.clone()
    }

    /// Make converted rowsets, their delete bitmap and the running state visible at once.
    ///
    /// Rowsets whose version is already present are skipped and returned. A
    /// bitmap computed over a different rowset set than the one found here is
    /// recomputed under the header lock.
    pub fn publish_alter(
        &self,
        rowsets: Vec<RowsetSharedPtr>,
        delete_bitmap: Option<DeleteBitmapSnapshot>,
    ) -> StatusResult<Vec<RowsetSharedPtr>> {
        let mut header = self.write_header();
        let mut skipped = Vec::new();
        let mut staged = header.rowsets.clone();
        for rowset in rowsets {
            if staged.contains_key(&rowset.version()) {
                skipped.push(rowset);
                continue;
            }
            insert_rowset(&mut staged, self.tablet_id, rowset)?;
        }

        let bitmap = match delete_bitmap {
            Some(snapshot) => {
                let mut current = staged.values().map(|rs| rs.rowset_id()).collect::<Vec<_>>();
                let mut basis = snapshot.basis;
                current.sort();
                basis.sort();
                if current == basis {
                    Some(snapshot.delete_bitmap)
                } else {
                    info!(
                        tablet_id = self.tablet_id,
                        "rowsets changed since delete bitmap calculation, recalculating"
                    );
                    let all = staged.values().cloned().collect::<Vec<_>>();
                    Some(calc_delete_bitmap(&self.schema, &all)?)
                }
            }
            None => None,
        };

        header.rowsets = staged;
        if let Some(bitmap) = bitmap {
            header.delete_bitmap = bitmap;
        }
        header.state = TabletState::Running;
        Ok(skipped)
    }
}

/// End of the contiguous path from version 0 through `versions`, or -1 if there is none.
pub fn max_continuous_version_of(versions: impl IntoIterator<Item = Version>) -> i64 {
    let mut versions = versions.into_iter().collect::<Vec<_>>();
    versions.sort();
    let mut end = -1;
    for version in versions {
        if version.start != end + 1 {
            break;
        }
        end = version.end;
    }
    end
}

fn insert_rowset(
    rowsets: &mut BTreeMap<Version, RowsetSharedPtr>,
    tablet_id: TabletId,
    rowset: RowsetSharedPtr,
) -> StatusResult<()> {
    let version = rowset.version();
    if rowsets.contains_key(&version) {
        return Err(Status::VersionAlreadyExist(format!(
            "tablet {} already has version {}",
            tablet_id, version
        )));
    }
    if let Some(existing) = rowsets
        .keys()
        .find(|v| v.start <= version.end && version.start <= v.end)
    {
        return Err(Status::VersionAlreadyExist(format!(
            "tablet {} version {} overlaps existing {}",
            tablet_id, version, existing
        )));
    }
    rowsets.insert(version, rowset);
    Ok(())
}
