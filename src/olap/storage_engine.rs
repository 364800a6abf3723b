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
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::common::config;
use crate::common::ids::{RowsetId, TabletId};
use crate::common::status::{Status, StatusResult};
use crate::olap::rowset::{
    MemRowsetFactory, PendingRowsetGuard, PendingRowsetSet, RowsetFactory, RowsetSharedPtr,
};
use crate::olap::tablet::TabletSharedPtr;
use crate::runtime::mem_tracker::{MemTracker, process_mem_tracker};

/// Tunables of schema change, snapshotted when the engine starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChangeOptions {
    pub memory_limitation_bytes: usize,
    /// 0 leaves the sort buffer bounded by memory only.
    pub sort_max_buffered_rows: usize,
    pub batch_size: usize,
    pub be_exec_version: i32,
}

impl SchemaChangeOptions {
    pub fn from_config() -> Self {
        Self {
            memory_limitation_bytes: config::memory_limitation_per_thread_for_schema_change_bytes(),
            sort_max_buffered_rows: config::schema_change_sort_max_buffered_rows(),
            batch_size: config::schema_change_batch_size(),
            be_exec_version: config::be_exec_version(),
        }
    }
}

impl Default for SchemaChangeOptions {
    fn default() -> Self {
        Self {
            memory_limitation_bytes: 2 * 1024 * 1024 * 1024,
            sort_max_buffered_rows: 0,
            batch_size: 4096,
            be_exec_version: 5,
        }
    }
}

/// Engine capabilities a conversion needs while it creates rowsets.
pub trait StorageEnv: Send + Sync + fmt::Debug {
    fn rowset_factory(&self) -> &dyn RowsetFactory;

    fn next_rowset_id(&self) -> RowsetId;

    /// Protect a rowset under construction from garbage collection.
    fn add_pending_rowset(&self, rowset_id: RowsetId) -> PendingRowsetGuard;

    /// Hand a rowset that will never become visible to garbage collection.
    fn add_unused_rowset(&self, rowset: RowsetSharedPtr);
}

pub struct StorageEngine {
    tablets: RwLock<HashMap<TabletId, TabletSharedPtr>>,
    tablets_in_converting: RwLock<HashSet<TabletId>>,
    pending_rowsets: Arc<PendingRowsetSet>,
    unused_rowsets: Mutex<HashMap<RowsetId, RowsetSharedPtr>>,
    next_rowset_id: AtomicI64,
    rowset_factory: Arc<dyn RowsetFactory>,
    options: SchemaChangeOptions,
    mem_tracker: Arc<MemTracker>,
}

impl fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEngine")
            .field("options", &self.options)
            .field("rowset_factory", &self.rowset_factory)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Engine with options read from the installed config file, or defaults.
    pub fn open() -> Arc<Self> {
        Self::new(SchemaChangeOptions::from_config())
    }

    pub fn new(options: SchemaChangeOptions) -> Arc<Self> {
        Self::with_rowset_factory(options, Arc::new(MemRowsetFactory))
    }

    pub fn with_rowset_factory(
        options: SchemaChangeOptions,
        rowset_factory: Arc<dyn RowsetFactory>,
    ) -> Arc<Self> {
        let mem_tracker = MemTracker::new_child("SchemaChange", -1, &process_mem_tracker());
        Arc::new(Self {
            tablets: RwLock::new(HashMap::new()),
            tablets_in_converting: RwLock::new(HashSet::new()),
            pending_rowsets: PendingRowsetSet::new(),
            unused_rowsets: Mutex::new(HashMap::new()),
            next_rowset_id: AtomicI64::new(1),
            rowset_factory,
            options,
            mem_tracker,
        })
    }

    pub fn options(&self) -> &SchemaChangeOptions {
        &self.options
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn add_tablet(&self, tablet: TabletSharedPtr) -> StatusResult<()> {
        let mut tablets = self.tablets.write().unwrap_or_else(|e| e.into_inner());
        if tablets.contains_key(&tablet.tablet_id()) {
            return Err(Status::InvalidArgument(format!(
                "tablet {} is already registered",
                tablet.tablet_id()
            )));
        }
        tablets.insert(tablet.tablet_id(), tablet);
        Ok(())
    }

    pub fn get_tablet(&self, tablet_id: TabletId) -> Option<TabletSharedPtr> {
        self.tablets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tablet_id)
            .cloned()
    }

    /// Admit `tablet_id` into the converting set; the guard removes it when dropped.
    pub fn try_add_converting(&self, tablet_id: TabletId) -> StatusResult<ConvertingGuard<'_>> {
        let mut converting = self
            .tablets_in_converting
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !converting.insert(tablet_id) {
            return Err(Status::AlterConflict(format!(
                "tablet {tablet_id} is already in converting"
            )));
        }
        Ok(ConvertingGuard {
            converting: &self.tablets_in_converting,
            tablet_id,
        })
    }

    pub fn tablet_in_converting(&self, tablet_id: TabletId) -> bool {
        self.tablets_in_converting
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&tablet_id)
    }

    pub fn pending_rowsets(&self) -> &Arc<PendingRowsetSet> {
        &self.pending_rowsets
    }

    pub fn is_unused_rowset(&self, rowset_id: RowsetId) -> bool {
        self.unused_rowsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&rowset_id)
    }

    pub fn unused_rowset_count(&self) -> usize {
        self.unused_rowsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drop unused rowsets that no pending guard protects. Returns how many were reclaimed.
    pub fn gc_unused_rowsets(&self) -> usize {
        let mut unused = self.unused_rowsets.lock().unwrap_or_else(|e| e.into_inner());
        let before = unused.len();
        unused.retain(|rowset_id, _| self.pending_rowsets.contains(*rowset_id));
        let reclaimed = before - unused.len();
        if reclaimed > 0 {
            info!(
                reclaimed,
                remaining = unused.len(),
                "garbage collected unused rowsets"
            );
        }
        reclaimed
    }
}

impl StorageEnv for StorageEngine {
    fn rowset_factory(&self) -> &dyn RowsetFactory {
        self.rowset_factory.as_ref()
    }

    fn next_rowset_id(&self) -> RowsetId {
        RowsetId(self.next_rowset_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add_pending_rowset(&self, rowset_id: RowsetId) -> PendingRowsetGuard {
        self.pending_rowsets.add(rowset_id)
    }

    fn add_unused_rowset(&self, rowset: RowsetSharedPtr) {
        debug!(rowset_id = %rowset.rowset_id(), version = %rowset.version(), "add unused rowset");
        self.unused_rowsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rowset.rowset_id(), rowset);
    }
}

/// Membership of one tablet in the converting set.
#[derive(Debug)]
pub struct ConvertingGuard<'a> {
    converting: &'a RwLock<HashSet<TabletId>>,
    tablet_id: TabletId,
}

impl ConvertingGuard<'_> {
    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }
}

impl Drop for ConvertingGuard<'_> {
    fn drop(&mut self) {
        self.converting
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tablet_id);
    }
}
