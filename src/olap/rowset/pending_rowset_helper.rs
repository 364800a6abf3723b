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
use std::sync::{Arc, Mutex};

use crate::common::ids::RowsetId;

/// Rowsets under construction; garbage collection must not reclaim them.
#[derive(Debug, Default)]
pub struct PendingRowsetSet {
    rowsets: Mutex<HashMap<RowsetId, usize>>,
}

impl PendingRowsetSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(self: &Arc<Self>, rowset_id: RowsetId) -> PendingRowsetGuard {
        let mut rowsets = self.rowsets.lock().unwrap_or_else(|e| e.into_inner());
        *rowsets.entry(rowset_id).or_insert(0) += 1;
        PendingRowsetGuard {
            set: Some(Arc::clone(self)),
            rowset_id,
        }
    }

    pub fn contains(&self, rowset_id: RowsetId) -> bool {
        self.rowsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&rowset_id)
    }

    pub fn len(&self) -> usize {
        self.rowsets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, rowset_id: RowsetId) {
        let mut rowsets = self.rowsets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = rowsets.get_mut(&rowset_id) {
            *count -= 1;
            if *count == 0 {
                rowsets.remove(&rowset_id);
            }
        }
    }
}

/// Keeps one rowset id pending until dropped.
#[derive(Debug)]
pub struct PendingRowsetGuard {
    set: Option<Arc<PendingRowsetSet>>,
    rowset_id: RowsetId,
}

impl PendingRowsetGuard {
    pub fn rowset_id(&self) -> RowsetId {
        self.rowset_id
    }

    /// Release early; the guard no longer protects anything afterwards.
    pub fn drop_guard(&mut self) {
        if let Some(set) = self.set.take() {
            set.remove(self.rowset_id);
        }
    }
}

impl Drop for PendingRowsetGuard {
    fn drop(&mut self) {
        self.drop_guard();
    }
}
