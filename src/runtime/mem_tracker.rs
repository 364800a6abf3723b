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
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Bytes held on behalf of a tracker; released when dropped.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Tracks logical memory usage for a component and its ancestors.
///
/// Only bytes explicitly reported by the caller are counted. A tracker with a
/// non-negative limit does not refuse consumption by itself; owners ask
/// [`MemTracker::limit_exceeded`] before holding more and react cooperatively.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
}

impl MemTracker {
    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(label.into(), -1, None))
    }

    /// Create a child tracker with the provided parent and limit (-1 for none).
    pub fn new_child(label: impl Into<String>, limit: i64, parent: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self::build(label.into(), limit, Some(Arc::clone(parent))))
    }

    fn build(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    pub fn consumption(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak_consumption(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// True if holding `bytes` more would push this tracker or any ancestor past its limit.
    pub fn limit_exceeded(&self, bytes: i64) -> bool {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.has_limit() && current.consumption().saturating_add(bytes) > current.limit
            {
                return true;
            }
            tracker = current.parent.as_deref();
        }
        false
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

static PROCESS_TRACKER: OnceLock<Arc<MemTracker>> = OnceLock::new();

/// Global process-level logical memory tracker.
pub fn process_mem_tracker() -> Arc<MemTracker> {
    Arc::clone(PROCESS_TRACKER.get_or_init(|| MemTracker::new_root("process")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_bytes_release_on_drop() {
        let root = MemTracker::new_root("root");
        let child = MemTracker::new_child("child", -1, &root);
        {
            let _held = TrackedBytes::new(128, Arc::clone(&child));
            assert_eq!(child.consumption(), 128);
            assert_eq!(root.consumption(), 128);
        }
        assert_eq!(child.consumption(), 0);
        assert_eq!(root.consumption(), 0);
        assert_eq!(child.peak_consumption(), 128);
    }

    #[test]
    fn limit_checks_ancestors() {
        let root = MemTracker::new_root("root");
        let parent = MemTracker::new_child("parent", 100, &root);
        let child = MemTracker::new_child("child", -1, &parent);
        child.consume(60);
        assert!(!child.limit_exceeded(40));
        assert!(child.limit_exceeded(41));
        child.release(60);
        assert!(!child.limit_exceeded(100));
        assert!(child.limit_exceeded(101));
    }
}
