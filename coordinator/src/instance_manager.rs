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

//! Registry of connected worker instances: metadata, slot counts and last
//! heartbeat. This is in-memory rather than persisted to shared storage -
//! a job manager that loses leadership loses its instance registry too,
//! and workers re-register with whichever instance becomes the new leader
//! (spec.md 5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jm_core::error::{JobManagerError, Result};
use jm_core::ids::InstanceId;
use log::{debug, info};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub instance_id: InstanceId,
    pub host: String,
    pub grpc_port: u16,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    metadata: InstanceMetadata,
    total_slots: u32,
    available_slots: u32,
    last_heartbeat: Instant,
}

/// Represents a task slot reserved for scheduling but not yet visible as
/// available. When a reservation is biased toward a job, the scheduler
/// should prefer assigning that job's pending subtasks to it.
#[derive(Clone, Debug)]
pub struct InstanceReservation {
    pub instance_id: InstanceId,
    pub job_id: Option<String>,
}

impl InstanceReservation {
    pub fn new_free(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            job_id: None,
        }
    }

    pub fn assign(mut self, job_id: String) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn assigned(&self) -> bool {
        self.job_id.is_some()
    }
}

/// In-memory registry of all instances currently registered with this
/// coordinator, plus the pool of free task slots available for
/// scheduling.
pub struct InstanceManager {
    instances: RwLock<HashMap<InstanceId, InstanceRecord>>,
    heartbeat_timeout: Duration,
}

impl InstanceManager {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Register a new instance, or re-confirm an already-registered one
    /// (spec.md 4.1, `RegisterTaskManager`: same instance id reconnecting
    /// should succeed idempotently rather than creating a duplicate).
    pub fn register(&self, metadata: InstanceMetadata, slot_count: u32) -> bool {
        let mut instances = self.instances.write();
        let already_registered = instances.contains_key(&metadata.instance_id);

        instances.insert(
            metadata.instance_id.clone(),
            InstanceRecord {
                metadata,
                total_slots: slot_count,
                available_slots: slot_count,
                last_heartbeat: Instant::now(),
            },
        );

        already_registered
    }

    pub fn remove(&self, instance_id: &str) -> Option<InstanceMetadata> {
        self.instances
            .write()
            .remove(instance_id)
            .map(|record| record.metadata)
    }

    pub fn heartbeat(&self, instance_id: &str) -> Result<()> {
        let mut instances = self.instances.write();
        let record = instances.get_mut(instance_id).ok_or_else(|| {
            JobManagerError::Internal(format!("unknown instance {instance_id}"))
        })?;
        record.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn metadata(&self, instance_id: &str) -> Option<InstanceMetadata> {
        self.instances
            .read()
            .get(instance_id)
            .map(|r| r.metadata.clone())
    }

    /// Every instance whose last heartbeat is within the configured
    /// timeout.
    pub fn alive_instances(&self) -> Vec<InstanceId> {
        let instances = self.instances.read();
        instances
            .iter()
            .filter(|(_, record)| record.last_heartbeat.elapsed() <= self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every instance that has gone quiet past the heartbeat timeout. The
    /// coordinator loop polls this to declare instances dead (spec.md
    /// 4.1's worker liveness handling) since there is no separate watchdog
    /// task mutating shared state from outside the event loop.
    pub fn expired_instances(&self) -> Vec<InstanceId> {
        let instances = self.instances.read();
        instances
            .iter()
            .filter(|(_, record)| record.last_heartbeat.elapsed() > self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Available task slots per instance, in iteration order, for the
    /// scheduler's reservation algorithms.
    pub fn available_slots(&self) -> Vec<(InstanceId, u32)> {
        let instances = self.instances.read();
        instances
            .iter()
            .map(|(id, record)| (id.clone(), record.available_slots))
            .collect()
    }

    pub fn apply_reservations(&self, reservations: &[InstanceReservation]) {
        let mut instances = self.instances.write();
        let mut taken: HashMap<&str, u32> = HashMap::new();
        for reservation in reservations {
            *taken.entry(reservation.instance_id.as_str()).or_insert(0) += 1;
        }
        for (instance_id, count) in taken {
            if let Some(record) = instances.get_mut(instance_id) {
                record.available_slots = record.available_slots.saturating_sub(count);
            }
        }
        debug!("Applied {} slot reservations", reservations.len());
    }

    pub fn release_reservations(&self, reservations: &[InstanceReservation]) {
        let mut instances = self.instances.write();
        for reservation in reservations {
            if let Some(record) = instances.get_mut(reservation.instance_id.as_str()) {
                record.available_slots =
                    (record.available_slots + 1).min(record.total_slots);
            }
        }
        info!("Released {} slot reservations", reservations.len());
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Sum of every registered instance's total slot count, used to
    /// rewrite a vertex's `PARALLELISM_AUTO_MAX` sentinel at submission
    /// time (spec.md 4.2).
    pub fn total_slots(&self) -> u32 {
        self.instances.read().values().map(|r| r.total_slots).sum()
    }

    /// `(instance_id, host)` for every registered instance, used by the
    /// scheduler to resolve locality preference down to "same host" even
    /// when the exact preferred instance has no free slot left.
    pub fn hosts(&self) -> HashMap<InstanceId, String> {
        self.instances
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.metadata.host.clone()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(id: &str) -> InstanceMetadata {
        InstanceMetadata {
            instance_id: id.to_string(),
            host: "localhost".to_string(),
            grpc_port: 9000,
            cpu_cores: 4,
            memory_bytes: 1 << 30,
        }
    }

    #[test]
    fn re_registering_same_instance_reports_already_registered() {
        let manager = InstanceManager::new(Duration::from_secs(30));
        assert!(!manager.register(meta("w1"), 4));
        assert!(manager.register(meta("w1"), 4));
        assert_eq!(manager.instance_count(), 1);
    }

    #[test]
    fn reservations_reduce_and_restore_available_slots() {
        let manager = InstanceManager::new(Duration::from_secs(30));
        manager.register(meta("w1"), 4);

        let reservations = vec![
            InstanceReservation::new_free("w1".to_string()),
            InstanceReservation::new_free("w1".to_string()),
        ];
        manager.apply_reservations(&reservations);

        let slots = manager.available_slots();
        assert_eq!(slots[0].1, 2);

        manager.release_reservations(&reservations);
        let slots = manager.available_slots();
        assert_eq!(slots[0].1, 4);
    }

    #[test]
    fn expired_instances_are_reported_after_timeout() {
        let manager = InstanceManager::new(Duration::from_millis(0));
        manager.register(meta("w1"), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.expired_instances(), vec!["w1".to_string()]);
    }

    #[test]
    fn total_slots_sums_across_instances() {
        let manager = InstanceManager::new(Duration::from_secs(30));
        manager.register(meta("w1"), 4);
        manager.register(meta("w2"), 2);
        assert_eq!(manager.total_slots(), 6);
    }
}
