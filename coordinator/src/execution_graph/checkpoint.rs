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

//! Tracks in-flight checkpoints for one job's execution graph: which
//! executions still owe an acknowledgement, and whether the checkpoint can
//! be declared complete. Embedded in `ExecutionGraph` rather than run as
//! its own event loop - a job's checkpoint lifecycle is part of that job's
//! state, not a separate actor.

use std::collections::HashSet;

use jm_core::ids::{AttemptId, JobId};
use jm_core::time::timestamp_millis;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    InProgress,
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct PendingCheckpoint {
    pub checkpoint_id: u64,
    pub state: CheckpointState,
    pub triggered_at_millis: u64,
    pending_acks: HashSet<AttemptId>,
}

impl PendingCheckpoint {
    fn new(checkpoint_id: u64, expected: HashSet<AttemptId>) -> Self {
        Self {
            checkpoint_id,
            state: CheckpointState::InProgress,
            triggered_at_millis: timestamp_millis(),
            pending_acks: expected,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending_acks.is_empty()
    }
}

pub struct CheckpointCoordinator {
    job_id: JobId,
    next_checkpoint_id: u64,
    current: Option<PendingCheckpoint>,
    pub last_completed_checkpoint_id: Option<u64>,
}

impl CheckpointCoordinator {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            next_checkpoint_id: 1,
            current: None,
            last_completed_checkpoint_id: None,
        }
    }

    /// Begin a new checkpoint awaiting acknowledgement from every given
    /// attempt. Aborts (and replaces) any checkpoint already in flight -
    /// only one checkpoint is outstanding per job at a time.
    pub fn trigger(&mut self, expected_acks: HashSet<AttemptId>) -> u64 {
        if let Some(stale) = self.current.take() {
            warn!(
                "Aborting checkpoint {} for job {} to start a new one",
                stale.checkpoint_id, self.job_id
            );
        }

        let checkpoint_id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;

        info!(
            "Triggered checkpoint {checkpoint_id} for job {} awaiting {} acks",
            self.job_id,
            expected_acks.len()
        );

        self.current = Some(PendingCheckpoint::new(checkpoint_id, expected_acks));
        checkpoint_id
    }

    /// Record an acknowledgement. Returns `true` if this was the last
    /// outstanding ack and the checkpoint is now complete.
    pub fn acknowledge(&mut self, checkpoint_id: u64, attempt_id: AttemptId) -> bool {
        let Some(pending) = self.current.as_mut() else {
            return false;
        };
        if pending.checkpoint_id != checkpoint_id {
            return false;
        }

        pending.pending_acks.remove(&attempt_id);

        if pending.is_complete() {
            pending.state = CheckpointState::Completed;
            self.last_completed_checkpoint_id = Some(checkpoint_id);
            info!("Checkpoint {checkpoint_id} for job {} completed", self.job_id);
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Abandon the in-flight checkpoint, e.g. because one of the
    /// contributing executions failed before it could acknowledge.
    pub fn abort(&mut self) {
        if let Some(mut pending) = self.current.take() {
            pending.state = CheckpointState::Aborted;
            warn!(
                "Aborted checkpoint {} for job {}",
                pending.checkpoint_id, self.job_id
            );
        }
    }

    pub fn current(&self) -> Option<&PendingCheckpoint> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn completes_once_every_ack_received() {
        let mut coordinator = CheckpointCoordinator::new(JobId::new());
        let a1 = AttemptId::new();
        let a2 = AttemptId::new();
        let expected: HashSet<_> = [a1, a2].into_iter().collect();

        let id = coordinator.trigger(expected);
        assert!(!coordinator.acknowledge(id, a1));
        assert!(coordinator.acknowledge(id, a2));
        assert_eq!(coordinator.last_completed_checkpoint_id, Some(id));
        assert!(coordinator.current().is_none());
    }

    #[test]
    fn ack_for_wrong_checkpoint_id_is_ignored() {
        let mut coordinator = CheckpointCoordinator::new(JobId::new());
        let a1 = AttemptId::new();
        let id = coordinator.trigger([a1].into_iter().collect());
        assert!(!coordinator.acknowledge(id + 1, a1));
        assert!(coordinator.current().is_some());
    }

    #[test]
    fn new_trigger_replaces_stale_checkpoint() {
        let mut coordinator = CheckpointCoordinator::new(JobId::new());
        let a1 = AttemptId::new();
        let first = coordinator.trigger([a1].into_iter().collect());
        let second = coordinator.trigger([a1].into_iter().collect());
        assert_ne!(first, second);
        assert!(!coordinator.acknowledge(first, a1));
    }
}
