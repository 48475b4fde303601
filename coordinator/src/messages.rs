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

//! The single event type that drives the coordinator's event loop. Every
//! RPC handler and every background timer does nothing but build one of
//! these and post it; all the actual state mutation happens inside
//! `coordinator::CoordinatorAction::on_receive`.

use jm_core::error::Result;
use jm_core::ids::{AttemptId, InstanceId, JobId, LeaderSessionId};
use tokio::sync::{mpsc, oneshot};

use crate::execution_graph::{ExecutionState, InputSplit, JobGraph};
use crate::instance_manager::InstanceMetadata;
use crate::job_info::{ClientNotification, ListeningMode};

pub type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub struct RegisterInstanceOutcome {
    pub instance_id: InstanceId,
    pub already_registered: bool,
}

pub enum CoordinatorEvent {
    // -- leadership --
    LeadershipGranted(LeaderSessionId),
    LeadershipLost,

    // -- worker protocol --
    RegisterInstance {
        observed_session: Option<LeaderSessionId>,
        metadata: InstanceMetadata,
        slot_count: u32,
        reply: Reply<RegisterInstanceOutcome>,
    },
    InstanceHeartbeat {
        observed_session: Option<LeaderSessionId>,
        instance_id: InstanceId,
        accumulators: Vec<(String, Vec<u8>)>,
        reply: Reply<()>,
    },
    InstanceLost {
        instance_id: InstanceId,
    },
    UpdateTaskExecutionState {
        observed_session: Option<LeaderSessionId>,
        job_id: JobId,
        vertex_id: String,
        subtask_index: u32,
        attempt_id: AttemptId,
        new_state: ExecutionState,
        failure_cause: Option<String>,
        reply: Reply<()>,
    },
    RequestNextInputSplit {
        observed_session: Option<LeaderSessionId>,
        job_id: JobId,
        vertex_id: String,
        attempt_id: AttemptId,
        reply: Reply<Option<InputSplit>>,
    },
    AcknowledgeCheckpoint {
        observed_session: Option<LeaderSessionId>,
        job_id: JobId,
        checkpoint_id: u64,
        attempt_id: AttemptId,
        reply: Reply<()>,
    },
    DisconnectInstance {
        observed_session: Option<LeaderSessionId>,
        instance_id: InstanceId,
        reason: String,
    },
    ScheduleOrUpdateConsumers {
        observed_session: Option<LeaderSessionId>,
        job_id: JobId,
        partition_id: String,
        reply: Reply<()>,
    },
    RequestPartitionState {
        observed_session: Option<LeaderSessionId>,
        job_id: JobId,
        partition_id: String,
        consumer_execution_id: AttemptId,
        result_id: String,
        reply: Reply<Option<String>>,
    },

    // -- client protocol --
    /// `job_id` is client-assigned (spec.md 4.3, 9): resubmitting the same
    /// id while a prior submission's session is still alive resumes
    /// listening to that job instead of starting a new one.
    SubmitJob {
        job_id: JobId,
        job_name: String,
        graph: JobGraph,
        listening_mode: ListeningMode,
        notify: Option<mpsc::Sender<ClientNotification>>,
        reply: Reply<JobId>,
    },
    CancelJob {
        job_id: JobId,
        reply: Reply<()>,
    },
    GetJobStatus {
        job_id: JobId,
        reply: Reply<Option<String>>,
    },

    // -- internal timers --
    PollExpiredInstances,
    SweepLibraryCache,
    TriggerCheckpoints,
    /// One-shot expiry check for a job's `JobInfo`, armed at submission and
    /// re-armed on session touch (spec.md 9). Only removes the entry if
    /// `last_active_millis` hasn't moved since this event was scheduled.
    ExpireJobInfo {
        job_id: JobId,
        observed_last_active_millis: u64,
    },
    /// Re-run scheduling for every job with pending subtasks; fired after
    /// an instance registers so jobs that arrived before any slots were
    /// free get a chance to progress without waiting for the next
    /// submission (spec.md 4.6).
    RescheduleJobs,
}
