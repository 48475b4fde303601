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

//! Per-job bookkeeping that lives alongside an `ExecutionGraph` but isn't
//! part of the graph itself: who submitted the job, what reply target a
//! client is listening on, and when the coordinator last touched it.

use std::collections::HashMap;

use jm_core::ids::JobId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    /// The submitter does not want updates; the job runs detached.
    Detached,
    /// The submitter wants to be told the final result only.
    ExecutionResult,
    /// The submitter wants every state transition plus the final result.
    ExecutionResultAndStateChanges,
}

/// The terminal outcome pushed to a client still listening on a job
/// (spec.md 4.3, 6). `JobResultSuccess` carries the merged accumulators;
/// `JobResultFailure` carries a human-readable cause, whether the job was
/// cancelled or actually failed.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    Success { accumulators: HashMap<String, Vec<u8>> },
    Failure { cause: String },
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: JobId,
    pub job_name: String,
    pub listening_mode: ListeningMode,
    pub submitted_at_millis: u64,
    /// Set once the job reaches a globally terminal state.
    pub finished_at_millis: Option<u64>,
    /// Where to push `ClientNotification`s once the job terminates. Absent
    /// for detached submissions, or once the client's stream has been
    /// torn down.
    pub reply: Option<mpsc::Sender<ClientNotification>>,
    /// Whether a client session is still considered alive for this job.
    /// Flipped by session-timeout expiry (spec.md 9); a resubmission of
    /// the same job id while this is still true replays the job instead
    /// of starting a new one.
    pub session_alive: bool,
    pub session_timeout_secs: u64,
    /// Bumped on every client touch (submit, resubmit, listen) - the
    /// one-shot expiry timer only removes this `JobInfo` if this value
    /// hasn't moved since the timer was armed.
    pub last_active_millis: u64,
    /// The terminal notification last computed for this job, kept around
    /// so a client that resubmits the same job id after it already
    /// finished gets the result replayed immediately instead of silence.
    pub last_outcome: Option<ClientNotification>,
}

impl JobInfo {
    pub fn new(
        job_id: JobId,
        job_name: String,
        listening_mode: ListeningMode,
        session_timeout_secs: u64,
        reply: Option<mpsc::Sender<ClientNotification>>,
    ) -> Self {
        let now = jm_core::time::timestamp_millis();
        Self {
            job_id,
            job_name,
            listening_mode,
            submitted_at_millis: now,
            finished_at_millis: None,
            reply,
            session_alive: true,
            session_timeout_secs,
            last_active_millis: now,
            last_outcome: None,
        }
    }

    pub fn mark_finished(&mut self) {
        if self.finished_at_millis.is_none() {
            self.finished_at_millis = Some(jm_core::time::timestamp_millis());
        }
    }

    pub fn mark_active(&mut self) {
        self.last_active_millis = jm_core::time::timestamp_millis();
    }

    pub fn wants_state_changes(&self) -> bool {
        matches!(
            self.listening_mode,
            ListeningMode::ExecutionResultAndStateChanges
        )
    }

    pub fn wants_result(&self) -> bool {
        !matches!(self.listening_mode, ListeningMode::Detached)
    }
}
