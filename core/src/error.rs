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

use std::fmt;

pub type Result<T> = std::result::Result<T, JobManagerError>;

/// Top level error type for the coordinator and its collaborators.
#[derive(Debug)]
pub enum JobManagerError {
    /// A job submission failed validation before an execution graph was
    /// even constructed (spec.md 4.2 steps 1-4, 9).
    JobSubmission(String),
    /// A vertex master-init hook, or other user-supplied code invoked
    /// during submission, raised an exception.
    JobExecution(String),
    /// The job was cancelled while a client was still waiting on it.
    JobCancellation(String),
    /// Something in the event-loop/gRPC plumbing broke (channel closed,
    /// codec failure, and the like).
    Internal(String),
    /// The leader-election backend reported an error; per spec.md 4.5
    /// this poisons the coordinator.
    Election(String),
    /// Transport-level failure talking to a worker or a client.
    Transport(tonic::Status),
}

impl fmt::Display for JobManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobManagerError::JobSubmission(msg) => write!(f, "job submission error: {msg}"),
            JobManagerError::JobExecution(msg) => write!(f, "job execution error: {msg}"),
            JobManagerError::JobCancellation(msg) => {
                write!(f, "job cancellation error: {msg}")
            }
            JobManagerError::Internal(msg) => write!(f, "internal error: {msg}"),
            JobManagerError::Election(msg) => write!(f, "leader election error: {msg}"),
            JobManagerError::Transport(status) => write!(f, "transport error: {status}"),
        }
    }
}

impl std::error::Error for JobManagerError {}

impl From<tonic::Status> for JobManagerError {
    fn from(status: tonic::Status) -> Self {
        JobManagerError::Transport(status)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for JobManagerError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        JobManagerError::Internal(format!("event loop channel closed: {e}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for JobManagerError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        JobManagerError::Internal(format!("reply channel dropped: {e}"))
    }
}

impl From<JobManagerError> for tonic::Status {
    fn from(e: JobManagerError) -> Self {
        match e {
            JobManagerError::Transport(status) => status,
            JobManagerError::JobSubmission(msg) => tonic::Status::invalid_argument(msg),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
