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

//! Outbound half of the worker protocol: the coordinator dialing a
//! registered instance's own gRPC endpoint to push deploy and checkpoint
//! commands, rather than waiting for the instance to poll for them
//! (spec.md 4, "Task Deployment" and "Checkpoint Coordinator"). Mirrors
//! `grpc_worker`'s inbound wiring, just with the client and server roles
//! reversed.

use jm_core::error::{JobManagerError, Result};
use jm_core::ids::{AttemptId, JobId, LeaderSessionId};
use tonic::transport::Channel;

use crate::proto::task_executor_grpc_client::TaskExecutorGrpcClient;
use crate::proto::{
    ConfirmCheckpointRequest, DeployTaskRequest, DisconnectWorkerRequest, Header,
    TriggerCheckpointRequest,
};
use crate::proto_ids::encode_uuid;

fn header_for(session: Option<LeaderSessionId>) -> Header {
    Header {
        leader_session_id: session.map(|s| encode_uuid(s.as_u128())),
    }
}

/// A single subtask attempt's location and identity, enough to address any
/// of the calls below.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub endpoint: String,
    pub job_id: JobId,
    pub vertex_id: String,
    pub subtask_index: u32,
    pub attempt_id: AttemptId,
}

#[tonic::async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn deploy_task(
        &self,
        session: Option<LeaderSessionId>,
        target: DeployTarget,
        json_plan: String,
    ) -> Result<()>;

    async fn trigger_checkpoint(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        job_id: JobId,
        checkpoint_id: u64,
        attempt_id: AttemptId,
    ) -> Result<()>;

    async fn confirm_checkpoint(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        job_id: JobId,
        checkpoint_id: u64,
        attempt_id: AttemptId,
    ) -> Result<()>;

    async fn disconnect(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        reason: &str,
    ) -> Result<()>;
}

/// Dials a fresh connection per call. Instances are not contacted often
/// enough (deploys and checkpoint phases, not per-record traffic) to
/// justify a pooled client here.
pub struct GrpcWorkerChannel;

impl GrpcWorkerChannel {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, endpoint: &str) -> Result<TaskExecutorGrpcClient<Channel>> {
        let uri = format!("http://{endpoint}");
        TaskExecutorGrpcClient::connect(uri)
            .await
            .map_err(|e| JobManagerError::Transport(tonic::Status::unavailable(e.to_string())))
    }
}

impl Default for GrpcWorkerChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl WorkerChannel for GrpcWorkerChannel {
    async fn deploy_task(
        &self,
        session: Option<LeaderSessionId>,
        target: DeployTarget,
        json_plan: String,
    ) -> Result<()> {
        let mut client = self.connect(&target.endpoint).await?;
        client
            .deploy_task(DeployTaskRequest {
                header: Some(header_for(session)),
                job_id: Some(encode_uuid(target.job_id.as_u128())),
                vertex_id: target.vertex_id,
                subtask_index: target.subtask_index,
                attempt_id: Some(encode_uuid(target.attempt_id.as_u128())),
                json_plan,
            })
            .await
            .map_err(JobManagerError::from)?;
        Ok(())
    }

    async fn trigger_checkpoint(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        job_id: JobId,
        checkpoint_id: u64,
        attempt_id: AttemptId,
    ) -> Result<()> {
        let mut client = self.connect(endpoint).await?;
        client
            .trigger_checkpoint(TriggerCheckpointRequest {
                header: Some(header_for(session)),
                job_id: Some(encode_uuid(job_id.as_u128())),
                checkpoint_id,
                attempt_id: Some(encode_uuid(attempt_id.as_u128())),
            })
            .await
            .map_err(JobManagerError::from)?;
        Ok(())
    }

    async fn confirm_checkpoint(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        job_id: JobId,
        checkpoint_id: u64,
        attempt_id: AttemptId,
    ) -> Result<()> {
        let mut client = self.connect(endpoint).await?;
        client
            .confirm_checkpoint(ConfirmCheckpointRequest {
                header: Some(header_for(session)),
                job_id: Some(encode_uuid(job_id.as_u128())),
                checkpoint_id,
                attempt_id: Some(encode_uuid(attempt_id.as_u128())),
            })
            .await
            .map_err(JobManagerError::from)?;
        Ok(())
    }

    async fn disconnect(
        &self,
        session: Option<LeaderSessionId>,
        endpoint: &str,
        reason: &str,
    ) -> Result<()> {
        let mut client = self.connect(endpoint).await?;
        client
            .disconnect(DisconnectWorkerRequest {
                header: Some(header_for(session)),
                reason: reason.to_string(),
            })
            .await
            .map_err(JobManagerError::from)?;
        Ok(())
    }
}

/// Test double recording every call instead of making one, so the
/// coordinator's dispatch logic can be exercised without a running
/// instance on the other end.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedCall {
        Deploy { endpoint: String, vertex_id: String, subtask_index: u32 },
        Trigger { endpoint: String, checkpoint_id: u64 },
        Confirm { endpoint: String, checkpoint_id: u64 },
        Disconnect { endpoint: String, reason: String },
    }

    #[derive(Default)]
    pub struct MockWorkerChannel {
        pub calls: Mutex<Vec<RecordedCall>>,
    }

    impl MockWorkerChannel {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[tonic::async_trait]
    impl WorkerChannel for MockWorkerChannel {
        async fn deploy_task(
            &self,
            _session: Option<LeaderSessionId>,
            target: DeployTarget,
            _json_plan: String,
        ) -> Result<()> {
            self.calls.lock().push(RecordedCall::Deploy {
                endpoint: target.endpoint,
                vertex_id: target.vertex_id,
                subtask_index: target.subtask_index,
            });
            Ok(())
        }

        async fn trigger_checkpoint(
            &self,
            _session: Option<LeaderSessionId>,
            endpoint: &str,
            _job_id: JobId,
            checkpoint_id: u64,
            _attempt_id: AttemptId,
        ) -> Result<()> {
            self.calls.lock().push(RecordedCall::Trigger {
                endpoint: endpoint.to_string(),
                checkpoint_id,
            });
            Ok(())
        }

        async fn confirm_checkpoint(
            &self,
            _session: Option<LeaderSessionId>,
            endpoint: &str,
            _job_id: JobId,
            checkpoint_id: u64,
            _attempt_id: AttemptId,
        ) -> Result<()> {
            self.calls.lock().push(RecordedCall::Confirm {
                endpoint: endpoint.to_string(),
                checkpoint_id,
            });
            Ok(())
        }

        async fn disconnect(
            &self,
            _session: Option<LeaderSessionId>,
            endpoint: &str,
            reason: &str,
        ) -> Result<()> {
            self.calls.lock().push(RecordedCall::Disconnect {
                endpoint: endpoint.to_string(),
                reason: reason.to_string(),
            });
            Ok(())
        }
    }
}
