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

//! Thin `tonic` service wiring: unwraps the request, builds a
//! `CoordinatorEvent`, posts it to the coordinator's event loop, and waits
//! for the reply. None of the actual worker protocol logic lives here.

use jm_core::event_loop::EventSender;
use jm_core::ids::{AttemptId, JobId, LeaderSessionId};
use tonic::{Request, Response, Status};

use crate::execution_graph::ExecutionState;
use crate::instance_manager::InstanceMetadata;
use crate::messages::CoordinatorEvent;
use crate::proto::worker_grpc_server::WorkerGrpc;
use crate::proto::{self, *};
use crate::proto_ids::{decode_uuid, encode_uuid};

fn observed_session(header: &Option<Header>) -> Option<LeaderSessionId> {
    header
        .as_ref()
        .and_then(|h| h.leader_session_id.as_ref())
        .map(|id| LeaderSessionId::from_u128(decode_uuid(id)))
}

fn header_for(session: Option<LeaderSessionId>) -> Header {
    Header {
        leader_session_id: session.map(|s| encode_uuid(s.as_u128())),
    }
}

fn execution_state_from_str(s: &str) -> Result<ExecutionState, Status> {
    match s {
        "Created" => Ok(ExecutionState::Created),
        "Scheduled" => Ok(ExecutionState::Scheduled),
        "Deploying" => Ok(ExecutionState::Deploying),
        "Running" => Ok(ExecutionState::Running),
        "Finished" => Ok(ExecutionState::Finished),
        "Canceling" => Ok(ExecutionState::Canceling),
        "Canceled" => Ok(ExecutionState::Canceled),
        "Failed" => Ok(ExecutionState::Failed),
        other => Err(Status::invalid_argument(format!("unknown execution state {other}"))),
    }
}

pub struct JobManagerWorkerGrpc {
    sender: EventSender<CoordinatorEvent>,
}

impl JobManagerWorkerGrpc {
    pub fn new(sender: EventSender<CoordinatorEvent>) -> Self {
        Self { sender }
    }

    async fn post_and_await<T>(
        &self,
        event: CoordinatorEvent,
        recv: tokio::sync::oneshot::Receiver<jm_core::error::Result<T>>,
    ) -> Result<T, Status> {
        self.sender.post_event(event).await.map_err(Status::from)?;
        recv.await
            .map_err(|_| Status::internal("coordinator dropped the reply channel"))?
            .map_err(Status::from)
    }
}

#[tonic::async_trait]
impl WorkerGrpc for JobManagerWorkerGrpc {
    async fn register_task_manager(
        &self,
        request: Request<RegisterTaskManagerRequest>,
    ) -> Result<Response<RegisterTaskManagerResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);

        let conn = req.conn_info.unwrap_or_default();
        let hw = req.hw_info.unwrap_or_default();
        let instance_id = format!("{}:{}", conn.host, conn.grpc_port);

        let metadata = InstanceMetadata {
            instance_id: instance_id.clone(),
            host: conn.host,
            grpc_port: conn.grpc_port as u16,
            cpu_cores: hw.cpu_cores,
            memory_bytes: hw.memory_bytes,
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        let outcome = self
            .post_and_await(
                CoordinatorEvent::RegisterInstance {
                    observed_session: observed,
                    metadata,
                    slot_count: req.slot_count,
                    reply: tx,
                },
                rx,
            )
            .await?;

        let outcome_msg = if outcome.already_registered {
            register_task_manager_response::Outcome::AlreadyRegistered(
                register_task_manager_response::AlreadyRegistered {
                    instance_id: outcome.instance_id,
                    blob_server_port: 0,
                },
            )
        } else {
            register_task_manager_response::Outcome::Acknowledged(
                register_task_manager_response::Acknowledged {
                    instance_id: outcome.instance_id,
                    blob_server_port: 0,
                },
            )
        };

        Ok(Response::new(RegisterTaskManagerResponse {
            header: Some(header_for(observed)),
            outcome: Some(outcome_msg),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);

        let accumulators = req
            .accumulators
            .into_iter()
            .map(|a| (a.name, a.serialized_value))
            .collect();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.post_and_await(
            CoordinatorEvent::InstanceHeartbeat {
                observed_session: observed,
                instance_id: req.instance_id,
                accumulators,
                reply: tx,
            },
            rx,
        )
        .await?;

        Ok(Response::new(HeartbeatResponse {
            header: Some(header_for(observed)),
        }))
    }

    async fn update_task_execution_state(
        &self,
        request: Request<UpdateTaskExecutionStateRequest>,
    ) -> Result<Response<UpdateTaskExecutionStateResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        let state = req
            .state
            .ok_or_else(|| Status::invalid_argument("missing task execution state"))?;

        let job_id = JobId::from_u128(decode_uuid(
            state.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));
        let attempt_id = AttemptId::from_u128(decode_uuid(
            state
                .attempt_id
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("missing attempt_id"))?,
        ));
        let new_state = execution_state_from_str(&state.new_state)?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.post_and_await(
            CoordinatorEvent::UpdateTaskExecutionState {
                observed_session: observed,
                job_id,
                vertex_id: state.vertex_id,
                subtask_index: state.subtask_index,
                attempt_id,
                new_state,
                failure_cause: (!state.error.is_empty()).then_some(state.error),
                reply: tx,
            },
            rx,
        )
        .await?;

        Ok(Response::new(UpdateTaskExecutionStateResponse {
            header: Some(header_for(observed)),
            accepted: true,
        }))
    }

    async fn request_next_input_split(
        &self,
        request: Request<RequestNextInputSplitRequest>,
    ) -> Result<Response<RequestNextInputSplitResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));
        let attempt_id = AttemptId::from_u128(decode_uuid(
            req.attempt_id
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("missing attempt_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let split = self
            .post_and_await(
                CoordinatorEvent::RequestNextInputSplit {
                    observed_session: observed,
                    job_id,
                    vertex_id: req.vertex_id,
                    attempt_id,
                    reply: tx,
                },
                rx,
            )
            .await?;

        Ok(Response::new(RequestNextInputSplitResponse {
            header: Some(header_for(observed)),
            split: split.map(|s| s.payload),
        }))
    }

    async fn request_partition_state(
        &self,
        request: Request<RequestPartitionStateRequest>,
    ) -> Result<Response<RequestPartitionStateResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));
        let consumer_execution_id = AttemptId::from_u128(decode_uuid(
            req.consumer_execution_id
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("missing consumer_execution_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let state = self
            .post_and_await(
                CoordinatorEvent::RequestPartitionState {
                    observed_session: observed,
                    job_id,
                    partition_id: req.partition_id,
                    consumer_execution_id,
                    result_id: req.result_id,
                    reply: tx,
                },
                rx,
            )
            .await?;

        Ok(Response::new(RequestPartitionStateResponse {
            header: Some(header_for(observed)),
            state,
        }))
    }

    async fn acknowledge_checkpoint(
        &self,
        request: Request<AcknowledgeCheckpointRequest>,
    ) -> Result<Response<AcknowledgeCheckpointResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));
        let attempt_id = AttemptId::from_u128(decode_uuid(
            req.attempt_id
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("missing attempt_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.post_and_await(
            CoordinatorEvent::AcknowledgeCheckpoint {
                observed_session: observed,
                job_id,
                checkpoint_id: req.checkpoint_id,
                attempt_id,
                reply: tx,
            },
            rx,
        )
        .await?;

        Ok(Response::new(AcknowledgeCheckpointResponse {
            header: Some(header_for(observed)),
        }))
    }

    async fn disconnect(
        &self,
        request: Request<DisconnectRequest>,
    ) -> Result<Response<DisconnectResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        self.sender
            .post_event(CoordinatorEvent::DisconnectInstance {
                observed_session: observed,
                instance_id: req.instance_id,
                reason: req.reason,
            })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(DisconnectResponse {
            header: Some(header_for(observed)),
        }))
    }

    async fn send_stack_trace(
        &self,
        _request: Request<SendStackTraceRequest>,
    ) -> Result<Response<SendStackTraceResponse>, Status> {
        Err(Status::unimplemented(
            "stack trace collection is not implemented by this coordinator",
        ))
    }

    async fn schedule_or_update_consumers(
        &self,
        request: Request<ScheduleOrUpdateConsumersRequest>,
    ) -> Result<Response<ScheduleOrUpdateConsumersResponse>, Status> {
        let req = request.into_inner();
        let observed = observed_session(&req.header);
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let result = self
            .post_and_await(
                CoordinatorEvent::ScheduleOrUpdateConsumers {
                    observed_session: observed,
                    job_id,
                    partition_id: req.partition_id,
                    reply: tx,
                },
                rx,
            )
            .await;

        let (success, failure_cause) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        Ok(Response::new(ScheduleOrUpdateConsumersResponse {
            header: Some(header_for(observed)),
            success,
            failure_cause,
        }))
    }
}
