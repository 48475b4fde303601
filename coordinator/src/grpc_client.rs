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

//! Client-facing gRPC service: job submission, cancellation, and status
//! queries. Like `grpc_worker`, this is pure wiring onto the coordinator
//! event loop - deserializing the submitted job graph is the only real
//! work done here, and even that is delegated to `decode_job_graph`.

use std::pin::Pin;

use jm_core::event_loop::EventSender;
use jm_core::ids::JobId;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use crate::execution_graph::{JobGraph, JobVertex};
use crate::job_info::{ClientNotification, ListeningMode};
use crate::messages::CoordinatorEvent;
use crate::proto::client_grpc_server::ClientGrpc;
use crate::proto::submit_job_response::JobResultFailure;
use crate::proto::submit_job_response::JobResultSuccess;
use crate::proto::{self, *};
use crate::proto_ids::{decode_uuid, encode_uuid};

/// Deserialize the opaque job graph bytes a client submitted. The wire
/// format for a job graph (and the planner that produces it) is out of
/// scope here; callers are expected to have already turned their job
/// definition into the simple vertex list this crate schedules.
fn decode_job_graph(bytes: &[u8]) -> Result<JobGraph, Status> {
    if bytes.is_empty() {
        return Ok(JobGraph::default());
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Status::invalid_argument("job graph payload is not valid UTF-8"))?;

    let mut vertices = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.splitn(5, ',');
        let id = parts
            .next()
            .ok_or_else(|| Status::invalid_argument("malformed job graph line"))?
            .trim()
            .to_string();
        let parallelism: u32 = parts
            .next()
            .ok_or_else(|| Status::invalid_argument("malformed job graph line"))?
            .trim()
            .parse()
            .map_err(|_| Status::invalid_argument("parallelism must be an integer"))?;
        let inputs = parts
            .next()
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let invokable_class_name = parts.next().unwrap_or("").trim().to_string();
        let master_init_hook = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        vertices.push(JobVertex {
            name: id.clone(),
            id,
            parallelism,
            inputs,
            invokable_class_name,
            master_init_hook,
        });
    }

    Ok(JobGraph::new(vertices))
}

fn listening_mode_from_proto(mode: i32) -> ListeningMode {
    match proto::ListeningMode::from_i32(mode) {
        Some(proto::ListeningMode::ExecutionResult) => ListeningMode::ExecutionResult,
        Some(proto::ListeningMode::ExecutionResultAndStateChanges) => {
            ListeningMode::ExecutionResultAndStateChanges
        }
        _ => ListeningMode::Detached,
    }
}

pub struct JobManagerClientGrpc {
    sender: EventSender<CoordinatorEvent>,
}

impl JobManagerClientGrpc {
    pub fn new(sender: EventSender<CoordinatorEvent>) -> Self {
        Self { sender }
    }
}

pub type SubmitJobResponseStream =
    Pin<Box<dyn Stream<Item = Result<SubmitJobResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl ClientGrpc for JobManagerClientGrpc {
    type SubmitJobStream = SubmitJobResponseStream;

    /// The first message on the returned stream is the synchronous submit
    /// outcome; for anything but `Detached` listening mode a second
    /// message follows once the job reaches a terminal state, forwarded
    /// from the coordinator's per-job notification channel.
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<Self::SubmitJobStream>, Status> {
        let req = request.into_inner();
        let graph = decode_job_graph(&req.job_graph)?;
        let listening_mode = listening_mode_from_proto(req.listening_mode);
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));

        let notify = if matches!(listening_mode, ListeningMode::Detached) {
            None
        } else {
            Some(tokio::sync::mpsc::channel(4))
        };
        let (notify_tx, notify_rx) = match notify {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };

        let (submit_tx, submit_rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::SubmitJob {
                job_id,
                job_name: format!("job-{job_id}"),
                graph,
                listening_mode,
                notify: notify_tx,
                reply: submit_tx,
            })
            .await
            .map_err(Status::from)?;

        let (resp_tx, resp_rx) = tokio::sync::mpsc::channel(4);

        tokio::task::spawn(async move {
            let outcome = match submit_rx.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = resp_tx
                        .send(Err(Status::internal("coordinator dropped the reply channel")))
                        .await;
                    return;
                }
            };

            let submit_response = match &outcome {
                Ok(job_id) => SubmitJobResponse {
                    header: Some(Header { leader_session_id: None }),
                    outcome: Some(submit_job_response::Outcome::JobId(encode_uuid(
                        job_id.as_u128(),
                    ))),
                },
                Err(e) => SubmitJobResponse {
                    header: Some(Header { leader_session_id: None }),
                    outcome: Some(submit_job_response::Outcome::FailureCause(e.to_string())),
                },
            };
            if resp_tx.send(Ok(submit_response)).await.is_err() {
                return;
            }

            let (Ok(_), Some(mut notify_rx)) = (&outcome, notify_rx) else {
                return;
            };

            if let Some(notification) = notify_rx.recv().await {
                let result_response = match notification {
                    ClientNotification::Success { accumulators } => SubmitJobResponse {
                        header: Some(Header { leader_session_id: None }),
                        outcome: Some(submit_job_response::Outcome::ResultSuccess(
                            JobResultSuccess {
                                accumulators: accumulators
                                    .into_iter()
                                    .map(|(name, serialized_value)| AccumulatorEntry {
                                        name,
                                        serialized_value,
                                    })
                                    .collect(),
                            },
                        )),
                    },
                    ClientNotification::Failure { cause } => SubmitJobResponse {
                        header: Some(Header { leader_session_id: None }),
                        outcome: Some(submit_job_response::Outcome::ResultFailure(
                            JobResultFailure { cause },
                        )),
                    },
                };
                let _ = resp_tx.send(Ok(result_response)).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::CancelJob { job_id, reply: tx })
            .await
            .map_err(Status::from)?;

        let result = rx
            .await
            .map_err(|_| Status::internal("coordinator dropped the reply channel"))?;

        let (success, failure_cause) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        Ok(Response::new(CancelJobResponse {
            header: Some(Header { leader_session_id: None }),
            success,
            failure_cause,
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let req = request.into_inner();
        let job_id = JobId::from_u128(decode_uuid(
            req.job_id.as_ref().ok_or_else(|| Status::invalid_argument("missing job_id"))?,
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::GetJobStatus { job_id, reply: tx })
            .await
            .map_err(Status::from)?;

        let status = rx
            .await
            .map_err(|_| Status::internal("coordinator dropped the reply channel"))?
            .map_err(Status::from)?;

        Ok(Response::new(GetJobStatusResponse {
            header: Some(Header { leader_session_id: None }),
            status,
        }))
    }
}
