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

//! Test harness for exercising the coordinator's event loop end to end
//! without a real gRPC transport or etcd. A `TestCoordinator` wires up a
//! `CoordinatorState` plus event loop exactly like `main.rs` does and
//! gives tests a way to post events and wait for the reply.

use std::sync::Arc;
use std::time::Duration;

use jm_core::error::Result;
use jm_core::event_loop::EventSender;
use jm_core::ids::{AttemptId, JobId};

use crate::config::CoordinatorConfig;
use crate::coordinator::{self, CoordinatorState};
use crate::execution_graph::{ExecutionState, JobVertex};
use crate::instance_manager::InstanceMetadata;
use crate::job_info::{ClientNotification, ListeningMode};
use crate::messages::CoordinatorEvent;

pub struct TestCoordinator {
    pub state: Arc<CoordinatorState>,
    pub sender: EventSender<CoordinatorEvent>,
}

impl TestCoordinator {
    pub fn start() -> Self {
        let config = CoordinatorConfig::default().with_event_loop_buffer_size(1000);
        let (state, sender) = coordinator::spawn(config, None);
        Self { state, sender }
    }

    pub async fn grant_leadership(&self) {
        self.sender
            .post_event(CoordinatorEvent::LeadershipGranted(
                jm_core::ids::LeaderSessionId::new(),
            ))
            .await
            .unwrap();
        // give the consumer task a turn before the caller proceeds
        tokio::task::yield_now().await;
    }

    pub async fn register_instance(&self, instance_id: &str, slots: u32) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::RegisterInstance {
                observed_session: self.state.current_session(),
                metadata: InstanceMetadata {
                    instance_id: instance_id.to_string(),
                    host: "localhost".to_string(),
                    grpc_port: 9000,
                    cpu_cores: 4,
                    memory_bytes: 1 << 30,
                },
                slot_count: slots,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap().already_registered
    }

    pub async fn submit_job(&self, name: &str, vertices: Vec<JobVertex>) -> Result<JobId> {
        let job_id = JobId::new();
        self.submit_job_with_id(job_id, name, vertices, ListeningMode::Detached, None)
            .await
    }

    /// Submit with `ExecutionResultAndStateChanges` listening and return
    /// both the assigned job id and the receiving half of its
    /// notification channel.
    pub async fn submit_job_listening(
        &self,
        name: &str,
        vertices: Vec<JobVertex>,
    ) -> Result<(JobId, tokio::sync::mpsc::Receiver<ClientNotification>)> {
        let job_id = JobId::new();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let result = self
            .submit_job_with_id(
                job_id,
                name,
                vertices,
                ListeningMode::ExecutionResultAndStateChanges,
                Some(tx),
            )
            .await?;
        Ok((result, rx))
    }

    /// Resubmit an already-known job id: a resumed job with an alive
    /// session replays its stored outcome onto the fresh notify channel
    /// instead of being scheduled again.
    pub async fn resubmit_job_listening(
        &self,
        job_id: JobId,
        name: &str,
        vertices: Vec<JobVertex>,
    ) -> Result<(JobId, tokio::sync::mpsc::Receiver<ClientNotification>)> {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let result = self
            .submit_job_with_id(
                job_id,
                name,
                vertices,
                ListeningMode::ExecutionResultAndStateChanges,
                Some(tx),
            )
            .await?;
        Ok((result, rx))
    }

    async fn submit_job_with_id(
        &self,
        job_id: JobId,
        name: &str,
        vertices: Vec<JobVertex>,
        listening_mode: ListeningMode,
        notify: Option<tokio::sync::mpsc::Sender<ClientNotification>>,
    ) -> Result<JobId> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::SubmitJob {
                job_id,
                job_name: name.to_string(),
                graph: crate::execution_graph::JobGraph::new(vertices),
                listening_mode,
                notify,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::CancelJob { job_id, reply: tx })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    pub async fn job_status(&self, job_id: JobId) -> Option<String> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::GetJobStatus { job_id, reply: tx })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    pub async fn report_state(
        &self,
        job_id: JobId,
        vertex_id: &str,
        subtask_index: u32,
        attempt_id: AttemptId,
        new_state: ExecutionState,
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .post_event(CoordinatorEvent::UpdateTaskExecutionState {
                observed_session: self.state.current_session(),
                job_id,
                vertex_id: vertex_id.to_string(),
                subtask_index,
                attempt_id,
                new_state,
                failure_cause: None,
                reply: tx,
            })
            .await
            .unwrap();
        let _ = rx.await.unwrap();
    }

    pub async fn disconnect_instance(&self, instance_id: &str) {
        self.sender
            .post_event(CoordinatorEvent::InstanceLost {
                instance_id: instance_id.to_string(),
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }

    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn single_vertex_job(name: &str, parallelism: u32) -> Vec<JobVertex> {
    vec![JobVertex {
        id: name.to_string(),
        name: name.to_string(),
        parallelism,
        inputs: vec![],
        invokable_class_name: "test.Invokable".to_string(),
        master_init_hook: None,
    }]
}
