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

//! The execution graph: a job graph materialized into schedulable
//! vertices and executions, plus the embedded checkpoint coordinator that
//! tracks in-flight checkpoints for the graph's running executions.

pub mod checkpoint;

use std::collections::HashMap;

use jm_core::error::{JobManagerError, Result};
use jm_core::ids::{AttemptId, InstanceId, JobId};
use jm_core::time::timestamp_millis;
use log::{debug, info, warn};

use crate::execution_graph::checkpoint::CheckpointCoordinator;

pub type JobVertexId = String;

/// Sentinel parallelism value meaning "rewrite to the scheduler's total
/// slot count at submission time" (spec.md 4.2).
pub const PARALLELISM_AUTO_MAX: u32 = 0;

/// One node of the submitted job graph: a logical operator with a
/// parallelism and a set of upstream vertices it consumes input from.
/// Topology is taken as given - the coordinator does not sort or validate
/// that the graph is acyclic, that is the submitter's responsibility.
#[derive(Debug, Clone)]
pub struct JobVertex {
    pub id: JobVertexId,
    pub name: String,
    pub parallelism: u32,
    pub inputs: Vec<JobVertexId>,
    /// Fully-qualified name of the invokable class the worker should
    /// instantiate for each subtask of this vertex. Validated non-empty
    /// at submission time; the class is never actually loaded (executing
    /// user code is out of scope here).
    pub invokable_class_name: String,
    /// Optional hook name invoked once against the materialized job graph
    /// before scheduling starts. Stubbed: the coordinator only logs that
    /// it ran the hook, it never loads or executes it.
    pub master_init_hook: Option<String>,
}

/// Checkpoint settings carried on a job graph (spec.md 4.7): how often to
/// checkpoint, how long to wait for acks, and which vertices participate
/// in each phase. An empty vertex list for a phase means "every vertex
/// currently running participates", preserving the simple all-running
/// behavior for job graphs that don't name anything explicitly.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSettings {
    pub interval_millis: Option<u64>,
    pub timeout_millis: u64,
    pub trigger_vertices: Vec<JobVertexId>,
    pub ack_vertices: Vec<JobVertexId>,
    pub confirm_vertices: Vec<JobVertexId>,
}

/// The logical plan a client submits, before it has been materialized
/// into an `ExecutionGraph`.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    pub vertices: Vec<JobVertex>,
    pub checkpoint_settings: CheckpointSettings,
    /// Retry count override; `None` means "use the coordinator's default"
    /// (spec.md 4.2 step 7).
    pub retries: Option<u32>,
}

impl JobGraph {
    pub fn new(vertices: Vec<JobVertex>) -> Self {
        Self {
            vertices,
            checkpoint_settings: CheckpointSettings::default(),
            retries: None,
        }
    }

    pub fn with_checkpoint_settings(mut self, settings: CheckpointSettings) -> Self {
        self.checkpoint_settings = settings;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Arrange `vertices` so every vertex appears after all of its declared
/// inputs (spec.md 4.2 step 10, Kahn's algorithm). Returns an error if the
/// inputs describe a cycle.
pub fn topologically_sorted(vertices: Vec<JobVertex>) -> Result<Vec<JobVertex>> {
    let by_id: HashMap<JobVertexId, JobVertex> =
        vertices.into_iter().map(|v| (v.id.clone(), v.clone())).collect();
    let mut in_degree: HashMap<JobVertexId, usize> =
        by_id.keys().map(|id| (id.clone(), 0)).collect();
    for v in by_id.values() {
        for input in &v.inputs {
            if by_id.contains_key(input) {
                *in_degree.get_mut(&v.id).unwrap() += 1;
            }
        }
    }

    let mut ready: Vec<JobVertexId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();
    ready.sort();

    let mut ordered = Vec::with_capacity(by_id.len());
    while let Some(id) = ready.pop() {
        let vertex = by_id.get(&id).unwrap().clone();
        for candidate in by_id.values() {
            if candidate.inputs.contains(&id) {
                let degree = in_degree.get_mut(&candidate.id).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(candidate.id.clone());
                }
            }
        }
        ordered.push(vertex);
        ready.sort();
    }

    if ordered.len() != by_id.len() {
        return Err(JobManagerError::JobSubmission(
            "job graph contains a cycle".to_string(),
        ));
    }
    Ok(ordered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Finished,
    Canceling,
    Canceled,
    Failed,
}

/// One attempt at running a single subtask of a vertex.
#[derive(Debug, Clone)]
pub struct Execution {
    pub attempt_id: AttemptId,
    pub attempt_number: u32,
    pub state: ExecutionState,
    pub assigned_instance: Option<InstanceId>,
    pub state_changed_at_millis: u64,
    pub failure_cause: Option<String>,
}

impl Execution {
    fn new(attempt_number: u32) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            attempt_number,
            state: ExecutionState::Created,
            assigned_instance: None,
            state_changed_at_millis: timestamp_millis(),
            failure_cause: None,
        }
    }

    fn transition(&mut self, state: ExecutionState) {
        self.state = state;
        self.state_changed_at_millis = timestamp_millis();
    }
}

/// One subtask of a vertex (parallelism index `subtask_index`), holding
/// the history of execution attempts made for it.
#[derive(Debug, Clone)]
pub struct ExecutionVertex {
    pub job_vertex_id: JobVertexId,
    pub subtask_index: u32,
    pub max_retries: u32,
    executions: Vec<Execution>,
    next_split_index: usize,
}

impl ExecutionVertex {
    fn new(job_vertex_id: JobVertexId, subtask_index: u32, max_retries: u32) -> Self {
        Self {
            job_vertex_id,
            subtask_index,
            max_retries,
            executions: vec![Execution::new(0)],
            next_split_index: 0,
        }
    }

    pub fn current_execution(&self) -> &Execution {
        self.executions.last().expect("always at least one attempt")
    }

    fn current_execution_mut(&mut self) -> &mut Execution {
        self.executions.last_mut().expect("always at least one attempt")
    }

    pub fn attempts(&self) -> &[Execution] {
        &self.executions
    }

    fn find_attempt(&self, attempt_id: AttemptId) -> Option<&Execution> {
        self.executions.iter().find(|e| e.attempt_id == attempt_id)
    }

    fn can_retry(&self) -> bool {
        self.current_execution().attempt_number < self.max_retries
    }

    fn spawn_retry(&mut self) -> &Execution {
        let attempt_number = self.current_execution().attempt_number + 1;
        self.executions.push(Execution::new(attempt_number));
        self.current_execution()
    }
}

/// Global, monotonic job state - independent of the state of any single
/// execution vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    Finished,
    Restarting,
    Suspended,
}

impl JobState {
    pub fn is_globally_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Canceled | JobState::Finished
        )
    }
}

/// An input split handed out to a source vertex's executions on demand
/// (spec.md 4, "Input Split Handout"). Opaque to the coordinator, which
/// only tracks which ones have been dealt out.
#[derive(Debug, Clone)]
pub struct InputSplit {
    pub payload: Vec<u8>,
}

pub struct ExecutionGraph {
    pub job_id: JobId,
    pub job_name: String,
    pub state: JobState,
    vertices: HashMap<JobVertexId, Vec<ExecutionVertex>>,
    vertex_order: Vec<JobVertexId>,
    splits: HashMap<JobVertexId, Vec<InputSplit>>,
    accumulators: HashMap<String, Vec<u8>>,
    pub checkpoint_coordinator: CheckpointCoordinator,
    pub checkpoint_settings: CheckpointSettings,
    pub created_at_millis: u64,
    /// Best-effort rendering of the materialized plan, handed to workers
    /// alongside each deploy-task dispatch. Defaults to `"{}"` - producing
    /// it is never allowed to fail job submission.
    pub json_plan: String,
    /// Shuffle partitions a consumer has registered interest in via
    /// `ScheduleOrUpdateConsumers`, keyed by partition id.
    partitions_with_consumers: std::collections::HashSet<String>,
    /// Each vertex's declared upstream inputs, kept around after
    /// materialization purely so the scheduler can bias placement toward
    /// a subtask's producers (spec.md 4.6).
    vertex_inputs: HashMap<JobVertexId, Vec<JobVertexId>>,
}

impl ExecutionGraph {
    pub fn new(
        job_id: JobId,
        job_name: String,
        job_vertices: Vec<JobVertex>,
        splits: Vec<(JobVertexId, Vec<InputSplit>)>,
        max_retries: u32,
        checkpoint_settings: CheckpointSettings,
        json_plan: String,
    ) -> Self {
        let mut vertices = HashMap::new();
        let mut vertex_order = Vec::with_capacity(job_vertices.len());
        let mut vertex_inputs = HashMap::with_capacity(job_vertices.len());

        for jv in &job_vertices {
            let subtasks = (0..jv.parallelism)
                .map(|i| ExecutionVertex::new(jv.id.clone(), i, max_retries))
                .collect();
            vertices.insert(jv.id.clone(), subtasks);
            vertex_order.push(jv.id.clone());
            vertex_inputs.insert(jv.id.clone(), jv.inputs.clone());
        }

        Self {
            job_id,
            job_name,
            state: JobState::Created,
            vertices,
            vertex_order,
            splits: splits.into_iter().collect(),
            accumulators: HashMap::new(),
            checkpoint_coordinator: CheckpointCoordinator::new(job_id),
            checkpoint_settings,
            created_at_millis: timestamp_millis(),
            json_plan,
            partitions_with_consumers: std::collections::HashSet::new(),
            vertex_inputs,
        }
    }

    pub fn inputs_of(&self, vertex_id: &str) -> &[JobVertexId] {
        self.vertex_inputs.get(vertex_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Executions participating in a checkpoint phase, with the instance
    /// currently hosting each one. An empty `vertices` list falls back to
    /// "every vertex currently running" so job graphs that don't name
    /// anything explicitly still checkpoint all of it.
    fn phase_targets(
        &self,
        vertices: &[JobVertexId],
    ) -> Vec<(JobVertexId, u32, AttemptId, InstanceId)> {
        let mut targets = Vec::new();
        for vertex_id in &self.vertex_order {
            if !vertices.is_empty() && !vertices.contains(vertex_id) {
                continue;
            }
            if let Some(subtasks) = self.vertices.get(vertex_id) {
                for subtask in subtasks {
                    let exec = subtask.current_execution();
                    if exec.state == ExecutionState::Running {
                        if let Some(instance) = &exec.assigned_instance {
                            targets.push((
                                vertex_id.clone(),
                                subtask.subtask_index,
                                exec.attempt_id,
                                instance.clone(),
                            ));
                        }
                    }
                }
            }
        }
        targets
    }

    pub fn trigger_targets(&self) -> Vec<(JobVertexId, u32, AttemptId, InstanceId)> {
        self.phase_targets(&self.checkpoint_settings.trigger_vertices)
    }

    pub fn ack_targets(&self) -> Vec<(JobVertexId, u32, AttemptId, InstanceId)> {
        self.phase_targets(&self.checkpoint_settings.ack_vertices)
    }

    pub fn confirm_targets(&self) -> Vec<(JobVertexId, u32, AttemptId, InstanceId)> {
        self.phase_targets(&self.checkpoint_settings.confirm_vertices)
    }

    /// Forward a consumer's interest in a shuffle partition to the graph
    /// (spec.md 4.1, `ScheduleOrUpdateConsumers`).
    pub fn register_consumer(&mut self, partition_id: String) {
        self.partitions_with_consumers.insert(partition_id);
    }

    pub fn has_consumer(&self, partition_id: &str) -> bool {
        self.partitions_with_consumers.contains(partition_id)
    }

    /// Look up a producer execution's current state from a partition id of
    /// the form `vertex_id:subtask_index` (spec.md 4.1,
    /// `RequestPartitionState`). Returns `None` for anything unrecognized;
    /// this is never an error.
    pub fn producer_state(&self, partition_id: &str) -> Option<String> {
        let (vertex_id, index) = partition_id.rsplit_once(':')?;
        let subtask_index: u32 = index.parse().ok()?;
        let subtasks = self.vertices.get(vertex_id)?;
        let subtask = subtasks.get(subtask_index as usize)?;
        Some(format!("{:?}", subtask.current_execution().state))
    }

    /// Instances currently hosting a running or scheduled execution of any
    /// of `vertex_id`'s upstream producers, used to bias scheduling toward
    /// co-location (spec.md 4.6).
    pub fn preferred_instances_for(&self, inputs: &[JobVertexId]) -> Vec<InstanceId> {
        let mut preferred = Vec::new();
        for input in inputs {
            if let Some(subtasks) = self.vertices.get(input) {
                for subtask in subtasks {
                    if let Some(instance) = &subtask.current_execution().assigned_instance {
                        if !preferred.contains(instance) {
                            preferred.push(instance.clone());
                        }
                    }
                }
            }
        }
        preferred
    }

    pub fn vertex_ids(&self) -> &[JobVertexId] {
        &self.vertex_order
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_order.is_empty()
    }

    pub fn total_subtasks(&self) -> usize {
        self.vertices.values().map(|v| v.len()).sum()
    }

    pub fn subtasks(&self, vertex_id: &str) -> Option<&[ExecutionVertex]> {
        self.vertices.get(vertex_id).map(|v| v.as_slice())
    }

    /// All subtasks across all vertices still waiting to be scheduled.
    pub fn pending_subtasks(&self) -> Vec<(JobVertexId, u32)> {
        let mut pending = Vec::new();
        for vertex_id in &self.vertex_order {
            if let Some(subtasks) = self.vertices.get(vertex_id) {
                for subtask in subtasks {
                    if subtask.current_execution().state == ExecutionState::Created {
                        pending.push((vertex_id.clone(), subtask.subtask_index));
                    }
                }
            }
        }
        pending
    }

    pub fn mark_scheduled(
        &mut self,
        vertex_id: &str,
        subtask_index: u32,
        instance: InstanceId,
    ) -> Result<()> {
        let subtask = self.subtask_mut(vertex_id, subtask_index)?;
        let exec = subtask.current_execution_mut();
        exec.assigned_instance = Some(instance);
        exec.transition(ExecutionState::Scheduled);
        Ok(())
    }

    /// Apply a reported state transition for one execution attempt
    /// (spec.md 4.1, `UpdateTaskExecutionState`). Returns `true` if this
    /// vertex's terminal state newly makes the whole job terminal-eligible
    /// so the caller can re-check overall job state.
    pub fn update_execution_state(
        &mut self,
        vertex_id: &str,
        subtask_index: u32,
        attempt_id: AttemptId,
        new_state: ExecutionState,
        failure_cause: Option<String>,
    ) -> Result<bool> {
        let subtask = self.subtask_mut(vertex_id, subtask_index)?;

        if subtask.current_execution().attempt_id != attempt_id {
            debug!(
                "Ignoring stale state update for {vertex_id}[{subtask_index}] attempt {attempt_id}"
            );
            return Ok(false);
        }

        let exec = subtask.current_execution_mut();
        exec.transition(new_state);
        exec.failure_cause = failure_cause;

        Ok(matches!(
            new_state,
            ExecutionState::Finished | ExecutionState::Failed | ExecutionState::Canceled
        ))
    }

    /// Retry the current attempt of one subtask if it has retries left.
    /// Returns `Err` if retries are exhausted, in which case the caller
    /// should fail the whole job (spec.md 4.1 Job Termination).
    pub fn retry_subtask(&mut self, vertex_id: &str, subtask_index: u32) -> Result<AttemptId> {
        let subtask = self.subtask_mut(vertex_id, subtask_index)?;
        if !subtask.can_retry() {
            return Err(JobManagerError::JobExecution(format!(
                "{vertex_id}[{subtask_index}] exhausted its retry budget"
            )));
        }
        let retry = subtask.spawn_retry();
        info!(
            "Retrying {vertex_id}[{subtask_index}] as attempt {}",
            retry.attempt_number
        );
        Ok(retry.attempt_id)
    }

    pub fn next_input_split(
        &mut self,
        vertex_id: &str,
        _attempt_id: AttemptId,
    ) -> Option<InputSplit> {
        let subtasks = self.vertices.get_mut(vertex_id)?;
        // Input splits are handed out per-vertex round robin, not pinned
        // to a subtask - any idle source instance can claim the next one.
        let next_index = subtasks.first()?.next_split_index;
        let splits = self.splits.get(vertex_id)?;
        let split = splits.get(next_index)?.clone();
        for subtask in subtasks.iter_mut() {
            subtask.next_split_index = next_index + 1;
        }
        Some(split)
    }

    pub fn merge_accumulators(&mut self, entries: impl IntoIterator<Item = (String, Vec<u8>)>) {
        for (name, value) in entries {
            self.accumulators.insert(name, value);
        }
    }

    pub fn accumulators(&self) -> &HashMap<String, Vec<u8>> {
        &self.accumulators
    }

    /// True once every subtask of every vertex has finished successfully.
    pub fn all_finished(&self) -> bool {
        !self.is_empty()
            && self.vertices.values().all(|subtasks| {
                subtasks
                    .iter()
                    .all(|s| s.current_execution().state == ExecutionState::Finished)
            })
    }

    pub fn any_failed(&self) -> bool {
        self.vertices.values().any(|subtasks| {
            subtasks
                .iter()
                .any(|s| s.current_execution().state == ExecutionState::Failed)
        })
    }

    pub fn instances_in_use(&self) -> Vec<InstanceId> {
        let mut instances = Vec::new();
        for subtasks in self.vertices.values() {
            for subtask in subtasks {
                if let Some(instance) = &subtask.current_execution().assigned_instance {
                    instances.push(instance.clone());
                }
            }
        }
        instances
    }

    /// Find every execution attempt hosted on `instance`, used when a
    /// worker is declared dead and its in-flight tasks need to be failed.
    pub fn executions_on(&self, instance: &str) -> Vec<(JobVertexId, u32, AttemptId)> {
        let mut found = Vec::new();
        for (vertex_id, subtasks) in &self.vertices {
            for subtask in subtasks {
                let exec = subtask.current_execution();
                if exec.assigned_instance.as_deref() == Some(instance) {
                    found.push((vertex_id.clone(), subtask.subtask_index, exec.attempt_id));
                }
            }
        }
        found
    }

    pub fn transition_job_state(&mut self, new_state: JobState) {
        if self.state.is_globally_terminal() {
            warn!(
                "Ignoring job state transition {:?} -> {:?} on job {}: already terminal",
                self.state, new_state, self.job_id
            );
            return;
        }
        info!(
            "Job {} transitioning from {:?} to {:?}",
            self.job_id, self.state, new_state
        );
        self.state = new_state;
    }

    fn subtask_mut(
        &mut self,
        vertex_id: &str,
        subtask_index: u32,
    ) -> Result<&mut ExecutionVertex> {
        self.vertices
            .get_mut(vertex_id)
            .and_then(|subtasks| subtasks.get_mut(subtask_index as usize))
            .ok_or_else(|| {
                JobManagerError::JobExecution(format!(
                    "no such execution vertex {vertex_id}[{subtask_index}]"
                ))
            })
    }

    pub fn find_execution(
        &self,
        vertex_id: &str,
        subtask_index: u32,
        attempt_id: AttemptId,
    ) -> Option<&Execution> {
        self.vertices
            .get(vertex_id)
            .and_then(|subtasks| subtasks.get(subtask_index as usize))
            .and_then(|s| s.find_attempt(attempt_id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn two_vertex_graph() -> ExecutionGraph {
        let vertices = vec![
            JobVertex {
                id: "source".into(),
                name: "source".into(),
                parallelism: 2,
                inputs: vec![],
                invokable_class_name: "test.Source".into(),
                master_init_hook: None,
            },
            JobVertex {
                id: "sink".into(),
                name: "sink".into(),
                parallelism: 1,
                inputs: vec!["source".into()],
                invokable_class_name: "test.Sink".into(),
                master_init_hook: None,
            },
        ];
        ExecutionGraph::new(
            JobId::new(),
            "job".into(),
            vertices,
            Vec::new(),
            jm_core::config::DEFAULT_EXECUTION_RETRIES,
            CheckpointSettings::default(),
            "{}".into(),
        )
    }

    #[test]
    fn starts_with_all_subtasks_pending() {
        let graph = two_vertex_graph();
        assert_eq!(graph.total_subtasks(), 3);
        assert_eq!(graph.pending_subtasks().len(), 3);
    }

    #[test]
    fn all_finished_requires_every_subtask_finished() {
        let mut graph = two_vertex_graph();
        assert!(!graph.all_finished());

        for (vertex_id, idx) in graph.pending_subtasks() {
            let attempt = graph.subtask_mut(&vertex_id, idx).unwrap().current_execution().attempt_id;
            graph
                .update_execution_state(
                    &vertex_id,
                    idx,
                    attempt,
                    ExecutionState::Finished,
                    None,
                )
                .unwrap();
        }

        assert!(graph.all_finished());
    }

    #[test]
    fn stale_attempt_update_is_ignored() {
        let mut graph = two_vertex_graph();
        let stale_attempt = AttemptId::new();
        let changed = graph
            .update_execution_state("source", 0, stale_attempt, ExecutionState::Finished, None)
            .unwrap();
        assert!(!changed);
        assert_eq!(
            graph.subtasks("source").unwrap()[0].current_execution().state,
            ExecutionState::Created
        );
    }

    #[test]
    fn retry_exhaustion_errors() {
        let mut graph = two_vertex_graph();
        for _ in 0..jm_core::config::DEFAULT_EXECUTION_RETRIES {
            graph.retry_subtask("source", 0).unwrap();
        }
        assert!(graph.retry_subtask("source", 0).is_err());
    }

    #[test]
    fn empty_job_graph_has_no_pending_subtasks() {
        let graph = ExecutionGraph::new(
            JobId::new(),
            "empty".into(),
            Vec::new(),
            Vec::new(),
            jm_core::config::DEFAULT_EXECUTION_RETRIES,
            CheckpointSettings::default(),
            "{}".into(),
        );
        assert!(graph.is_empty());
        assert!(graph.pending_subtasks().is_empty());
    }
}
