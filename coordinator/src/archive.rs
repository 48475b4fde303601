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

//! Bounded in-memory record of finished jobs. Once a job leaves the
//! coordinator's live execution graph map it is moved here so that status
//! queries and clients still listening for a result can find it; the
//! oldest entry is evicted once the archive is full.

use std::collections::{HashMap, VecDeque};

use jm_core::ids::JobId;
use log::debug;

use crate::execution_graph::ExecutionGraph;

pub struct ArchivedJob {
    pub job_id: JobId,
    pub graph: ExecutionGraph,
    pub archived_at_millis: u64,
}

/// Fixed-capacity FIFO archive keyed by job id. Not persisted: a
/// coordinator restart starts with an empty archive, matching the
/// in-memory nature of the rest of the coordinator's job state.
pub struct Archive {
    capacity: usize,
    order: VecDeque<JobId>,
    jobs: HashMap<JobId, ArchivedJob>,
}

impl Archive {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            jobs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, graph: ExecutionGraph) {
        let job_id = graph.job_id;

        if self.jobs.contains_key(&job_id) {
            return;
        }

        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.jobs.remove(&evicted);
                debug!("Evicted job {evicted} from archive to make room");
            }
        }

        self.order.push_back(job_id);
        self.jobs.insert(
            job_id,
            ArchivedJob {
                job_id,
                graph,
                archived_at_millis: jm_core::time::timestamp_millis(),
            },
        );
    }

    pub fn get(&self, job_id: &JobId) -> Option<&ArchivedJob> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::execution_graph::ExecutionGraph;

    fn graph(job_id: JobId) -> ExecutionGraph {
        ExecutionGraph::new(
            job_id,
            "test-job".to_string(),
            Vec::new(),
            Vec::new(),
            jm_core::config::DEFAULT_EXECUTION_RETRIES,
            crate::execution_graph::CheckpointSettings::default(),
            "{}".into(),
        )
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut archive = Archive::new(2);

        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();

        archive.insert(graph(a));
        archive.insert(graph(b));
        assert_eq!(archive.len(), 2);

        archive.insert(graph(c));
        assert_eq!(archive.len(), 2);
        assert!(archive.get(&a).is_none());
        assert!(archive.get(&b).is_some());
        assert!(archive.get(&c).is_some());
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut archive = Archive::new(4);
        let a = JobId::new();
        archive.insert(graph(a));
        archive.insert(graph(a));
        assert_eq!(archive.len(), 1);
    }
}
