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

//! Coordinator-specific configuration, builder style to match the way
//! the rest of the stack assembles its config structs.

use jm_core::config;

use crate::scheduler::TaskDistribution;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bind address for the worker/client gRPC services.
    pub bind_host: String,
    pub bind_port: u16,
    /// Whether leader election is enabled. When `false` the coordinator
    /// runs as a standalone, always-leader instance.
    pub ha_enabled: bool,
    pub etcd_endpoints: Vec<String>,
    pub event_loop_buffer_size: usize,
    pub task_distribution: TaskDistribution,
    pub execution_retries: u32,
    pub worker_heartbeat_timeout_secs: u64,
    pub library_cache_cleanup_interval_secs: u64,
    pub archive_capacity: usize,
    pub metrics_bind_port: Option<u16>,
    /// How long a finished job's `JobInfo` is kept around waiting for a
    /// client to resume listening before it is expired (spec.md 9).
    pub session_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 50050,
            ha_enabled: false,
            etcd_endpoints: Vec::new(),
            event_loop_buffer_size: 10_000,
            task_distribution: TaskDistribution::Bias,
            execution_retries: config::DEFAULT_EXECUTION_RETRIES,
            worker_heartbeat_timeout_secs: config::DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS,
            library_cache_cleanup_interval_secs:
                config::DEFAULT_LIBRARY_CACHE_CLEANUP_INTERVAL_SECS,
            archive_capacity: config::DEFAULT_ARCHIVE_CAPACITY,
            metrics_bind_port: Some(9090),
            session_timeout_secs: config::DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_bind(mut self, host: String, port: u16) -> Self {
        self.bind_host = host;
        self.bind_port = port;
        self
    }

    pub fn with_ha_enabled(mut self, ha_enabled: bool) -> Self {
        self.ha_enabled = ha_enabled;
        self.bind_port = config::enforce_ha_bind_port(ha_enabled, self.bind_port);
        self
    }

    pub fn with_etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = endpoints;
        self
    }

    pub fn with_event_loop_buffer_size(mut self, buffer_size: usize) -> Self {
        self.event_loop_buffer_size = buffer_size;
        self
    }

    pub fn with_task_distribution(mut self, distribution: TaskDistribution) -> Self {
        self.task_distribution = distribution;
        self
    }

    pub fn with_execution_retries(mut self, retries: u32) -> Self {
        self.execution_retries = retries;
        self
    }

    pub fn with_metrics_bind_port(mut self, port: Option<u16>) -> Self {
        self.metrics_bind_port = port;
        self
    }

    pub fn with_session_timeout_secs(mut self, secs: u64) -> Self {
        self.session_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enabling_ha_forces_ephemeral_port() {
        let config = CoordinatorConfig::default()
            .with_bind("0.0.0.0".to_string(), 50050)
            .with_ha_enabled(true);
        assert_eq!(config.bind_port, 0);
    }
}
