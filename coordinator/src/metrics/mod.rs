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

#[cfg(feature = "prometheus-metrics")]
pub mod prometheus;

/// Observability hook for job lifecycle events. Kept separate from the
/// coordinator's actual state so a metrics backend can be swapped (or
/// disabled entirely) without touching scheduling logic.
pub trait CoordinatorMetricsCollector: Send + Sync {
    fn record_submitted(&self, job_id: &str, submitted_at_millis: u64);
    fn record_completed(&self, job_id: &str, submitted_at_millis: u64, completed_at_millis: u64);
    fn record_failed(&self, job_id: &str);
    fn record_cancelled(&self, job_id: &str);
    fn set_pending_subtask_queue_size(&self, value: u64);
}

/// Collector used when metrics export is compiled out or disabled at
/// runtime.
pub struct NoopMetricsCollector;

impl CoordinatorMetricsCollector for NoopMetricsCollector {
    fn record_submitted(&self, _job_id: &str, _submitted_at_millis: u64) {}
    fn record_completed(&self, _job_id: &str, _submitted_at_millis: u64, _completed_at_millis: u64) {}
    fn record_failed(&self, _job_id: &str) {}
    fn record_cancelled(&self, _job_id: &str) {}
    fn set_pending_subtask_queue_size(&self, _value: u64) {}
}
