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

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod execution_graph;
pub mod grpc_client;
pub mod grpc_worker;
pub mod instance_manager;
pub mod job_info;
pub mod library_cache;
pub mod messages;
pub mod metrics;
pub mod proto_ids;
pub mod scheduler;
pub mod worker_channel;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod proto {
    tonic::include_proto!("jobmanager");
}
