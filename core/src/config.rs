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

//! Configuration keys shared between the coordinator and anything that
//! embeds it (spec.md 6, "Configuration keys consumed"). Values
//! themselves live in `coordinator::config::CoordinatorConfig`; this
//! module is just the canonical key names plus the defaults, so both
//! crates agree on them without a circular dependency.

/// When high availability is enabled the IPC bind port MUST be ephemeral
/// (spec.md 6). Returns the corrected port plus whether it was adjusted.
pub fn enforce_ha_bind_port(ha_enabled: bool, configured_port: u16) -> u16 {
    if ha_enabled {
        0
    } else {
        configured_port
    }
}

pub const DEFAULT_EXECUTION_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_LIBRARY_CACHE_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1000;
pub const DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ha_forces_ephemeral_port() {
        assert_eq!(enforce_ha_bind_port(true, 50050), 0);
        assert_eq!(enforce_ha_bind_port(false, 50050), 50050);
    }
}
