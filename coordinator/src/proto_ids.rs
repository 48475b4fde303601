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

//! Conversions between this crate's typed 128-bit ids and the two-u64-half
//! `proto::Uuid` wire representation, shared by both gRPC services.

use crate::proto;

pub fn decode_uuid(u: &proto::Uuid) -> u128 {
    ((u.high as u128) << 64) | (u.low as u128)
}

pub fn encode_uuid(value: u128) -> proto::Uuid {
    proto::Uuid {
        high: (value >> 64) as u64,
        low: value as u64,
    }
}
