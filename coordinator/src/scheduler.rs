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

//! Matches pending execution vertices to free instance slots. Reservation
//! itself (which slots are free) lives in `instance_manager`; this module
//! only decides how to spread `n` requested slots across the known free
//! ones.

use std::collections::HashMap;

use jm_core::ids::InstanceId;

use crate::instance_manager::InstanceReservation;

/// How to spread newly reserved slots across instances.
#[derive(Debug, Clone, Copy)]
pub enum TaskDistribution {
    /// Fill one instance's slots before moving to the next. Minimizes the
    /// number of instances touched per job, which helps data locality.
    Bias,
    /// Take at most one slot per instance per pass, spreading load evenly.
    RoundRobin,
}

/// Reserve up to `n` slots from the given per-instance free-slot counts,
/// mutating them in place. Returns however many reservations could
/// actually be made; never more than `n`, possibly fewer if the cluster
/// doesn't have that many free slots.
pub fn reserve_slots(
    free_slots: &mut [(InstanceId, u32)],
    n: u32,
    distribution: TaskDistribution,
) -> Vec<InstanceReservation> {
    match distribution {
        TaskDistribution::Bias => reserve_slots_bias(free_slots, n),
        TaskDistribution::RoundRobin => reserve_slots_round_robin(free_slots, n),
    }
}

fn reserve_slots_bias(
    free_slots: &mut [(InstanceId, u32)],
    mut n: u32,
) -> Vec<InstanceReservation> {
    let mut reservations = Vec::with_capacity(n as usize);

    for (instance_id, available) in free_slots.iter_mut() {
        if n == 0 {
            break;
        }
        let take = (*available).min(n);
        for _ in 0..take {
            reservations.push(InstanceReservation::new_free(instance_id.clone()));
        }
        *available -= take;
        n -= take;
    }

    reservations
}

/// Reserve a single slot for one pending subtask, preferring locality in
/// three tiers (spec.md 4.6): an instance already hosting one of the
/// subtask's producers, then any instance on the same host as a producer,
/// then falling back to `distribution`'s ordinary placement across
/// whatever remains. Returns `None` only when every known instance is out
/// of free slots.
pub fn reserve_slots_with_preference(
    free_slots: &mut [(InstanceId, u32)],
    hosts: &HashMap<InstanceId, String>,
    preferred: &[InstanceId],
    distribution: TaskDistribution,
) -> Option<InstanceReservation> {
    for instance_id in preferred {
        if let Some((_, available)) = free_slots.iter_mut().find(|(id, _)| id == instance_id) {
            if *available > 0 {
                *available -= 1;
                return Some(InstanceReservation::new_free(instance_id.clone()));
            }
        }
    }

    let preferred_hosts: Vec<&str> = preferred
        .iter()
        .filter_map(|id| hosts.get(id).map(String::as_str))
        .collect();
    if !preferred_hosts.is_empty() {
        if let Some((instance_id, available)) = free_slots.iter_mut().find(|(id, available)| {
            *available > 0
                && hosts
                    .get(id)
                    .map(|h| preferred_hosts.contains(&h.as_str()))
                    .unwrap_or(false)
        }) {
            *available -= 1;
            return Some(InstanceReservation::new_free(instance_id.clone()));
        }
    }

    let mut reservations = reserve_slots(free_slots, 1, distribution);
    reservations.pop()
}

fn reserve_slots_round_robin(
    free_slots: &mut [(InstanceId, u32)],
    mut n: u32,
) -> Vec<InstanceReservation> {
    let mut reservations = Vec::with_capacity(n as usize);

    while n > 0 {
        let mut made_progress = false;
        for (instance_id, available) in free_slots.iter_mut() {
            if n == 0 {
                break;
            }
            if *available > 0 {
                reservations.push(InstanceReservation::new_free(instance_id.clone()));
                *available -= 1;
                n -= 1;
                made_progress = true;
            }
        }
        if !made_progress {
            break;
        }
    }

    reservations
}

#[cfg(test)]
mod test {
    use super::*;

    fn slots() -> Vec<(InstanceId, u32)> {
        vec![
            ("w1".to_string(), 4),
            ("w2".to_string(), 4),
            ("w3".to_string(), 4),
        ]
    }

    #[test]
    fn bias_fills_one_instance_first() {
        let mut free = slots();
        let reservations = reserve_slots(&mut free, 5, TaskDistribution::Bias);
        assert_eq!(reservations.len(), 5);
        assert_eq!(
            reservations.iter().filter(|r| r.instance_id == "w1").count(),
            4
        );
        assert_eq!(
            reservations.iter().filter(|r| r.instance_id == "w2").count(),
            1
        );
    }

    #[test]
    fn round_robin_spreads_across_instances() {
        let mut free = slots();
        let reservations = reserve_slots(&mut free, 3, TaskDistribution::RoundRobin);
        assert_eq!(reservations.len(), 3);
        assert_eq!(
            reservations.iter().filter(|r| r.instance_id == "w1").count(),
            1
        );
        assert_eq!(
            reservations.iter().filter(|r| r.instance_id == "w2").count(),
            1
        );
        assert_eq!(
            reservations.iter().filter(|r| r.instance_id == "w3").count(),
            1
        );
    }

    #[test]
    fn reserving_more_than_available_returns_partial() {
        let mut free = vec![("w1".to_string(), 2)];
        let reservations = reserve_slots(&mut free, 10, TaskDistribution::Bias);
        assert_eq!(reservations.len(), 2);
    }

    #[test]
    fn preference_picks_the_exact_preferred_instance_first() {
        let mut free = slots();
        let hosts = HashMap::new();
        let reservation = reserve_slots_with_preference(
            &mut free,
            &hosts,
            &["w2".to_string()],
            TaskDistribution::Bias,
        )
        .unwrap();
        assert_eq!(reservation.instance_id, "w2");
        assert_eq!(free[1].1, 3);
    }

    #[test]
    fn preference_falls_back_to_same_host_when_preferred_instance_is_full() {
        let mut free = vec![("w1".to_string(), 0), ("w2".to_string(), 4)];
        let mut hosts = HashMap::new();
        hosts.insert("w1".to_string(), "host-a".to_string());
        hosts.insert("w2".to_string(), "host-a".to_string());
        let reservation = reserve_slots_with_preference(
            &mut free,
            &hosts,
            &["w1".to_string()],
            TaskDistribution::Bias,
        )
        .unwrap();
        assert_eq!(reservation.instance_id, "w2");
    }

    #[test]
    fn preference_falls_back_to_ordinary_placement_with_no_locality_match() {
        let mut free = slots();
        let hosts = HashMap::new();
        let reservation =
            reserve_slots_with_preference(&mut free, &hosts, &[], TaskDistribution::Bias).unwrap();
        assert_eq!(reservation.instance_id, "w1");
    }
}
