/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::IpAddr;
use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use serde::Serialize;

use crate::analyzer::protocol_logs::SessionRecord;

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub workload_name: String,
    pub workload_kind: String,
    pub namespace: String,
    pub container_id: String,
    pub service_name: String,
}

/// One immutable view of the Kubernetes metadata. The watcher builds a
/// fresh snapshot and swaps it in whole; workers read the current pointer
/// without locks.
#[derive(Default)]
pub struct WorkloadSnapshot {
    // a service endpoint (cluster ip + port) wins over the pod ip
    by_endpoint: AHashMap<(IpAddr, u16), Arc<Workload>>,
    by_ip: AHashMap<IpAddr, Arc<Workload>>,
    by_pid: AHashMap<u32, Arc<Workload>>,
}

impl WorkloadSnapshot {
    pub fn insert_endpoint(&mut self, ip: IpAddr, port: u16, workload: Arc<Workload>) {
        self.by_endpoint.insert((ip, port), workload);
    }

    pub fn insert_ip(&mut self, ip: IpAddr, workload: Arc<Workload>) {
        self.by_ip.insert(ip, workload);
    }

    pub fn insert_pid(&mut self, pid: u32, workload: Arc<Workload>) {
        self.by_pid.insert(pid, workload);
    }
}

pub struct WorkloadTable {
    snapshot: ArcSwap<WorkloadSnapshot>,
}

impl Default for WorkloadTable {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(WorkloadSnapshot::default()),
        }
    }
}

impl WorkloadTable {
    // watcher side, swaps the whole snapshot atomically
    pub fn replace(&self, snapshot: WorkloadSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn lookup(&self, ip: IpAddr, port: u16, pid: u32) -> Option<Arc<Workload>> {
        let snapshot = self.snapshot.load();
        if let Some(w) = snapshot.by_endpoint.get(&(ip, port)) {
            return Some(w.clone());
        }
        if let Some(w) = snapshot.by_ip.get(&ip) {
            return Some(w.clone());
        }
        snapshot.by_pid.get(&pid).cloned()
    }

    /// Attach workload identity to both sides of a matched record.
    pub fn enrich(&self, record: &mut SessionRecord) {
        if record.client_workload.is_none() {
            record.client_workload =
                self.lookup(record.key.client_ip, record.key.client_port, record.key.pid);
        }
        if record.server_workload.is_none() {
            record.server_workload =
                self.lookup(record.key.server_ip, record.key.server_port, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn lookup_prefers_endpoint_over_ip() {
        let table = WorkloadTable::default();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1));
        let mut snapshot = WorkloadSnapshot::default();
        snapshot.insert_ip(
            ip,
            Arc::new(Workload {
                workload_name: "pod".to_owned(),
                ..Default::default()
            }),
        );
        snapshot.insert_endpoint(
            ip,
            80,
            Arc::new(Workload {
                service_name: "frontend".to_owned(),
                ..Default::default()
            }),
        );
        table.replace(snapshot);

        assert_eq!(table.lookup(ip, 80, 0).unwrap().service_name, "frontend");
        assert_eq!(table.lookup(ip, 81, 0).unwrap().workload_name, "pod");
        assert!(table.lookup(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2)), 80, 0).is_none());
    }

    #[test]
    fn snapshot_swap_is_visible() {
        let table = WorkloadTable::default();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 3));
        assert!(table.lookup(ip, 0, 0).is_none());

        let mut snapshot = WorkloadSnapshot::default();
        snapshot.insert_ip(ip, Arc::new(Workload::default()));
        table.replace(snapshot);
        assert!(table.lookup(ip, 0, 0).is_some());

        table.replace(WorkloadSnapshot::default());
        assert!(table.lookup(ip, 0, 0).is_none());
    }
}
