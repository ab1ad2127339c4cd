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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use log::{info, warn};

use crate::analyzer::conn_table::ConnTable;
use crate::analyzer::protocol_logs::SessionRecord;
use crate::common::connection::lane_hash;
use crate::common::event::SocketEvent;
use crate::config::{AnalyzerConfig, Config};
use crate::platform::WorkloadTable;
use crate::utils::stats::{self, Countable, StatsOption};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::queue::{self, DropPolicy, Receiver, Sender};

const QUEUE_BATCH_SIZE: usize = 1024;
const RCV_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_RCV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct DispatcherCounter {
    pub events_in: AtomicU64,
    pub pairs_emitted: AtomicU64,
}

impl RefCountable for DispatcherCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "events_in",
                CounterType::Counted,
                CounterValue::Unsigned(self.events_in.swap(0, Ordering::Relaxed)),
            ),
            (
                "pairs_emitted",
                CounterType::Counted,
                CounterValue::Unsigned(self.pairs_emitted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Parallel worker lanes with per-connection affinity. Each lane owns one
/// connection tracker and a bounded input queue; events of one connection
/// always hash to the same lane so no per-connection locking exists
/// anywhere. Matched records from all lanes fan into one output queue.
pub struct Dispatcher {
    senders: Vec<Sender<SocketEvent>>,
    receivers: Mutex<Vec<Option<Receiver<SocketEvent>>>>,
    output_sender: Mutex<Option<Sender<SessionRecord>>>,

    config: Config,
    workload_table: Arc<WorkloadTable>,
    stats_collector: Arc<stats::Collector>,

    counter: Arc<DispatcherCounter>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        workload_table: Arc<WorkloadTable>,
        stats_collector: Arc<stats::Collector>,
    ) -> (Self, Receiver<SessionRecord>) {
        let workers = config.effective_workers();
        let policy: DropPolicy = config.drop_policy.into();

        let mut senders = vec![];
        let mut receivers = vec![];
        for i in 0..workers {
            let (s, r, handle) =
                queue::bounded_with_policy(config.input_queue_size, policy);
            stats_collector.register_countable(
                "event-queue",
                Countable::Owned(Box::new(handle)),
                vec![StatsOption::Tag("worker", i.to_string())],
            );
            senders.push(s);
            receivers.push(Some(r));
        }

        let (output_sender, output_receiver, handle) = queue::bounded(config.output_queue_size);
        stats_collector.register_countable(
            "record-queue",
            Countable::Owned(Box::new(handle)),
            vec![],
        );

        let counter: Arc<DispatcherCounter> = Default::default();
        stats_collector.register_countable(
            "dispatcher",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );

        (
            Self {
                senders,
                receivers: Mutex::new(receivers),
                output_sender: Mutex::new(Some(output_sender)),
                config,
                workload_table,
                stats_collector,
                counter,
                running: Arc::new(AtomicBool::new(false)),
                threads: Mutex::new(vec![]),
            },
            output_receiver,
        )
    }

    pub fn counter(&self) -> Arc<DispatcherCounter> {
        self.counter.clone()
    }

    /// Route one probe event to its lane. Both directions of a connection
    /// hash to the same lane, events on it are processed in arrival order.
    pub fn send(&self, event: SocketEvent) {
        self.counter.events_in.fetch_add(1, Ordering::Relaxed);
        let lane = (lane_hash(&event) % self.senders.len() as u64) as usize;
        if let Err(queue::Error::Terminated(..)) = self.senders[lane].send(event) {
            warn!("event queue of lane {} terminated", lane);
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }

        let mut receivers = self.receivers.lock().unwrap();
        let output_sender = self
            .output_sender
            .lock()
            .unwrap()
            .take()
            .expect("dispatcher can only start once");
        let mut threads = self.threads.lock().unwrap();
        for (id, slot) in receivers.iter_mut().enumerate() {
            let receiver = slot.take().expect("dispatcher can only start once");
            threads.push(self.spawn_worker(id, receiver, output_sender.clone()));
        }
        info!("dispatcher started with {} worker lanes", threads.len());
    }

    fn spawn_worker(
        &self,
        id: usize,
        receiver: Receiver<SocketEvent>,
        output: Sender<SessionRecord>,
    ) -> JoinHandle<()> {
        let running = self.running.clone();
        let counter = self.counter.clone();
        let workload_table = self.workload_table.clone();
        let analyzer_config = AnalyzerConfig::from(&self.config);
        let eviction_interval = Duration::from_secs(self.config.eviction_interval.max(1));
        let drain_timeout = Duration::from_secs(self.config.shutdown_drain_timeout);
        let stats_collector = self.stats_collector.clone();

        thread::Builder::new()
            .name(format!("protocol-analyzer-{}", id))
            .spawn(move || {
                let mut conn_table = ConnTable::new(analyzer_config);
                let table_counter = conn_table.counter();
                stats_collector.register_countable(
                    "conn-table",
                    Countable::Ref(Arc::downgrade(&table_counter) as Weak<dyn RefCountable>),
                    vec![StatsOption::Tag("worker", id.to_string())],
                );

                let mut batch: Vec<SocketEvent> = Vec::with_capacity(QUEUE_BATCH_SIZE);
                let mut last_sweep = Instant::now();
                while running.load(Ordering::Relaxed) {
                    match receiver.recv_all(&mut batch, Some(RCV_TIMEOUT)) {
                        Ok(_) => {
                            for event in batch.drain(..) {
                                let records = conn_table.handle_event(&event);
                                Self::emit(&counter, &workload_table, &output, records);
                            }
                        }
                        Err(queue::Error::Timeout) => {}
                        Err(queue::Error::Terminated(..)) => break,
                        Err(queue::Error::BatchTooLarge(_)) => unreachable!(),
                    }
                    if last_sweep.elapsed() >= eviction_interval {
                        last_sweep = Instant::now();
                        let records = conn_table.flush_timeouts(now_ns());
                        Self::emit(&counter, &workload_table, &output, records);
                    }
                }

                // bounded drain, then flush in-flight requests so shutdown
                // loses nothing silently
                let deadline = Instant::now() + drain_timeout;
                while Instant::now() < deadline {
                    match receiver.recv_all(&mut batch, Some(DRAIN_RCV_TIMEOUT)) {
                        Ok(_) => {
                            for event in batch.drain(..) {
                                let records = conn_table.handle_event(&event);
                                Self::emit(&counter, &workload_table, &output, records);
                            }
                        }
                        Err(_) => break,
                    }
                }
                let records = conn_table.drain();
                Self::emit(&counter, &workload_table, &output, records);
            })
            .unwrap()
    }

    fn emit(
        counter: &DispatcherCounter,
        workload_table: &WorkloadTable,
        output: &Sender<SessionRecord>,
        records: Vec<SessionRecord>,
    ) {
        for mut record in records {
            workload_table.enrich(&mut record);
            counter.pairs_emitted.fetch_add(1, Ordering::Relaxed);
            if let Err(queue::Error::Terminated(..)) = output.send(record) {
                warn!("record output queue terminated");
                return;
            }
        }
    }

    pub fn notify_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
        info!("dispatcher stopped");
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::analyzer::payload::AttrValue;
    use crate::common::enums::IpProtocol;
    use crate::common::event::{IoDirection, Syscall};
    use crate::platform::{Workload, WorkloadSnapshot};

    fn http_exchange() -> Vec<SocketEvent> {
        let base = SocketEvent {
            pid: 7,
            tid: 7,
            l4_protocol: IpProtocol::Tcp,
            ..Default::default()
        };
        let client = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 43210u16);
        let server = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80u16);
        vec![
            SocketEvent {
                timestamp_ns: 1_000,
                direction: IoDirection::Egress,
                syscall: Syscall::Write,
                src_ip: client.0,
                src_port: client.1,
                dst_ip: server.0,
                dst_port: server.1,
                payload: b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n".to_vec(),
                ..base.clone()
            },
            SocketEvent {
                timestamp_ns: 2_000,
                direction: IoDirection::Ingress,
                syscall: Syscall::Read,
                src_ip: server.0,
                src_port: server.1,
                dst_ip: client.0,
                dst_port: client.1,
                payload: b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
                ..base.clone()
            },
        ]
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.workers = 2;
        config
    }

    #[test]
    fn end_to_end_pair_with_enrichment() {
        let workload_table = Arc::new(WorkloadTable::default());
        let mut snapshot = WorkloadSnapshot::default();
        snapshot.insert_endpoint(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            Arc::new(Workload {
                workload_name: "web".to_owned(),
                workload_kind: "Deployment".to_owned(),
                namespace: "default".to_owned(),
                ..Default::default()
            }),
        );
        workload_table.replace(snapshot);

        let stats = Arc::new(stats::Collector::new(60));
        let (dispatcher, output) = Dispatcher::new(test_config(), workload_table, stats);
        dispatcher.start();

        for event in http_exchange() {
            dispatcher.send(event);
        }

        let record = output.recv(Some(Duration::from_secs(5))).unwrap();
        assert!(!record.is_error);
        assert_eq!(
            record.attributes().get("http.status_code"),
            Some(&AttrValue::Int(200))
        );
        assert_eq!(record.server_workload.as_ref().unwrap().workload_name, "web");
        assert_eq!(dispatcher.counter().events_in.load(Ordering::Relaxed), 2);

        dispatcher.stop();
    }

    #[test]
    fn replay_produces_identical_records() {
        let mut runs = vec![];
        for _ in 0..2 {
            let stats = Arc::new(stats::Collector::new(60));
            let (dispatcher, output) = Dispatcher::new(
                test_config(),
                Arc::new(WorkloadTable::default()),
                stats,
            );
            dispatcher.start();
            for event in http_exchange() {
                dispatcher.send(event);
            }
            let record = output.recv(Some(Duration::from_secs(5))).unwrap();
            runs.push(serde_json::to_string(&record.attributes()).unwrap());
            dispatcher.stop();
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn shutdown_flushes_unmatched_requests() {
        let stats = Arc::new(stats::Collector::new(60));
        let (dispatcher, output) =
            Dispatcher::new(test_config(), Arc::new(WorkloadTable::default()), stats);
        dispatcher.start();

        dispatcher.send(http_exchange().remove(0));
        // give the worker a moment to ingest before stopping
        thread::sleep(Duration::from_millis(200));
        dispatcher.stop();

        let record = output.recv(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(
            record.attributes().get("error_type"),
            Some(&AttrValue::String("shutdown".to_owned()))
        );
    }
}
