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

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use log::debug;
use lru::LruCache;

use crate::common::connection::ConnectionKey;
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::event::SocketEvent;
use crate::common::l7_protocol_log::{
    get_parser, L7ProtocolParser, L7ProtocolParserInterface, ParseParam,
};
use crate::config::AnalyzerConfig;

use super::app_table::AppTable;
use super::protocol_logs::{ErrorType, SessionRecord};
use super::session::{half_record, PendingQueue, SessionMatcher};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::l7_protocol::L7Protocol;

#[derive(Default)]
pub struct ConnTableCounter {
    pub connections: AtomicU64,
    pub evictions: AtomicU64,
    pub timeouts: AtomicU64,
    pub closes: AtomicU64,
    pub partial_overflows: AtomicU64,
    pub pending_drops: AtomicU64,
    parse_errors: [AtomicU64; PARSE_ERROR_PROTOCOLS.len()],
}

const PARSE_ERROR_PROTOCOLS: [(&str, L7Protocol); 8] = [
    ("parse_errors_http", L7Protocol::Http1),
    ("parse_errors_dubbo", L7Protocol::Dubbo),
    ("parse_errors_mysql", L7Protocol::MySQL),
    ("parse_errors_redis", L7Protocol::Redis),
    ("parse_errors_kafka", L7Protocol::Kafka),
    ("parse_errors_rocketmq", L7Protocol::RocketMQ),
    ("parse_errors_dns", L7Protocol::DNS),
    ("parse_errors_generic", L7Protocol::Generic),
];

impl ConnTableCounter {
    fn inc_parse_error(&self, proto: L7Protocol) {
        for (i, (_, p)) in PARSE_ERROR_PROTOCOLS.iter().enumerate() {
            if *p == proto {
                self.parse_errors[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

impl RefCountable for ConnTableCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let mut counters = vec![
            (
                "connection_table_size",
                CounterType::Gauged,
                CounterValue::Unsigned(self.connections.load(Ordering::Relaxed)),
            ),
            (
                "evictions",
                CounterType::Counted,
                CounterValue::Unsigned(self.evictions.swap(0, Ordering::Relaxed)),
            ),
            (
                "timeouts",
                CounterType::Counted,
                CounterValue::Unsigned(self.timeouts.swap(0, Ordering::Relaxed)),
            ),
            (
                "closes",
                CounterType::Counted,
                CounterValue::Unsigned(self.closes.swap(0, Ordering::Relaxed)),
            ),
            (
                "partial_buffer_overflows",
                CounterType::Counted,
                CounterValue::Unsigned(self.partial_overflows.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending_drops",
                CounterType::Counted,
                CounterValue::Unsigned(self.pending_drops.swap(0, Ordering::Relaxed)),
            ),
        ];
        for (i, (name, _)) in PARSE_ERROR_PROTOCOLS.iter().enumerate() {
            counters.push((
                *name,
                CounterType::Counted,
                CounterValue::Unsigned(self.parse_errors[i].swap(0, Ordering::Relaxed)),
            ));
        }
        counters
    }
}

/// Per connection analysis state. Protocol identification is frozen after
/// the first complete parse; at most one partial buffer exists per
/// direction at any time.
struct ConnectionState {
    key: ConnectionKey,
    protocol: L7Protocol,
    protocol_locked: bool,
    parser: Option<L7ProtocolParser>,

    pending: PendingQueue,
    partial_request: Option<Vec<u8>>,
    partial_response: Option<Vec<u8>>,
    // identification rounds spent without a conclusive answer
    check_count: usize,

    created_ns: u64,
    last_active_ns: u64,
}

impl ConnectionState {
    fn new(key: ConnectionKey, time_ns: u64, pending_capacity: usize) -> Self {
        Self {
            key,
            protocol: L7Protocol::Unknown,
            protocol_locked: false,
            parser: None,
            pending: PendingQueue::new(L7Protocol::Unknown, pending_capacity),
            partial_request: None,
            partial_response: None,
            check_count: 0,
            created_ns: time_ns,
            last_active_ns: time_ns,
        }
    }

    fn take_partial(&mut self, direction: PacketDirection) -> Option<Vec<u8>> {
        match direction {
            PacketDirection::ClientToServer => self.partial_request.take(),
            PacketDirection::ServerToClient => self.partial_response.take(),
        }
    }

    fn set_partial(&mut self, direction: PacketDirection, buf: Vec<u8>) {
        match direction {
            PacketDirection::ClientToServer => self.partial_request = Some(buf),
            PacketDirection::ServerToClient => self.partial_response = Some(buf),
        }
    }

    fn lock_protocol(&mut self, parser: L7ProtocolParser, pending_capacity: usize) {
        self.protocol = parser.protocol();
        self.protocol_locked = true;
        if self.pending.is_empty() {
            self.pending = PendingQueue::new(self.protocol, pending_capacity);
        }
        self.parser = Some(parser);
    }

    fn force_generic(&mut self, pending_capacity: usize) {
        self.partial_request = None;
        self.partial_response = None;
        self.lock_protocol(get_parser(L7Protocol::Generic).unwrap(), pending_capacity);
    }
}

/// The per-lane connection tracker: looks up or creates connection state,
/// drives identification and the locked decoder, feeds parsed messages to
/// the matcher and ages out idle state.
pub struct ConnTable {
    states: LruCache<ConnectionKey, ConnectionState, RandomState>,
    app_table: AppTable,
    matcher: SessionMatcher,
    config: AnalyzerConfig,
    counter: std::sync::Arc<ConnTableCounter>,
}

impl ConnTable {
    pub fn new(config: AnalyzerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_connections.max(1)).unwrap();
        Self {
            states: LruCache::with_hasher(capacity, RandomState::new()),
            app_table: AppTable::new(config.port_map.clone()),
            matcher: SessionMatcher::new(config.max_pending_per_connection),
            config,
            counter: Default::default(),
        }
    }

    pub fn counter(&self) -> std::sync::Arc<ConnTableCounter> {
        self.counter.clone()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn handle_event(&mut self, event: &SocketEvent) -> Vec<SessionRecord> {
        let mut out = vec![];
        if event.is_close() {
            self.handle_close(event);
            return out;
        }
        if event.payload.is_empty() {
            return out;
        }

        let forward = ConnectionKey::forward(event);
        let reversed = ConnectionKey::reversed(event);
        let (key, direction, mut state) = if let Some(state) = self.states.pop(&forward) {
            (forward, PacketDirection::ClientToServer, state)
        } else if let Some(state) = self.states.pop(&reversed) {
            (reversed, PacketDirection::ServerToClient, state)
        } else {
            // server side is the well known port, or failing that the
            // receiver of this first payload
            let (key, direction) = if self.app_table.is_server_port(event.dst_port) {
                (forward, PacketDirection::ClientToServer)
            } else if self.app_table.is_server_port(event.src_port) {
                (reversed, PacketDirection::ServerToClient)
            } else {
                (forward, PacketDirection::ClientToServer)
            };
            let state = ConnectionState::new(
                key,
                event.timestamp_ns,
                self.config.max_pending_per_connection,
            );
            (key, direction, state)
        };

        self.process(&mut state, event, direction, &mut out);
        state.last_active_ns = state.last_active_ns.max(event.timestamp_ns);

        if self.states.push(key, state).is_some() {
            // at capacity, the least recently used connection was dropped
            self.counter.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.counter
            .connections
            .store(self.states.len() as u64, Ordering::Relaxed);
        self.counter
            .pending_drops
            .fetch_add(std::mem::take(&mut self.matcher.pending_drops), Ordering::Relaxed);
        out
    }

    /// Periodic sweep: evicts idle connections and expires pending
    /// requests past the request timeout as synthetic error records.
    pub fn flush_timeouts(&mut self, now_ns: u64) -> Vec<SessionRecord> {
        let mut out = vec![];
        let request_deadline = now_ns.saturating_sub(self.config.request_timeout_ns);
        let idle_deadline = now_ns.saturating_sub(self.config.connection_idle_ttl_ns);

        let keys: Vec<ConnectionKey> = self.states.iter().map(|(k, _)| *k).collect();
        for key in keys {
            let idle = self
                .states
                .peek(&key)
                .map(|s| s.last_active_ns < idle_deadline)
                .unwrap_or(false);
            if idle {
                if let Some(mut state) = self.states.pop(&key) {
                    debug!(
                        "{} idle, evicted after {}ms of life",
                        key,
                        state.last_active_ns.saturating_sub(state.created_ns) / 1_000_000
                    );
                    self.counter.evictions.fetch_add(1, Ordering::Relaxed);
                    self.expire_pending(&mut state, u64::MAX, &mut out);
                }
                continue;
            }
            if let Some(state) = self.states.peek_mut(&key) {
                let mut expired = vec![];
                for request in state.pending.take_older_than(request_deadline) {
                    expired.push(request);
                }
                for request in expired {
                    self.counter.timeouts.fetch_add(1, Ordering::Relaxed);
                    out.push(half_record(
                        key,
                        request.info,
                        request.time_ns,
                        0,
                        ErrorType::Timeout,
                    ));
                }
            }
        }
        self.counter
            .connections
            .store(self.states.len() as u64, Ordering::Relaxed);
        out
    }

    /// Shutdown drain: every in-flight request leaves as a synthetic
    /// record so nothing disappears silently.
    pub fn drain(&mut self) -> Vec<SessionRecord> {
        let mut out = vec![];
        while let Some((key, mut state)) = self.states.pop_lru() {
            for request in state.pending.drain() {
                out.push(half_record(
                    key,
                    request.info,
                    request.time_ns,
                    0,
                    ErrorType::Shutdown,
                ));
            }
        }
        self.counter.connections.store(0, Ordering::Relaxed);
        out
    }

    fn handle_close(&mut self, event: &SocketEvent) {
        let forward = ConnectionKey::forward(event);
        let reversed = ConnectionKey::reversed(event);
        if self.states.pop(&forward).is_some() || self.states.pop(&reversed).is_some() {
            self.counter.closes.fetch_add(1, Ordering::Relaxed);
            self.counter
                .connections
                .store(self.states.len() as u64, Ordering::Relaxed);
        }
    }

    fn expire_pending(&self, state: &mut ConnectionState, deadline: u64, out: &mut Vec<SessionRecord>) {
        for request in state.pending.take_older_than(deadline) {
            self.counter.timeouts.fetch_add(1, Ordering::Relaxed);
            out.push(half_record(
                state.key,
                request.info,
                request.time_ns,
                0,
                ErrorType::Timeout,
            ));
        }
    }

    fn process(
        &mut self,
        state: &mut ConnectionState,
        event: &SocketEvent,
        direction: PacketDirection,
        out: &mut Vec<SessionRecord>,
    ) {
        // stitch the partial buffer of this direction with the new bytes;
        // the payload is only copied when a partial exists
        let combined: Option<Vec<u8>> = match state.take_partial(direction) {
            Some(mut partial) => {
                if partial.len() + event.payload.len() > self.config.max_partial_buffer {
                    self.counter.partial_overflows.fetch_add(1, Ordering::Relaxed);
                    debug!("{} partial buffer overflow, falling back to generic", state.key);
                    state.force_generic(self.config.max_pending_per_connection);
                    None
                } else {
                    partial.extend_from_slice(&event.payload);
                    Some(partial)
                }
            }
            None => None,
        };
        let payload: &[u8] = combined.as_deref().unwrap_or(&event.payload);

        let mut param = ParseParam::new(event.l4_protocol, direction, state.key.server_port);
        param.time_ns = event.timestamp_ns;
        param.truncated = event.is_truncated();

        if state.protocol_locked {
            self.parse_locked(state, payload, &param, out);
        } else {
            self.identify(state, payload, &param, out);
        }
    }

    fn parse_locked(
        &mut self,
        state: &mut ConnectionState,
        payload: &[u8],
        param: &ParseParam,
        out: &mut Vec<SessionRecord>,
    ) {
        let parser = state.parser.as_mut().unwrap();
        match parser.parse_payload(payload, param) {
            Ok(result) => {
                parser.reset();
                for info in result.into_vec() {
                    if let Some(record) =
                        self.matcher
                            .on_message(state.key, &mut state.pending, info, param.time_ns)
                    {
                        out.push(record);
                    }
                }
            }
            Err(e) if e.is_incomplete() => {
                self.retain_partial(state, param.direction, payload);
            }
            Err(_) => {
                // bytes that fit no message boundary are dropped to resync
                self.counter.inc_parse_error(state.protocol);
            }
        }
    }

    fn identify(
        &mut self,
        state: &mut ConnectionState,
        payload: &[u8],
        param: &ParseParam,
        out: &mut Vec<SessionRecord>,
    ) {
        let time_in_sec = param.time_ns / 1_000_000_000;
        let cached = self.app_table.get_protocol(
            state.key.server_ip,
            state.key.server_port,
            time_in_sec,
        );
        let candidates = match cached {
            Some(L7Protocol::Unknown) | Some(L7Protocol::Generic) => {
                state.force_generic(self.config.max_pending_per_connection);
                self.parse_locked(state, payload, param, out);
                return;
            }
            Some(proto) => get_parser(proto).map(|p| vec![p]).unwrap_or_default(),
            None => self.app_table.candidates(state.key.server_port),
        };

        let mut need_more_bytes = false;
        for mut parser in candidates {
            if self.config.l7_protocol_enabled.is_disabled(parser.protocol()) {
                continue;
            }
            let parsable = match param.l4_protocol {
                IpProtocol::Tcp => parser.parsable_on_tcp(),
                IpProtocol::Udp => parser.parsable_on_udp(),
                _ => false,
            };
            if !parsable || !parser.check_payload(payload, param) {
                continue;
            }
            match parser.parse_payload(payload, param) {
                Ok(result) => {
                    parser.reset();
                    state.lock_protocol(parser, self.config.max_pending_per_connection);
                    state.check_count = 0;
                    self.app_table.set_protocol(
                        state.key.server_ip,
                        state.key.server_port,
                        state.protocol,
                        time_in_sec,
                    );
                    for info in result.into_vec() {
                        if let Some(record) = self.matcher.on_message(
                            state.key,
                            &mut state.pending,
                            info,
                            param.time_ns,
                        ) {
                            out.push(record);
                        }
                    }
                    return;
                }
                // the buffer is retained once, later events retry with the
                // concatenation
                Err(e) if e.is_incomplete() => need_more_bytes = true,
                Err(_) => {}
            }
        }

        state.check_count += 1;
        if state.check_count >= self.config.identification_max_retries {
            self.app_table.set_protocol(
                state.key.server_ip,
                state.key.server_port,
                L7Protocol::Unknown,
                time_in_sec,
            );
            debug!("{} identification exhausted, falling back to generic", state.key);
            state.force_generic(self.config.max_pending_per_connection);
            self.parse_locked(state, payload, param, out);
        } else if need_more_bytes {
            self.retain_partial(state, param.direction, payload);
        }
    }

    fn retain_partial(
        &mut self,
        state: &mut ConnectionState,
        direction: PacketDirection,
        payload: &[u8],
    ) {
        if payload.len() > self.config.max_partial_buffer {
            self.counter.partial_overflows.fetch_add(1, Ordering::Relaxed);
            state.force_generic(self.config.max_pending_per_connection);
            return;
        }
        state.set_partial(direction, payload.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::common::event::{EventFlags, IoDirection, Syscall};
    use crate::common::l7_protocol_info::L7ProtocolInfo;
    use crate::analyzer::payload::AttrValue;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig::default()
    }

    fn event(
        ts: u64,
        src: (u8, u16),
        dst: (u8, u16),
        l4: IpProtocol,
        payload: &[u8],
    ) -> SocketEvent {
        SocketEvent {
            timestamp_ns: ts,
            pid: 100,
            tid: 100,
            direction: IoDirection::Egress,
            syscall: Syscall::Write,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, src.0)),
            src_port: src.1,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, dst.0)),
            dst_port: dst.1,
            l4_protocol: l4,
            payload: payload.to_vec(),
            flags: EventFlags::NONE,
        }
    }

    const CLIENT: (u8, u16) = (1, 41000);
    const HTTP_SERVER: (u8, u16) = (2, 80);
    const MYSQL_SERVER: (u8, u16) = (3, 3306);
    const DNS_SERVER: (u8, u16) = (4, 53);
    const REDIS_SERVER: (u8, u16) = (5, 6379);

    #[test]
    fn http_get_200_single_chunk() {
        let mut table = ConnTable::new(config());
        let req = event(
            1_000,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        assert!(table.handle_event(&req).is_empty());

        let resp = event(
            5_000,
            HTTP_SERVER,
            CLIENT,
            IpProtocol::Tcp,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        let records = table.handle_event(&resp);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.proto, L7Protocol::Http1);
        assert_eq!(record.latency_ns, 4_000);
        assert!(!record.is_error);

        let attrs = record.attributes();
        assert_eq!(
            attrs.get("http.method"),
            Some(&AttrValue::String("GET".to_owned()))
        );
        assert_eq!(
            attrs.get("http.url"),
            Some(&AttrValue::String("/x".to_owned()))
        );
        assert_eq!(attrs.get("http.status_code"), Some(&AttrValue::Int(200)));
        assert_eq!(attrs.get("is_error"), Some(&AttrValue::Bool(false)));
    }

    #[test]
    fn http_pipelined_two_pairs_in_order() {
        let mut table = ConnTable::new(config());
        for (ts, path) in [(1_000u64, "/a"), (2_000, "/b")] {
            let payload = format!("GET {} HTTP/1.1\r\nHost: a\r\n\r\n", path);
            let req = event(ts, CLIENT, HTTP_SERVER, IpProtocol::Tcp, payload.as_bytes());
            assert!(table.handle_event(&req).is_empty());
        }
        let mut records = vec![];
        for ts in [3_000u64, 4_000] {
            let resp = event(
                ts,
                HTTP_SERVER,
                CLIENT,
                IpProtocol::Tcp,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            );
            records.extend(table.handle_event(&resp));
        }
        assert_eq!(records.len(), 2);
        let L7ProtocolInfo::HttpInfo(first) = &records[0].info else {
            unreachable!()
        };
        let L7ProtocolInfo::HttpInfo(second) = &records[1].info else {
            unreachable!()
        };
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn mysql_err_pair() {
        let mut table = ConnTable::new(config());
        let mut com_query = vec![];
        let sql = b"SELECT 1 FROM no_table";
        com_query.extend_from_slice(&[(sql.len() + 1) as u8, 0, 0, 0, 3]);
        com_query.extend_from_slice(sql);
        let req = event(1_000, CLIENT, MYSQL_SERVER, IpProtocol::Tcp, &com_query);
        assert!(table.handle_event(&req).is_empty());

        let mut err = vec![0xff];
        err.extend_from_slice(&1146u16.to_le_bytes());
        err.extend_from_slice(b"#42S02Table 'no_table' doesn't exist");
        let mut packet = vec![err.len() as u8, 0, 0, 1];
        packet.extend_from_slice(&err);
        let resp = event(2_000, MYSQL_SERVER, CLIENT, IpProtocol::Tcp, &packet);
        let records = table.handle_event(&resp);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_error);

        let attrs = records[0].attributes();
        assert_eq!(
            attrs.get("sql"),
            Some(&AttrValue::String("SELECT 1 FROM no_table".to_owned()))
        );
        assert_eq!(attrs.get("mysql.error_code"), Some(&AttrValue::Int(1146)));
    }

    #[test]
    fn dns_a_record_pair_by_id() {
        let mut table = ConnTable::new(config());
        // id 0x1234, A example.com
        let query = [
            0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 7, b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', 3, b'c', b'o', b'm', 0, 0, 1, 0, 1,
        ];
        let req = event(1_000, CLIENT, DNS_SERVER, IpProtocol::Udp, &query);
        assert!(table.handle_event(&req).is_empty());

        let mut response = query.to_vec();
        response[2] = 0x81;
        response[3] = 0x80;
        response[7] = 1; // ANCOUNT
        response.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 1, 0x2c, 0, 4, 93, 184, 216, 34]);
        let resp = event(2_000, DNS_SERVER, CLIENT, IpProtocol::Udp, &response);
        let records = table.handle_event(&resp);
        assert_eq!(records.len(), 1);

        let attrs = records[0].attributes();
        assert_eq!(
            attrs.get("dns.domain"),
            Some(&AttrValue::String("example.com".to_owned()))
        );
        assert_eq!(
            attrs.get("dns.ip"),
            Some(&AttrValue::String("93.184.216.34".to_owned()))
        );
        assert_eq!(attrs.get("dns.rcode"), Some(&AttrValue::Int(0)));
        assert!(!records[0].is_error);
    }

    #[test]
    fn redis_request_split_across_chunks() {
        let mut table = ConnTable::new(config());
        let payload = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n";
        let chunks = [&payload[..5], &payload[5..14], &payload[14..]];
        for (i, chunk) in chunks.iter().enumerate() {
            let req = event(1_000 + i as u64, CLIENT, REDIS_SERVER, IpProtocol::Tcp, chunk);
            assert!(table.handle_event(&req).is_empty());
        }

        let resp = event(9_000, REDIS_SERVER, CLIENT, IpProtocol::Tcp, b"+OK\r\n");
        let records = table.handle_event(&resp);
        assert_eq!(records.len(), 1);
        let attrs = records[0].attributes();
        assert_eq!(
            attrs.get("redis.command"),
            Some(&AttrValue::String("SET".to_owned()))
        );
        assert_eq!(
            attrs.get("redis.key"),
            Some(&AttrValue::String("a".to_owned()))
        );
    }

    #[test]
    fn split_request_equals_single_chunk_attributes() {
        let payload = b"GET /split HTTP/1.1\r\nHost: chunky\r\nUser-Agent: t\r\n\r\n";
        let whole = {
            let mut table = ConnTable::new(config());
            let req = event(1_000, CLIENT, HTTP_SERVER, IpProtocol::Tcp, payload);
            table.handle_event(&req);
            let resp = event(
                2_000,
                HTTP_SERVER,
                CLIENT,
                IpProtocol::Tcp,
                b"HTTP/1.1 200 OK\r\n\r\n",
            );
            table.handle_event(&resp).remove(0)
        };

        for n in 2..=8usize {
            let mut table = ConnTable::new(config());
            let chunk_size = (payload.len() + n - 1) / n;
            for (i, chunk) in payload.chunks(chunk_size).enumerate() {
                let req = event(1_000 + i as u64, CLIENT, HTTP_SERVER, IpProtocol::Tcp, chunk);
                table.handle_event(&req);
            }
            let resp = event(
                2_000,
                HTTP_SERVER,
                CLIENT,
                IpProtocol::Tcp,
                b"HTTP/1.1 200 OK\r\n\r\n",
            );
            let records = table.handle_event(&resp);
            assert_eq!(records.len(), 1, "{} chunks", n);
            let L7ProtocolInfo::HttpInfo(info) = &records[0].info else {
                unreachable!()
            };
            let L7ProtocolInfo::HttpInfo(whole_info) = &whole.info else {
                unreachable!()
            };
            assert_eq!(info.path, whole_info.path);
            assert_eq!(info.host, whole_info.host);
            assert_eq!(info.status_code, whole_info.status_code);
        }
    }

    #[test]
    fn protocol_lock_is_stable() {
        let mut table = ConnTable::new(config());
        let req = event(
            1_000,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET / HTTP/1.1\r\n\r\n",
        );
        table.handle_event(&req);
        {
            let key = ConnectionKey::forward(&req);
            let state = table.states.peek(&key).unwrap();
            assert!(state.protocol_locked);
            assert_eq!(state.protocol, L7Protocol::Http1);
        }

        // redis shaped bytes on the same connection stay http
        let stray = event(
            2_000,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"*1\r\n$4\r\nPING\r\n",
        );
        table.handle_event(&stray);
        let key = ConnectionKey::forward(&req);
        let state = table.states.peek(&key).unwrap();
        assert_eq!(state.protocol, L7Protocol::Http1);
    }

    #[test]
    fn request_timeout_emits_synthetic_error() {
        let mut table = ConnTable::new(config());
        let req = event(
            0,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET /slow HTTP/1.1\r\n\r\n",
        );
        table.handle_event(&req);

        // before the deadline nothing fires
        assert!(table.flush_timeouts(30_000_000_000).is_empty());

        let records = table.flush_timeouts(65_000_000_000);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_error);
        assert_eq!(records[0].error_type, ErrorType::Timeout);
        let attrs = records[0].attributes();
        assert_eq!(
            attrs.get("error_type"),
            Some(&AttrValue::String("timeout".to_owned()))
        );
    }

    #[test]
    fn idle_connection_is_evicted() {
        let mut table = ConnTable::new(config());
        let req = event(
            0,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET / HTTP/1.1\r\n\r\n",
        );
        table.handle_event(&req);
        assert_eq!(table.len(), 1);

        table.flush_timeouts(121_000_000_000);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn close_event_destroys_state() {
        let mut table = ConnTable::new(config());
        let req = event(
            0,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET / HTTP/1.1\r\n\r\n",
        );
        table.handle_event(&req);
        assert_eq!(table.len(), 1);

        let mut close = event(1_000, CLIENT, HTTP_SERVER, IpProtocol::Tcp, b"");
        close.flags = EventFlags::CLOSE;
        table.handle_event(&close);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn partial_overflow_falls_back_to_generic() {
        let mut config = config();
        config.max_partial_buffer = 16;
        let mut table = ConnTable::new(config);

        // an http prefix that never completes keeps asking for more
        let req = event(1_000, CLIENT, HTTP_SERVER, IpProtocol::Tcp, b"GET /aaaa HTTP/1.1\r\n");
        table.handle_event(&req);
        let req = event(2_000, CLIENT, HTTP_SERVER, IpProtocol::Tcp, b"X-Filler: yyyy\r\n");
        table.handle_event(&req);

        let key = ConnectionKey::forward(&req);
        let state = table.states.peek(&key).unwrap();
        assert_eq!(state.protocol, L7Protocol::Generic);
        assert!(state.protocol_locked);
        assert_eq!(
            table.counter.partial_overflows.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn shutdown_drain_flushes_pending() {
        let mut table = ConnTable::new(config());
        let req = event(
            0,
            CLIENT,
            HTTP_SERVER,
            IpProtocol::Tcp,
            b"GET /inflight HTTP/1.1\r\n\r\n",
        );
        table.handle_event(&req);

        let records = table.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_type, ErrorType::Shutdown);
        assert!(records[0].is_error);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unknown_port_identifies_by_content() {
        let mut table = ConnTable::new(config());
        let req = event(
            1_000,
            CLIENT,
            (9, 7777),
            IpProtocol::Tcp,
            b"GET /hidden HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        table.handle_event(&req);
        let key = ConnectionKey::forward(&req);
        let state = table.states.peek(&key).unwrap();
        assert_eq!(state.protocol, L7Protocol::Http1);

        // the conclusion is cached for the next connection to the endpoint
        let req2 = event(2_000, (1, 42000), (9, 7777), IpProtocol::Tcp, b"GET / HTTP/1.1\r\n\r\n");
        table.handle_event(&req2);
        let key2 = ConnectionKey::forward(&req2);
        assert_eq!(
            table.states.peek(&key2).unwrap().protocol,
            L7Protocol::Http1
        );
    }

    #[test]
    fn identification_retry_cap_falls_back_to_generic() {
        let mut table = ConnTable::new(config());
        // unmatchable bytes on an unknown port
        for i in 0..5u64 {
            let req = event(
                1_000 + i,
                CLIENT,
                (9, 7000),
                IpProtocol::Tcp,
                &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
            );
            table.handle_event(&req);
        }
        let probe = event(
            9_000,
            CLIENT,
            (9, 7000),
            IpProtocol::Tcp,
            &[0x00, 0x01, 0x02],
        );
        let records = table.handle_event(&probe);
        let key = ConnectionKey::forward(&probe);
        let state = table.states.peek(&key).unwrap();
        assert_eq!(state.protocol, L7Protocol::Generic);
        // generic parses every payload into a record, requests queue only
        assert!(records.is_empty());
        assert!(!state.pending.is_empty());
    }

    #[test]
    fn mysql_greeting_then_query() {
        let mut table = ConnTable::new(config());
        // server greeting arrives first
        let mut greeting = vec![10u8];
        greeting.extend_from_slice(b"8.0.30\0");
        greeting.extend_from_slice(&[0; 10]);
        let mut packet = vec![greeting.len() as u8, 0, 0, 0];
        packet.extend_from_slice(&greeting);
        let ev = event(500, MYSQL_SERVER, CLIENT, IpProtocol::Tcp, &packet);
        let records = table.handle_event(&ev);
        assert!(records.is_empty());
    }
}
