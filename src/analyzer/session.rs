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

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::connection::ConnectionKey;
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};

use super::protocol_logs::{ErrorType, SessionRecord};

use public::l7_protocol::{L7Protocol, LogMessageType};

pub struct PendingRequest {
    pub info: L7ProtocolInfo,
    pub time_ns: u64,
}

/// In-flight requests of one connection. Connection oriented protocols
/// match strictly in FIFO order which covers pipelining; id keyed
/// protocols match on the session id carried by both halves.
pub enum PendingQueue {
    Fifo(VecDeque<PendingRequest>),
    ById(LruCache<u32, PendingRequest>),
}

impl PendingQueue {
    pub fn new(proto: L7Protocol, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        if proto.has_session_id() {
            // safe because capacity is clamped above zero
            Self::ById(LruCache::new(NonZeroUsize::new(capacity).unwrap()))
        } else {
            Self::Fifo(VecDeque::with_capacity(capacity))
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Fifo(q) => q.len(),
            Self::ById(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // returns true when the oldest entry was dropped to make room
    fn push(&mut self, request: PendingRequest, capacity: usize) -> bool {
        match self {
            Self::Fifo(q) => {
                let mut dropped = false;
                if q.len() >= capacity {
                    q.pop_front();
                    dropped = true;
                }
                q.push_back(request);
                dropped
            }
            Self::ById(m) => {
                let id = request.info.session_id().unwrap_or_default();
                let dropped = m.len() >= capacity && !m.contains(&id);
                m.put(id, request);
                dropped
            }
        }
    }

    fn pop_match(&mut self, response: &L7ProtocolInfo) -> Option<PendingRequest> {
        match self {
            Self::Fifo(q) => q.pop_front(),
            Self::ById(m) => m.pop(&response.session_id().unwrap_or_default()),
        }
    }

    pub fn drain(&mut self) -> Vec<PendingRequest> {
        match self {
            Self::Fifo(q) => q.drain(..).collect(),
            Self::ById(m) => {
                let mut out = vec![];
                while let Some((_, v)) = m.pop_lru() {
                    out.push(v);
                }
                out
            }
        }
    }

    // expire requests older than the deadline
    pub fn take_older_than(&mut self, deadline_ns: u64) -> Vec<PendingRequest> {
        match self {
            Self::Fifo(q) => {
                let mut out = vec![];
                while let Some(front) = q.front() {
                    if front.time_ns < deadline_ns {
                        out.push(q.pop_front().unwrap());
                    } else {
                        break;
                    }
                }
                out
            }
            Self::ById(m) => {
                let expired: Vec<u32> = m
                    .iter()
                    .filter(|(_, v)| v.time_ns < deadline_ns)
                    .map(|(k, _)| *k)
                    .collect();
                expired.into_iter().filter_map(|k| m.pop(&k)).collect()
            }
        }
    }
}

pub struct SessionMatcher {
    capacity: usize,
    pub pending_drops: u64,
}

impl SessionMatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending_drops: 0,
        }
    }

    /// Feed one parsed message. Requests are queued, responses are matched
    /// and merged into an emitted record. A response with no matching
    /// request still produces a half record so errors stay visible.
    pub fn on_message(
        &mut self,
        key: ConnectionKey,
        pending: &mut PendingQueue,
        info: L7ProtocolInfo,
        time_ns: u64,
    ) -> Option<SessionRecord> {
        let Some(head) = info.app_proto_head() else {
            return None;
        };
        match head.msg_type {
            LogMessageType::Request => {
                if pending.push(PendingRequest { info, time_ns }, self.capacity) {
                    self.pending_drops += 1;
                }
                None
            }
            LogMessageType::Response => match pending.pop_match(&info) {
                Some(request) => Some(merge_pair(key, request, info, time_ns)),
                None => Some(half_record(key, info, 0, time_ns, ErrorType::None)),
            },
            // one way messages pass through unmatched
            _ => Some(half_record(key, info, time_ns, 0, ErrorType::None)),
        }
    }
}

fn merge_pair(
    key: ConnectionKey,
    request: PendingRequest,
    mut response: L7ProtocolInfo,
    resp_time_ns: u64,
) -> SessionRecord {
    let mut info = request.info;
    let _ = info.merge_log(&mut response);
    let latency_ns = resp_time_ns.saturating_sub(request.time_ns);
    let proto = info
        .app_proto_head()
        .map(|h| h.proto)
        .unwrap_or(L7Protocol::Unknown);
    SessionRecord {
        key,
        proto,
        msg_type: LogMessageType::Session,
        req_time_ns: request.time_ns,
        resp_time_ns,
        latency_ns,
        is_error: info.is_error(),
        info,
        error_type: ErrorType::None,
        client_workload: None,
        server_workload: None,
    }
}

pub fn half_record(
    key: ConnectionKey,
    info: L7ProtocolInfo,
    req_time_ns: u64,
    resp_time_ns: u64,
    error_type: ErrorType,
) -> SessionRecord {
    let head = info.app_proto_head().unwrap_or_default();
    let forced_error = error_type != ErrorType::None;
    SessionRecord {
        key,
        proto: head.proto,
        msg_type: head.msg_type,
        req_time_ns,
        resp_time_ns,
        latency_ns: 0,
        is_error: forced_error || info.is_error(),
        info,
        error_type,
        client_workload: None,
        server_workload: None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::analyzer::payload::AttrValue;
    use crate::analyzer::protocol_logs::{HttpInfo, DnsInfo, L7ResponseStatus};
    use crate::common::enums::IpProtocol;

    fn key() -> ConnectionKey {
        ConnectionKey {
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 40000,
            server_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            server_port: 80,
            proto: IpProtocol::Tcp,
            pid: 1,
        }
    }

    fn http_request(path: &str) -> L7ProtocolInfo {
        L7ProtocolInfo::HttpInfo(HttpInfo {
            msg_type: LogMessageType::Request,
            method: "GET".to_owned(),
            path: path.to_owned(),
            ..Default::default()
        })
    }

    fn http_response(code: i32) -> L7ProtocolInfo {
        L7ProtocolInfo::HttpInfo(HttpInfo {
            msg_type: LogMessageType::Response,
            status_code: Some(code),
            status: if code >= 400 {
                L7ResponseStatus::ClientError
            } else {
                L7ResponseStatus::Ok
            },
            ..Default::default()
        })
    }

    #[test]
    fn pipelined_fifo_matching() {
        let mut matcher = SessionMatcher::new(16);
        let mut pending = PendingQueue::new(L7Protocol::Http1, 16);

        assert!(matcher
            .on_message(key(), &mut pending, http_request("/a"), 100)
            .is_none());
        assert!(matcher
            .on_message(key(), &mut pending, http_request("/b"), 200)
            .is_none());
        assert_eq!(pending.len(), 2);

        let first = matcher
            .on_message(key(), &mut pending, http_response(200), 300)
            .unwrap();
        let second = matcher
            .on_message(key(), &mut pending, http_response(404), 400)
            .unwrap();

        let L7ProtocolInfo::HttpInfo(info) = &first.info else {
            unreachable!()
        };
        assert_eq!(info.path, "/a");
        assert_eq!(first.latency_ns, 200);
        assert!(!first.is_error);

        let L7ProtocolInfo::HttpInfo(info) = &second.info else {
            unreachable!()
        };
        assert_eq!(info.path, "/b");
        assert!(second.is_error);
    }

    #[test]
    fn response_without_request_is_half_record() {
        let mut matcher = SessionMatcher::new(16);
        let mut pending = PendingQueue::new(L7Protocol::Http1, 16);
        let record = matcher
            .on_message(key(), &mut pending, http_response(500), 10)
            .unwrap();
        assert_eq!(record.msg_type, LogMessageType::Response);
        assert_eq!(record.req_time_ns, 0);
        assert!(record.is_error);
    }

    #[test]
    fn fifo_overflow_drops_oldest() {
        let mut matcher = SessionMatcher::new(2);
        let mut pending = PendingQueue::new(L7Protocol::Http1, 2);
        for i in 0..3 {
            matcher.on_message(key(), &mut pending, http_request(&format!("/{}", i)), i);
        }
        assert_eq!(pending.len(), 2);
        assert_eq!(matcher.pending_drops, 1);

        // the oldest left is /1
        let record = matcher
            .on_message(key(), &mut pending, http_response(200), 10)
            .unwrap();
        let L7ProtocolInfo::HttpInfo(info) = &record.info else {
            unreachable!()
        };
        assert_eq!(info.path, "/1");
    }

    #[test]
    fn id_keyed_matching_out_of_order() {
        let mut matcher = SessionMatcher::new(16);
        let mut pending = PendingQueue::new(L7Protocol::DNS, 16);

        let req = |id: u16| {
            L7ProtocolInfo::DnsInfo(DnsInfo {
                msg_type: LogMessageType::Request,
                trans_id: id,
                query_name: format!("q{}.example.com", id),
                ..Default::default()
            })
        };
        let resp = |id: u16, rcode: u8| {
            L7ProtocolInfo::DnsInfo(DnsInfo {
                msg_type: LogMessageType::Response,
                trans_id: id,
                status_code: Some(rcode),
                ..Default::default()
            })
        };

        matcher.on_message(key(), &mut pending, req(1), 100);
        matcher.on_message(key(), &mut pending, req(2), 200);

        // responses arrive reversed, ids still pair correctly
        let record = matcher
            .on_message(key(), &mut pending, resp(2, 0), 300)
            .unwrap();
        let L7ProtocolInfo::DnsInfo(info) = &record.info else {
            unreachable!()
        };
        assert_eq!(info.query_name, "q2.example.com");
        assert_eq!(record.latency_ns, 100);

        let record = matcher
            .on_message(key(), &mut pending, resp(1, 3), 400)
            .unwrap();
        let L7ProtocolInfo::DnsInfo(info) = &record.info else {
            unreachable!()
        };
        assert_eq!(info.query_name, "q1.example.com");
        assert!(record.is_error);
    }

    #[test]
    fn zero_latency_pair_keeps_latency_attribute() {
        let mut matcher = SessionMatcher::new(16);
        let mut pending = PendingQueue::new(L7Protocol::Http1, 16);

        // request and response observed at the same nanosecond
        matcher.on_message(key(), &mut pending, http_request("/z"), 500);
        let record = matcher
            .on_message(key(), &mut pending, http_response(200), 500)
            .unwrap();
        assert_eq!(record.latency_ns, 0);
        assert_eq!(
            record.attributes().get("latency_ns"),
            Some(&AttrValue::Int(0))
        );

        // a half record has no latency to report
        let half = matcher
            .on_message(key(), &mut pending, http_response(200), 600)
            .unwrap();
        assert!(half.attributes().get("latency_ns").is_none());
    }

    #[test]
    fn take_older_than_expires_in_order() {
        let mut pending = PendingQueue::new(L7Protocol::Http1, 16);
        let mut matcher = SessionMatcher::new(16);
        matcher.on_message(key(), &mut pending, http_request("/old"), 100);
        matcher.on_message(key(), &mut pending, http_request("/new"), 900);

        let expired = pending.take_older_than(500);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].time_ns, 100);
        assert_eq!(pending.len(), 1);
    }
}
