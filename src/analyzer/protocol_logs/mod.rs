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

pub mod consts;
mod dns;
mod generic;
mod http;
mod mq;
mod rpc;
mod sql;

pub use dns::{DnsInfo, DnsLog};
pub use generic::{GenericInfo, GenericLog};
pub use http::{is_http_v1_payload, parse_v1_headers, HttpInfo, HttpLog};
pub use mq::{KafkaInfo, KafkaLog, RocketmqInfo, RocketmqLog};
pub use rpc::{DubboHeader, DubboInfo, DubboLog};
pub use sql::{MysqlHeader, MysqlInfo, MysqlLog, RedisInfo, RedisLog};

use std::sync::Arc;

use serde::Serialize;

use crate::common::connection::ConnectionKey;
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::platform::Workload;

use super::payload::AttributeMap;

use public::l7_protocol::{L7Protocol, LogMessageType};

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppProtoHead {
    pub proto: L7Protocol,
    pub msg_type: LogMessageType,
    // request-response time in nanoseconds
    pub rrt: u64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum L7ResponseStatus {
    Ok = 0,
    Timeout = 2,
    ServerError = 3,
    ClientError = 4,
    Unknown = 5,
}

impl Default for L7ResponseStatus {
    fn default() -> Self {
        L7ResponseStatus::Unknown
    }
}

impl L7ResponseStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, L7ResponseStatus::ServerError | L7ResponseStatus::ClientError)
    }
}

// synthetic failure class of an emitted record, protocol-level errors are
// carried by the info attributes instead
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    None,
    Timeout,
    Shutdown,
}

impl Default for ErrorType {
    fn default() -> Self {
        ErrorType::None
    }
}

/// One matched request/response pair (or half pair) ready for export.
#[derive(Serialize, Debug, Clone)]
pub struct SessionRecord {
    pub key: ConnectionKey,
    pub proto: L7Protocol,
    pub msg_type: LogMessageType,

    pub req_time_ns: u64,
    pub resp_time_ns: u64,
    pub latency_ns: u64,

    // request info with the response merged in, or whichever half exists
    pub info: L7ProtocolInfo,
    pub is_error: bool,
    pub error_type: ErrorType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_workload: Option<Arc<Workload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_workload: Option<Arc<Workload>>,
}

impl SessionRecord {
    pub fn attributes(&self) -> AttributeMap {
        let mut attrs = AttributeMap::default();
        self.info.fill_attributes(&mut attrs);
        attrs.add_bool("is_error", self.is_error);
        if self.error_type != ErrorType::None {
            attrs.add_str(
                "error_type",
                match self.error_type {
                    ErrorType::Timeout => "timeout",
                    ErrorType::Shutdown => "shutdown",
                    ErrorType::None => unreachable!(),
                },
            );
        }
        // every matched pair reports its latency, a zero difference
        // included; half records have none to report
        if self.msg_type == LogMessageType::Session {
            attrs.add_int("latency_ns", self.latency_ns as i64);
        }
        attrs
    }
}

pub fn value_is_default<T>(t: &T) -> bool
where
    T: Default + std::cmp::PartialEq,
{
    t == &T::default()
}
