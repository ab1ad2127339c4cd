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

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(
    Serialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    IntoPrimitive,
    num_enum::Default,
)]
#[repr(u8)]
pub enum L7Protocol {
    #[num_enum(default)]
    Unknown = 0,

    // HTTP
    Http1 = 20,

    // RPC
    Dubbo = 40,

    // SQL
    MySQL = 60,

    // NoSQL
    Redis = 80,

    // MQ
    Kafka = 100,
    RocketMQ = 107,

    // INFRA
    DNS = 120,

    Generic = 127,

    Max = 255,
}

impl L7Protocol {
    // id keyed protocols match request to response by session id
    // instead of pipelined FIFO order
    pub fn has_session_id(&self) -> bool {
        match self {
            Self::DNS | Self::Dubbo | Self::Kafka | Self::RocketMQ => true,
            _ => false,
        }
    }
}

// Translate the string value of l7_protocol into an L7Protocol enumeration value.
impl From<String> for L7Protocol {
    fn from(mut s: String) -> Self {
        s.make_ascii_lowercase();
        match s.as_str() {
            "http" | "https" => Self::Http1,
            "dubbo" => Self::Dubbo,
            "mysql" => Self::MySQL,
            "redis" => Self::Redis,
            "kafka" => Self::Kafka,
            "rocketmq" => Self::RocketMQ,
            "dns" => Self::DNS,
            "generic" => Self::Generic,
            _ => Self::Unknown,
        }
    }
}

// separate impl for &str because `From<AsRef<str>>` conflicts with FromPrimitive
impl From<&str> for L7Protocol {
    fn from(s: &str) -> Self {
        s.to_lowercase().into()
    }
}

#[derive(Serialize, Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum LogMessageType {
    Request,
    Response,
    Session,
    Other,
    Max,
}

impl Default for LogMessageType {
    fn default() -> Self {
        LogMessageType::Other
    }
}
