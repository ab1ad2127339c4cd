/*
 * Copyright (c) 2022 Yunshan Networks
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

use serde::Serialize;

use super::super::consts::{KAFKA_REQ_HEADER_LEN, KAFKA_RESP_HEADER_LEN};
use super::super::{value_is_default, AppProtoHead};

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::{AttributeMap, PayloadMessage};
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::l7_protocol::{L7Protocol, LogMessageType};

const API_KEY_PRODUCE: u16 = 0;
const API_KEY_FETCH: u16 = 1;
const API_KEY_METADATA: u16 = 3;
// https://kafka.apache.org/protocol.html
const API_KEY_MAX: u16 = 67;

#[derive(Serialize, Debug, Default, Clone)]
pub struct KafkaInfo {
    pub msg_type: LogMessageType,

    #[serde(rename = "request_id")]
    pub correlation_id: u32,

    // request
    pub api_key: u16,
    pub api_version: u16,
    #[serde(skip_serializing_if = "value_is_default")]
    pub client_id: String,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub topic: String,
    pub req_msg_size: i32,

    // response
    pub resp_msg_size: i32,
}

impl L7ProtocolInfoInterface for KafkaInfo {
    fn session_id(&self) -> Option<u32> {
        Some(self.correlation_id)
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::KafkaInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::Kafka,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        false
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        let api = self.api_name();
        if !api.is_empty() {
            attrs.add_str("kafka.api", api);
        }
        if !self.topic.is_empty() {
            attrs.add_str("kafka.topic", self.topic.clone());
        }
        attrs.add_int("kafka.correlation_id", self.correlation_id as i64);
        if !self.client_id.is_empty() {
            attrs.add_str("kafka.client_id", self.client_id.clone());
        }
    }
}

impl KafkaInfo {
    pub fn merge(&mut self, other: &mut Self) {
        match other.msg_type {
            LogMessageType::Request => {
                self.api_key = other.api_key;
                self.api_version = other.api_version;
                std::mem::swap(&mut self.client_id, &mut other.client_id);
                std::mem::swap(&mut self.topic, &mut other.topic);
                self.req_msg_size = other.req_msg_size;
            }
            LogMessageType::Response => {
                self.resp_msg_size = other.resp_msg_size;
            }
            _ => {}
        }
        self.msg_type = LogMessageType::Session;
    }

    pub fn check(&self) -> bool {
        if self.api_key > API_KEY_MAX {
            return false;
        }
        !self.client_id.is_empty() && self.client_id.is_ascii()
    }

    pub fn api_name(&self) -> &'static str {
        match self.api_key {
            API_KEY_PRODUCE => "Produce",
            API_KEY_FETCH => "Fetch",
            2 => "ListOffsets",
            API_KEY_METADATA => "Metadata",
            8 => "OffsetCommit",
            9 => "OffsetFetch",
            18 => "ApiVersions",
            _ => "",
        }
    }
}

#[derive(Default)]
pub struct KafkaLog {}

impl L7ProtocolParserInterface for KafkaLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp || payload.len() < KAFKA_REQ_HEADER_LEN {
            return false;
        }
        let mut info = KafkaInfo::default();
        // strict length match to avoid misidentification
        if Self::request(payload, true, &mut info).is_err() {
            return false;
        }
        info.check()
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if param.l4_protocol != IpProtocol::Tcp {
            return Err(Error::InvalidIpProtocol);
        }
        let mut info = KafkaInfo::default();
        match param.direction {
            PacketDirection::ClientToServer => {
                if payload.len() < KAFKA_REQ_HEADER_LEN {
                    return Err(Error::IncompleteMessage(L7Protocol::Kafka));
                }
                let msg = PayloadMessage::new(payload);
                let msg_size = msg.read_u32(0).unwrap() as usize;
                if msg_size + 4 > payload.len() && !param.truncated {
                    return Err(Error::IncompleteMessage(L7Protocol::Kafka));
                }
                Self::request(payload, false, &mut info)?;
            }
            PacketDirection::ServerToClient => {
                if payload.len() < KAFKA_RESP_HEADER_LEN {
                    return Err(Error::IncompleteMessage(L7Protocol::Kafka));
                }
                Self::response(payload, &mut info)?;
            }
        }
        Ok(L7ParseResult::Single(L7ProtocolInfo::KafkaInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::Kafka
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }
}

impl KafkaLog {
    const MSG_LEN_SIZE: usize = 4;

    // Identification is strictly checked, log parsing is not because the
    // payload may be cut at the capture limit.
    fn request(payload: &[u8], strict: bool, info: &mut KafkaInfo) -> Result<()> {
        let msg = PayloadMessage::new(payload);
        info.req_msg_size = msg.read_u32(0).ok_or(Error::KafkaLogParseFailed)? as i32;
        let client_id_len = msg.read_u16(12).ok_or(Error::KafkaLogParseFailed)? as usize;
        if payload.len() < KAFKA_REQ_HEADER_LEN + client_id_len {
            return Err(Error::KafkaLogParseFailed);
        }

        if strict && info.req_msg_size as usize != payload.len() - Self::MSG_LEN_SIZE {
            return Err(Error::KafkaLogParseFailed);
        }

        info.msg_type = LogMessageType::Request;
        info.api_key = msg.read_u16(4).unwrap();
        info.api_version = msg.read_u16(6).unwrap();
        info.correlation_id = msg.read_u32(8).unwrap();
        info.client_id =
            String::from_utf8_lossy(&payload[14..14 + client_id_len]).into_owned();
        info.topic = Self::read_topic(&msg, 14 + client_id_len, info).unwrap_or_default();
        Ok(())
    }

    fn response(payload: &[u8], info: &mut KafkaInfo) -> Result<()> {
        let msg = PayloadMessage::new(payload);
        info.resp_msg_size = msg.read_u32(0).ok_or(Error::KafkaLogParseFailed)? as i32;
        info.correlation_id = msg.read_u32(4).ok_or(Error::KafkaLogParseFailed)?;
        info.msg_type = LogMessageType::Response;
        Ok(())
    }

    // Best effort topic name for the apis that lead with one. Flexible
    // (compact) encodings of the newest versions are not walked.
    fn read_topic(msg: &PayloadMessage, body: usize, info: &KafkaInfo) -> Option<String> {
        let topic_offset = match info.api_key {
            API_KEY_PRODUCE => {
                let mut offset = body;
                if info.api_version >= 3 {
                    // nullable transactional_id
                    let len = msg.read_u16(offset)? as i16;
                    offset += 2;
                    if len > 0 {
                        offset += len as usize;
                    }
                }
                // acks + timeout_ms + topic array count
                offset + 2 + 4 + 4
            }
            API_KEY_FETCH => {
                if info.api_version > 11 {
                    return None;
                }
                // replica_id + max_wait_ms + min_bytes
                let mut offset = body + 4 + 4 + 4;
                if info.api_version >= 3 {
                    offset += 4; // max_bytes
                }
                if info.api_version >= 4 {
                    offset += 1; // isolation_level
                }
                if info.api_version >= 7 {
                    offset += 8; // session_id + session_epoch
                }
                offset + 4 // topic array count
            }
            API_KEY_METADATA => {
                if info.api_version > 8 {
                    return None;
                }
                body + 4 // topic array count
            }
            _ => return None,
        };
        let (_, topic) = msg.read_length_prefixed_string(topic_offset, 2)?;
        if topic.is_empty() || !topic.is_ascii() {
            return None;
        }
        Some(String::from_utf8_lossy(topic).into_owned())
    }
}
