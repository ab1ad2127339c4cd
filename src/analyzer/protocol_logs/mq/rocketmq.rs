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

use serde::Serialize;

use super::super::consts::*;
use super::super::{value_is_default, AppProtoHead, L7ResponseStatus};

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::{AttributeMap, PayloadMessage};
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::l7_protocol::{L7Protocol, LogMessageType};

// flag bit 0 marks a response, bit 1 a oneway call
const FLAG_RESPONSE: i64 = 1;

#[derive(Serialize, Debug, Default, Clone)]
pub struct RocketmqInfo {
    pub msg_type: LogMessageType,

    #[serde(rename = "request_id")]
    pub opaque: u32,
    #[serde(rename = "request_type")]
    pub code: i32,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub topic: String,
    #[serde(skip_serializing_if = "value_is_default")]
    pub language: String,

    #[serde(rename = "response_status")]
    pub resp_status: L7ResponseStatus,
}

impl L7ProtocolInfoInterface for RocketmqInfo {
    fn session_id(&self) -> Option<u32> {
        Some(self.opaque)
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::RocketmqInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::RocketMQ,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.resp_status.is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        attrs.add_int("rocketmq.code", self.code as i64);
        let name = self.get_request_code_str();
        if !name.is_empty() {
            attrs.add_str("rocketmq.request", name);
        }
        attrs.add_int("rocketmq.opaque", self.opaque as i64);
        if !self.topic.is_empty() {
            attrs.add_str("rocketmq.topic", self.topic.clone());
        }
        if !self.language.is_empty() {
            attrs.add_str("rocketmq.language", self.language.clone());
        }
    }
}

impl RocketmqInfo {
    pub fn merge(&mut self, other: &mut Self) {
        match other.msg_type {
            LogMessageType::Request => {
                self.code = other.code;
                std::mem::swap(&mut self.topic, &mut other.topic);
                std::mem::swap(&mut self.language, &mut other.language);
            }
            LogMessageType::Response => {
                self.resp_status = other.resp_status;
            }
            _ => {}
        }
        self.msg_type = LogMessageType::Session;
    }

    pub fn get_request_code_str(&self) -> &'static str {
        match (self.msg_type, self.code) {
            (LogMessageType::Response, _) => "",
            (_, 10) => "SEND_MESSAGE",
            (_, 11) => "PULL_MESSAGE",
            (_, 12) => "QUERY_MESSAGE",
            (_, 34) => "HEART_BEAT",
            (_, 105) => "GET_ROUTEINFO_BY_TOPIC",
            (_, 310) => "SEND_BATCH_MESSAGE",
            _ => "",
        }
    }
}

/*
  RocketMQ remoting frame
  +--------------+----------------------------------+-------------+------+
  | length (32)  | serialize type (8) | header (24) | header data | body |
  +--------------+----------------------------------+-------------+------+
*/
#[derive(Debug, Default)]
struct RocketmqHeader {
    length: i32,
    header_length: i32,
    serialize_type: u8,

    code: i32,
    opaque: i64,
    flag: i64,
    language: String,
    topic: String,
}

impl RocketmqHeader {
    fn parse(payload: &[u8]) -> Result<Self> {
        let msg = PayloadMessage::new(payload);
        if payload.len() < ROCKETMQ_MIN_FRAME_LEN {
            return Err(Error::IncompleteMessage(L7Protocol::RocketMQ));
        }
        let mut header = RocketmqHeader::default();
        header.length = msg.read_u32(0).unwrap() as i32;
        if header.length <= 4 || header.length > ROCKETMQ_MAX_FRAME_LEN {
            return Err(Error::RocketmqLogParseFailed);
        }
        let origin_header_length = msg.read_u32(4).unwrap() as i32;
        header.header_length = origin_header_length & 0xffffff;
        header.serialize_type = ((origin_header_length >> 24) & 0xff) as u8;
        if header.header_length <= 0 || header.header_length > header.length - 4 {
            return Err(Error::RocketmqLogParseFailed);
        }

        let Some((_, header_data)) = msg.read_bytes(8, header.header_length as usize) else {
            return Err(Error::IncompleteMessage(L7Protocol::RocketMQ));
        };
        match header.serialize_type {
            ROCKETMQ_SERIALIZE_JSON => header.parse_json(header_data)?,
            ROCKETMQ_SERIALIZE_ROCKETMQ => header.parse_rocketmq(header_data)?,
            _ => return Err(Error::RocketmqLogParseFailed),
        }
        Ok(header)
    }

    // {"code":0,"flag":1,"language":"JAVA","opaque":1,...,"extFields":{"topic":"x"}}
    fn parse_json(&mut self, data: &[u8]) -> Result<()> {
        if data.first() != Some(&b'{') {
            return Err(Error::RocketmqLogParseFailed);
        }
        self.code = json_int_value(data, "code").ok_or(Error::RocketmqLogParseFailed)? as i32;
        self.opaque = json_int_value(data, "opaque").ok_or(Error::RocketmqLogParseFailed)?;
        self.flag = json_int_value(data, "flag").unwrap_or_default();
        self.language = json_str_value(data, "language").unwrap_or_default();
        self.topic = json_str_value(data, "topic").unwrap_or_default();
        Ok(())
    }

    // code(2B) language(1B) version(2B) opaque(4B) flag(4B) remark extFields
    fn parse_rocketmq(&mut self, data: &[u8]) -> Result<()> {
        if (data.len() as i32) < ROCKETMQ_TYPE_MIN_HEADER_LEN {
            return Err(Error::RocketmqLogParseFailed);
        }
        let msg = PayloadMessage::new(data);
        self.code = msg.read_u16(0).unwrap() as i32;
        self.language = language_code_str(data[2]).to_owned();
        self.opaque = msg.read_u32(5).unwrap() as i64;
        self.flag = msg.read_u32(9).unwrap() as i64;

        // remark, then the extFields key/value pairs where topic may appear
        let mut offset = 13;
        if let Some(remark_len) = msg.read_u32(offset) {
            offset = offset + 4 + remark_len as usize;
            if let Some(ext_len) = msg.read_u32(offset) {
                let end = (offset + 4 + ext_len as usize).min(data.len());
                offset += 4;
                while offset < end {
                    let Some((next, key)) = msg.read_length_prefixed_string(offset, 2) else {
                        break;
                    };
                    let Some((next, val)) = msg.read_length_prefixed_string(next, 4) else {
                        break;
                    };
                    if key == b"topic" {
                        self.topic = String::from_utf8_lossy(val).into_owned();
                        break;
                    }
                    offset = next;
                }
            }
        }
        Ok(())
    }

    fn is_response(&self) -> bool {
        self.flag & FLAG_RESPONSE != 0
    }
}

fn language_code_str(code: u8) -> &'static str {
    match code {
        0 => "JAVA",
        1 => "CPP",
        2 => "DOTNET",
        3 => "PYTHON",
        4 => "DELPHI",
        5 => "ERLANG",
        6 => "RUBY",
        7 => "OTHER",
        8 => "HTTP",
        9 => "GO",
        10 => "PHP",
        _ => "",
    }
}

fn json_int_value(data: &[u8], key: &str) -> Option<i64> {
    let pattern = format!("\"{}\":", key);
    let pos = data
        .windows(pattern.len())
        .position(|w| w == pattern.as_bytes())?;
    let rest = &data[pos + pattern.len()..];
    let end = rest
        .iter()
        .position(|b| !b.is_ascii_digit() && *b != b'-')
        .unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}

fn json_str_value(data: &[u8], key: &str) -> Option<String> {
    let pattern = format!("\"{}\":\"", key);
    let pos = data
        .windows(pattern.len())
        .position(|w| w == pattern.as_bytes())?;
    let rest = &data[pos + pattern.len()..];
    let end = rest.iter().position(|b| *b == b'"')?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

#[derive(Default)]
pub struct RocketmqLog {}

impl L7ProtocolParserInterface for RocketmqLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp || payload.len() < ROCKETMQ_MIN_FRAME_LEN {
            return false;
        }
        // identify on requests only
        match RocketmqHeader::parse(payload) {
            Ok(header) => !header.is_response(),
            Err(_) => false,
        }
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if param.l4_protocol != IpProtocol::Tcp {
            return Err(Error::InvalidIpProtocol);
        }
        if payload.len() < ROCKETMQ_MIN_FRAME_LEN {
            return Err(Error::IncompleteMessage(L7Protocol::RocketMQ));
        }
        let msg = PayloadMessage::new(payload);
        let length = msg.read_u32(0).unwrap() as usize;
        if length + 4 > payload.len() && !param.truncated {
            return Err(Error::IncompleteMessage(L7Protocol::RocketMQ));
        }

        let header = RocketmqHeader::parse(payload)?;
        let mut info = RocketmqInfo {
            opaque: header.opaque as u32,
            code: header.code,
            topic: header.topic.clone(),
            language: header.language.clone(),
            ..Default::default()
        };
        match param.direction {
            PacketDirection::ClientToServer => {
                info.msg_type = LogMessageType::Request;
            }
            PacketDirection::ServerToClient => {
                info.msg_type = LogMessageType::Response;
                // response code 0 is success
                info.resp_status = if header.code == 0 {
                    L7ResponseStatus::Ok
                } else {
                    L7ResponseStatus::ServerError
                };
            }
        }
        Ok(L7ParseResult::Single(L7ProtocolInfo::RocketmqInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::RocketMQ
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_frame(header: &str, body: &[u8]) -> Vec<u8> {
        let length = 4 + header.len() + body.len();
        let mut p = Vec::from((length as u32).to_be_bytes());
        p.extend_from_slice(&(header.len() as u32).to_be_bytes());
        p.extend_from_slice(header.as_bytes());
        p.extend_from_slice(body);
        p
    }

    fn req_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ClientToServer, 9876)
    }

    fn resp_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ServerToClient, 9876)
    }

    #[test]
    fn parse_json_request() {
        let header = r#"{"code":10,"extFields":{"topic":"orders"},"flag":0,"language":"JAVA","opaque":33,"version":401}"#;
        let payload = json_frame(header, b"hello");
        let mut log = RocketmqLog::default();
        assert!(log.check_payload(&payload, &req_param()));
        let info = log
            .parse_payload(&payload, &req_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RocketmqInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.code, 10);
        assert_eq!(info.opaque, 33);
        assert_eq!(info.topic, "orders");
        assert_eq!(info.language, "JAVA");
        assert_eq!(info.get_request_code_str(), "SEND_MESSAGE");
    }

    #[test]
    fn parse_json_response_code() {
        let header = r#"{"code":1,"flag":1,"language":"JAVA","opaque":33}"#;
        let payload = json_frame(header, b"");
        let mut log = RocketmqLog::default();
        // responses are not used for identification
        assert!(!log.check_payload(&payload, &resp_param()));
        let info = log
            .parse_payload(&payload, &resp_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RocketmqInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.opaque, 33);
        assert!(info.is_error());
    }

    #[test]
    fn parse_rocketmq_type_header() {
        // code=10 language=JAVA(0) version=0 opaque=5 flag=0, empty remark,
        // extFields with topic
        let mut header = vec![];
        header.extend_from_slice(&10u16.to_be_bytes());
        header.push(0);
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&5u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes()); // remark len
        let mut ext = vec![];
        ext.extend_from_slice(&5u16.to_be_bytes());
        ext.extend_from_slice(b"topic");
        ext.extend_from_slice(&6u32.to_be_bytes());
        ext.extend_from_slice(b"orders");
        header.extend_from_slice(&(ext.len() as u32).to_be_bytes());
        header.extend_from_slice(&ext);

        let length = 4 + header.len();
        let mut payload = Vec::from((length as u32).to_be_bytes());
        let origin = (ROCKETMQ_SERIALIZE_ROCKETMQ as u32) << 24 | header.len() as u32;
        payload.extend_from_slice(&origin.to_be_bytes());
        payload.extend_from_slice(&header);

        let mut log = RocketmqLog::default();
        let info = log
            .parse_payload(&payload, &req_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RocketmqInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.code, 10);
        assert_eq!(info.opaque, 5);
        assert_eq!(info.topic, "orders");
        assert_eq!(info.language, "JAVA");
    }

    #[test]
    fn split_frame_needs_more_bytes() {
        let header = r#"{"code":10,"flag":0,"language":"JAVA","opaque":33}"#;
        let payload = json_frame(header, b"body");
        let mut log = RocketmqLog::default();
        let err = log
            .parse_payload(&payload[..12], &req_param())
            .unwrap_err();
        assert!(err.is_incomplete());
    }
}
