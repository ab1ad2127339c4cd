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
use crate::analyzer::payload::AttributeMap;
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::bytes::{read_u32_be, read_u64_be};
use public::l7_protocol::{L7Protocol, LogMessageType};

#[derive(Serialize, Debug, Default, Clone)]
pub struct DubboInfo {
    pub msg_type: LogMessageType,

    // header
    #[serde(skip)]
    pub event: u8,
    #[serde(skip)]
    pub serial_id: u8,
    #[serde(rename = "request_id")]
    pub request_id: i64,

    // request
    #[serde(rename = "version", skip_serializing_if = "value_is_default")]
    pub dubbo_version: String,
    #[serde(rename = "request_domain", skip_serializing_if = "value_is_default")]
    pub service_name: String,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub method_name: String,

    // response
    #[serde(rename = "response_code", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(rename = "response_status")]
    pub resp_status: L7ResponseStatus,
}

impl L7ProtocolInfoInterface for DubboInfo {
    fn session_id(&self) -> Option<u32> {
        Some(self.request_id as u32)
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::DubboInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::Dubbo,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.resp_status.is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        if !self.service_name.is_empty() {
            attrs.add_str("dubbo.service", self.service_name.clone());
        }
        if !self.method_name.is_empty() {
            attrs.add_str("dubbo.method", self.method_name.clone());
        }
        attrs.add_int("dubbo.request_id", self.request_id);
        if let Some(code) = self.status_code {
            attrs.add_int("dubbo.error_code", code as i64);
        }
    }
}

impl DubboInfo {
    pub fn merge(&mut self, other: &mut Self) {
        if other.serial_id > 0 && self.serial_id == 0 {
            self.serial_id = other.serial_id;
        }
        if self.dubbo_version.is_empty() {
            std::mem::swap(&mut self.dubbo_version, &mut other.dubbo_version);
        }
        if self.service_name.is_empty() {
            std::mem::swap(&mut self.service_name, &mut other.service_name);
        }
        if self.method_name.is_empty() {
            std::mem::swap(&mut self.method_name, &mut other.method_name);
        }
        if other.status_code.is_some() {
            self.status_code = other.status_code;
            self.resp_status = other.resp_status;
        }
        self.msg_type = LogMessageType::Session;
    }
}

/*
  Dubbo wire frame
  +------------------------------------------------------------------------------------------------------------+
  | magic (16) | request and serialization flag (8) | response status (8) | request id (64) | body length (32) |
  +------------------------------------------------------------------------------------------------------------+
*/
#[derive(Debug, Default, PartialEq)]
pub struct DubboHeader {
    pub event: u8,
    pub serial_id: u8,
    pub is_request: bool,
    pub is_two_way: bool,
    pub status_code: u8,
    pub data_length: i32,
    pub request_id: i64,
}

impl DubboHeader {
    pub fn parse_headers(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < DUBBO_HEADER_LEN {
            return Err(Error::DubboHeaderParseFailed);
        }
        if payload[0] != DUBBO_MAGIC_HIGH || payload[1] != DUBBO_MAGIC_LOW {
            return Err(Error::DubboHeaderParseFailed);
        }

        self.is_request = payload[2] & 0x80 != 0;
        self.is_two_way = payload[2] & 0x40 != 0;
        self.event = (payload[2] & 0x20) >> 5;
        self.serial_id = payload[2] & 0x1f;
        self.status_code = payload[3];
        self.request_id = read_u64_be(&payload[4..]) as i64;
        self.data_length = read_u32_be(&payload[12..]) as i32;
        Ok(())
    }

    pub fn check(&self) -> bool {
        // responses are not used for identification, and a request always
        // carries a zero status
        self.is_request && self.status_code == 0
    }
}

// The two serializations decoded at the attribute layer. Everything else
// yields header attributes only.
#[derive(Clone, Copy, Debug, PartialEq)]
enum DubboSerializer {
    Hessian2,
    Fastjson,
}

impl DubboSerializer {
    fn get(serial_id: u8) -> Option<Self> {
        match serial_id {
            SERIAL_ID_HESSIAN2 => Some(DubboSerializer::Hessian2),
            SERIAL_ID_FASTJSON => Some(DubboSerializer::Fastjson),
            _ => None,
        }
    }

    // skip one string, returning the offset after it
    fn eat_string(&self, data: &[u8], offset: usize) -> usize {
        match self {
            DubboSerializer::Hessian2 => {
                if offset >= data.len() {
                    return data.len();
                }
                let tag = data[offset];
                if (BC_STRING_SHORT..=BC_STRING_SHORT_MAX).contains(&tag) {
                    if offset + 1 >= data.len() {
                        return data.len();
                    }
                    offset + 2 + (((tag - BC_STRING_SHORT) as usize) << 8) + data[offset + 1] as usize
                } else {
                    offset + 1 + tag as usize
                }
            }
            DubboSerializer::Fastjson => {
                // "xxx"\n
                for i in offset + 1..data.len() {
                    if data[i] == JSON_NEXT_LINE {
                        return i + 1;
                    }
                }
                data.len()
            }
        }
    }

    // read one string, returning (offset after it, value)
    fn get_string_value(&self, data: &[u8], offset: usize) -> (usize, String) {
        match self {
            DubboSerializer::Hessian2 => {
                if offset >= data.len() {
                    return (data.len(), String::new());
                }
                let tag = data[offset];
                let (skip, length) = if (BC_STRING_SHORT..=BC_STRING_SHORT_MAX).contains(&tag) {
                    if offset + 1 >= data.len() {
                        return (data.len(), String::new());
                    }
                    (
                        2,
                        (((tag - BC_STRING_SHORT) as usize) << 8) + data[offset + 1] as usize,
                    )
                } else {
                    (1, tag as usize)
                };
                let start = offset + skip;
                if start + length >= data.len() {
                    return (
                        data.len(),
                        String::from_utf8_lossy(&data[data.len().min(start)..]).into_owned(),
                    );
                }
                (
                    start + length,
                    String::from_utf8_lossy(&data[start..start + length]).into_owned(),
                )
            }
            DubboSerializer::Fastjson => {
                /*
                    "xxx"\n
                    |    |
                   off   i
                */
                if offset >= data.len() {
                    return (data.len(), String::new());
                }
                for i in offset + 1..data.len() {
                    if data[i] == JSON_NEXT_LINE {
                        if i >= 2 && i - 1 > offset + 1 {
                            return (
                                i + 1,
                                String::from_utf8_lossy(&data[offset + 1..i - 1]).into_owned(),
                            );
                        }
                        return (i + 1, String::new());
                    }
                }
                (data.len(), String::new())
            }
        }
    }

    // scan for a key and return the string value following it. The fastjson
    // scan pairs plain quotes without escape handling, embedded escaped
    // quotes are not recognized.
    fn get_string_value_by_key(&self, data: &[u8], from: usize, key: &str) -> String {
        match self {
            DubboSerializer::Hessian2 => {
                let key_len = key.len();
                let first = key.as_bytes()[0];
                for i in from..data.len() {
                    if data[i] != first {
                        continue;
                    }
                    if i + key_len >= data.len() {
                        return String::new();
                    }
                    if &data[i..i + key_len] == key.as_bytes() {
                        let (_, value) = self.get_string_value(data, i + key_len);
                        return value;
                    }
                }
                String::new()
            }
            DubboSerializer::Fastjson => {
                /*
                  "keyxxxxxxxx":"value"
                  |           |
                  quote_left  i
                */
                let key_len = key.len();
                let mut quote_left = 0;
                let mut i = from;
                while i < data.len() {
                    if data[i] == JSON_QUOTES {
                        if quote_left == 0 {
                            quote_left = i;
                        } else if i + 2 < data.len()
                            && data[i + 1] == JSON_COLON
                            && data[i + 2] == JSON_QUOTES
                        {
                            if i - quote_left - 1 == key_len
                                && &data[quote_left + 1..i] == key.as_bytes()
                            {
                                return self.next_quoted_string(data, i + 2);
                            }
                            quote_left = 0;
                        } else {
                            quote_left = 0;
                        }
                    }
                    i += 1;
                }
                String::new()
            }
        }
    }

    fn next_quoted_string(&self, data: &[u8], offset: usize) -> String {
        if offset >= data.len() {
            return String::new();
        }
        for i in offset + 1..data.len() {
            if data[i] == JSON_QUOTES {
                return String::from_utf8_lossy(&data[offset + 1..i]).into_owned();
            }
        }
        // not enough bytes for the closing quote, skip it
        String::new()
    }
}

#[derive(Default)]
pub struct DubboLog {}

impl L7ProtocolParserInterface for DubboLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp {
            return false;
        }
        let mut header = DubboHeader::default();
        if header.parse_headers(payload).is_err() {
            return false;
        }
        header.check()
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if param.l4_protocol != IpProtocol::Tcp {
            return Err(Error::InvalidIpProtocol);
        }

        let mut header = DubboHeader::default();
        header.parse_headers(payload)?;
        if DUBBO_HEADER_LEN + header.data_length.max(0) as usize > payload.len()
            && !param.truncated
        {
            return Err(Error::IncompleteMessage(L7Protocol::Dubbo));
        }
        // heartbeat events carry no call information
        if header.event != 0 {
            return Ok(L7ParseResult::None);
        }

        let mut info = DubboInfo::default();
        match param.direction {
            PacketDirection::ClientToServer => self.request(payload, &header, &mut info),
            PacketDirection::ServerToClient => self.response(&header, &mut info),
        }
        Ok(L7ParseResult::Single(L7ProtocolInfo::DubboInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::Dubbo
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }
}

impl DubboLog {
    // best effort walk of the request body parameters:
    // dubbo version, service name, service version, method name
    fn decode_body(serializer: DubboSerializer, body: &[u8], info: &mut DubboInfo) {
        let (offset, version) = serializer.get_string_value(body, 0);
        info.dubbo_version = version;
        let (offset, service) = serializer.get_string_value(body, offset);
        info.service_name = service;
        // the service version is not recorded
        let offset = serializer.eat_string(body, offset);
        let (_, method) = serializer.get_string_value(body, offset);
        info.method_name = method;

        if info.service_name.is_empty() {
            // some clients put the call target in an attachment map only
            info.service_name = serializer.get_string_value_by_key(body, 0, "path");
        }
    }

    fn request(&mut self, payload: &[u8], header: &DubboHeader, info: &mut DubboInfo) {
        info.msg_type = LogMessageType::Request;
        info.event = header.event;
        info.serial_id = header.serial_id;
        info.request_id = header.request_id;

        if let Some(serializer) = DubboSerializer::get(header.serial_id) {
            let body = &payload[DUBBO_HEADER_LEN.min(payload.len())..];
            Self::decode_body(serializer, body, info);
        }
    }

    fn set_status(&mut self, status_code: u8, info: &mut DubboInfo) {
        info.resp_status = match status_code {
            20 => L7ResponseStatus::Ok,
            30 | 40 | 90 => L7ResponseStatus::ClientError,
            31 | 50 | 60 | 70 | 80 | 100 => L7ResponseStatus::ServerError,
            _ => L7ResponseStatus::Ok,
        }
    }

    fn response(&mut self, header: &DubboHeader, info: &mut DubboInfo) {
        info.msg_type = LogMessageType::Response;
        info.event = header.event;
        info.serial_id = header.serial_id;
        info.request_id = header.request_id;
        info.status_code = Some(header.status_code as i32);
        self.set_status(header.status_code, info);
    }
}
