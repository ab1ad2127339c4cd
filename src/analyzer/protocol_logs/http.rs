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

use std::str;

use serde::Serialize;

use super::{value_is_default, AppProtoHead, L7ResponseStatus};
use super::consts::*;

use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};
use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::AttributeMap;

use public::l7_protocol::{L7Protocol, LogMessageType};

#[derive(Serialize, Debug, Default, Clone)]
pub struct HttpInfo {
    pub msg_type: LogMessageType,

    #[serde(skip_serializing_if = "value_is_default")]
    pub version: String,
    #[serde(rename = "request_type", skip_serializing_if = "value_is_default")]
    pub method: String,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub path: String,
    #[serde(rename = "request_domain", skip_serializing_if = "value_is_default")]
    pub host: String,
    #[serde(skip_serializing_if = "value_is_default")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "value_is_default")]
    pub content_type: String,
    #[serde(skip_serializing_if = "value_is_default")]
    pub trace_id: String,

    #[serde(rename = "response_code", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(rename = "response_status")]
    pub status: L7ResponseStatus,

    pub req_content_length: Option<u32>,
    pub resp_content_length: Option<u32>,
}

impl L7ProtocolInfoInterface for HttpInfo {
    fn session_id(&self) -> Option<u32> {
        None
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::HttpInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::Http1,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.status.is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        if !self.method.is_empty() {
            attrs.add_str("http.method", self.method.clone());
        }
        if !self.path.is_empty() {
            attrs.add_str("http.url", self.path.clone());
        }
        if let Some(code) = self.status_code {
            attrs.add_int("http.status_code", code as i64);
        }
        if !self.host.is_empty() {
            attrs.add_str("http.host", self.host.clone());
        }
        if !self.user_agent.is_empty() {
            attrs.add_str("http.user_agent", self.user_agent.clone());
        }
        if !self.content_type.is_empty() {
            attrs.add_str("http.content_type", self.content_type.clone());
        }
        if !self.trace_id.is_empty() {
            attrs.add_str("trace_id", self.trace_id.clone());
        }
    }
}

impl HttpInfo {
    pub fn merge(&mut self, other: &mut Self) {
        match other.msg_type {
            LogMessageType::Request => {
                std::mem::swap(&mut self.method, &mut other.method);
                std::mem::swap(&mut self.path, &mut other.path);
                std::mem::swap(&mut self.host, &mut other.host);
                std::mem::swap(&mut self.user_agent, &mut other.user_agent);
                self.req_content_length = other.req_content_length;
            }
            LogMessageType::Response => {
                self.status_code = other.status_code;
                self.status = other.status;
                self.resp_content_length = other.resp_content_length;
                if self.content_type.is_empty() {
                    std::mem::swap(&mut self.content_type, &mut other.content_type);
                }
            }
            _ => {}
        }
        if self.version.is_empty() {
            std::mem::swap(&mut self.version, &mut other.version);
        }
        if self.trace_id.is_empty() {
            std::mem::swap(&mut self.trace_id, &mut other.trace_id);
        }
        self.msg_type = LogMessageType::Session;
    }
}

#[derive(Default)]
pub struct HttpLog {
    info: HttpInfo,
}

impl L7ProtocolParserInterface for HttpLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp {
            return false;
        }
        match param.direction {
            PacketDirection::ClientToServer => has_req_method_prefix(payload),
            PacketDirection::ServerToClient => payload.starts_with(RESPONSE_PREFIX.as_bytes()),
        }
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if payload.is_empty() {
            return Err(Error::ZeroPayloadLen);
        }
        self.info = HttpInfo::default();
        self.parse_http_v1(payload, param)?;
        Ok(L7ParseResult::Single(L7ProtocolInfo::HttpInfo(
            self.info.clone(),
        )))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::Http1
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.info = HttpInfo::default();
    }
}

impl HttpLog {
    fn parse_http_v1(&mut self, payload: &[u8], param: &ParseParam) -> Result<()> {
        if !is_http_v1_payload(payload) {
            return Err(Error::HttpHeaderParseFailed);
        }
        // a message is parsable once the header block is complete, the body
        // may be cut at the capture limit
        if !headers_complete(payload) && !param.truncated {
            return Err(Error::IncompleteMessage(L7Protocol::Http1));
        }

        let mut headers = parse_v1_headers(payload);
        let Some(first_line) = headers.next() else {
            return Err(Error::HttpHeaderParseFailed);
        };

        if param.direction == PacketDirection::ServerToClient {
            // HTTP response line: HTTP/1.1 404 Not Found
            let (version, status_code) = get_http_resp_info(first_line)?;
            self.info.version = version.to_owned();
            self.info.status_code = Some(status_code as i32);
            self.info.msg_type = LogMessageType::Response;
            self.set_status(status_code);
        } else {
            // HTTP request line: GET /background.png HTTP/1.0
            let (method, path, version) = get_http_request_info(first_line)?;
            check_http_method(method)?;
            self.info.method = method.to_owned();
            self.info.path = path.to_owned();
            self.info.version = get_http_request_version(version)?.to_owned();
            self.info.msg_type = LogMessageType::Request;
        }

        let mut content_length: Option<u32> = None;
        for body_line in headers {
            let Some(col_index) = body_line.find(':') else {
                continue;
            };
            if col_index + 1 >= body_line.len() {
                continue;
            }

            let key = body_line[..col_index].to_ascii_lowercase();
            let value = body_line[col_index + 1..].trim();
            match key.as_str() {
                "content-length" => {
                    content_length = Some(value.parse::<u32>().unwrap_or_default());
                }
                "content-type" => self.info.content_type = value.to_owned(),
                "host" => self.info.host = value.to_owned(),
                "user-agent" => self.info.user_agent = value.to_owned(),
                TRACE_ID_B3 => self.info.trace_id = value.to_owned(),
                TRACE_ID_TRACEPARENT => {
                    // traceparent: 00-<trace-id>-<parent-id>-<flags>
                    let mut segs = value.split('-');
                    if let Some(id) = segs.nth(1) {
                        self.info.trace_id = id.to_owned();
                    }
                }
                _ => {}
            }
        }

        if param.direction == PacketDirection::ServerToClient {
            self.info.resp_content_length = content_length;
        } else {
            self.info.req_content_length = content_length;
        }
        Ok(())
    }

    fn set_status(&mut self, status_code: u16) {
        self.info.status = if status_code >= HTTP_STATUS_SERVER_ERROR_MIN {
            L7ResponseStatus::ServerError
        } else if status_code >= HTTP_STATUS_CLIENT_ERROR_MIN {
            L7ResponseStatus::ClientError
        } else {
            L7ResponseStatus::Ok
        };
    }
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];
const RESPONSE_PREFIX: &str = "HTTP/1.";

fn has_req_method_prefix(buf: &[u8]) -> bool {
    for m in HTTP_METHODS {
        if buf.len() > m.len() && buf.starts_with(m.as_bytes()) && buf[m.len()] == b' ' {
            return true;
        }
    }
    false
}

pub fn is_http_v1_payload(buf: &[u8]) -> bool {
    buf.starts_with(RESPONSE_PREFIX.as_bytes()) || has_req_method_prefix(buf)
}

fn headers_complete(payload: &[u8]) -> bool {
    payload.windows(4).any(|w| w == b"\r\n\r\n")
}

pub fn check_http_method(method: &str) -> Result<()> {
    if HTTP_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(Error::HttpHeaderParseFailed)
    }
}

pub fn get_http_request_version(version: &str) -> Result<&str> {
    // HTTPv1 only has 1.0 and 1.1
    match version {
        HTTP_V1_0_VERSION => Ok("1.0"),
        HTTP_V1_1_VERSION => Ok("1.1"),
        _ => Err(Error::HttpHeaderParseFailed),
    }
}

pub fn get_http_request_info(line_info: &str) -> Result<(&str, &str, &str)> {
    let mut iter = line_info.split(' ');
    let method = iter.next();
    let path = iter.next();
    let version = iter.next();
    match (method, path, version) {
        (Some(m), Some(p), Some(v)) => Ok((m, p, v)),
        _ => Err(Error::HttpHeaderParseFailed),
    }
}

pub fn get_http_resp_info(line_info: &str) -> Result<(&str, u16)> {
    const VERSION_LEN: usize = HTTP_V1_0_VERSION.len();
    const CODE_OFFSET: usize = VERSION_LEN + 1;
    const CODE_LEN: usize = 3;
    if line_info.len() < HTTP_RESP_MIN_LEN || !line_info.is_ascii() {
        return Err(Error::HttpHeaderParseFailed);
    }
    let version = match &line_info[..VERSION_LEN] {
        HTTP_V1_0_VERSION => "1.0",
        HTTP_V1_1_VERSION => "1.1",
        _ => return Err(Error::HttpHeaderParseFailed),
    };

    let Ok(status_code) = line_info[CODE_OFFSET..CODE_OFFSET + CODE_LEN].parse::<u16>() else {
        return Err(Error::HttpHeaderParseFailed);
    };
    if !(HTTP_STATUS_CODE_MIN..=HTTP_STATUS_CODE_MAX).contains(&status_code) {
        return Err(Error::HttpHeaderParseFailed);
    }
    Ok((version, status_code))
}

pub struct V1HeaderIterator<'a>(&'a [u8]);

impl<'a> Iterator for V1HeaderIterator<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.len() < 2 {
            return None;
        }
        let mut end = 0;
        loop {
            if end + 2 > self.0.len() {
                // no separator left, drop the cut tail
                return None;
            }
            match self.0[end] {
                b'\r' if self.0[end + 1] == b'\n' => break,
                c if !c.is_ascii() => return None,
                _ => end += 1,
            }
        }
        if end == 0 {
            None
        } else {
            // safe because all bytes up to end are checked to be ascii
            let result = unsafe { str::from_utf8_unchecked(&self.0[..end]) };
            self.0 = &self.0[end + 2..];
            Some(result)
        }
    }
}

pub fn parse_v1_headers(payload: &[u8]) -> V1HeaderIterator<'_> {
    V1HeaderIterator(payload)
}
