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

use std::{fmt, str};

use serde::{Serialize, Serializer};

use super::super::{AppProtoHead, L7ResponseStatus};

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::AttributeMap;
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::l7_protocol::{L7Protocol, LogMessageType};

const SEPARATOR_SIZE: usize = 2;
const STATUS_REPLY_LIMIT: usize = 32;
const ERROR_REPLY_LIMIT: usize = 256;

#[derive(Serialize, Debug, Default, Clone)]
pub struct RedisInfo {
    pub msg_type: LogMessageType,

    // full command with arguments, e.g. "SET key value"
    #[serde(rename = "request_resource", serialize_with = "vec_u8_to_string")]
    pub request: Vec<u8>,
    // command only, e.g. "SET"
    #[serde(rename = "request_type", serialize_with = "vec_u8_to_string")]
    pub command: Vec<u8>,
    #[serde(serialize_with = "vec_u8_to_string")]
    pub key: Vec<u8>,
    // '+' status reply
    #[serde(skip)]
    pub status: Vec<u8>,
    // '-' error reply
    #[serde(rename = "response_exception", serialize_with = "vec_u8_to_string")]
    pub error: Vec<u8>,
    #[serde(rename = "response_status")]
    pub resp_status: L7ResponseStatus,
}

pub fn vec_u8_to_string<S>(v: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(v))
}

impl L7ProtocolInfoInterface for RedisInfo {
    fn session_id(&self) -> Option<u32> {
        None
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::RedisInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::Redis,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.resp_status.is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        if !self.command.is_empty() {
            attrs.add_str("redis.command", String::from_utf8_lossy(&self.command));
        }
        if !self.key.is_empty() {
            attrs.add_str("redis.key", String::from_utf8_lossy(&self.key));
        }
        if !self.error.is_empty() {
            attrs.add_str("redis.error", String::from_utf8_lossy(&self.error));
        }
    }
}

impl RedisInfo {
    pub fn merge(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.status, &mut other.status);
        std::mem::swap(&mut self.error, &mut other.error);
        self.resp_status = other.resp_status;
        self.msg_type = LogMessageType::Session;
    }
}

impl fmt::Display for RedisInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RedisInfo {{ request: {:?}, command: {:?}, error: {:?} }}",
            str::from_utf8(&self.request).unwrap_or_default(),
            str::from_utf8(&self.command).unwrap_or_default(),
            str::from_utf8(&self.error).unwrap_or_default()
        )
    }
}

#[derive(Default)]
pub struct RedisLog {}

impl L7ProtocolParserInterface for RedisLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp || payload.is_empty() {
            return false;
        }
        match param.direction {
            // commands are always arrays of bulk strings
            PacketDirection::ClientToServer => {
                payload[0] == b'*' && payload.len() > 1 && payload[1].is_ascii_digit()
            }
            PacketDirection::ServerToClient => {
                matches!(payload[0], b'+' | b'-' | b':' | b'$' | b'*')
            }
        }
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if param.l4_protocol != IpProtocol::Tcp {
            return Err(Error::InvalidIpProtocol);
        }
        if payload.is_empty() {
            return Err(Error::ZeroPayloadLen);
        }
        let mut info = RedisInfo::default();
        match param.direction {
            PacketDirection::ClientToServer => {
                if payload[0] != b'*' {
                    return Err(Error::RedisLogParseFailed);
                }
                let (context, _, _) = decode(payload, true)?;
                self.fill_request(context, &mut info);
            }
            PacketDirection::ServerToClient => {
                let (context, _, is_error) = decode(payload, false)?;
                self.fill_response(context, is_error, &mut info);
            }
        }
        Ok(L7ParseResult::Single(L7ProtocolInfo::RedisInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::Redis
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }
}

impl RedisLog {
    fn fill_request(&mut self, context: Vec<u8>, info: &mut RedisInfo) {
        let mut words = context.split(|&b| b == b' ');
        info.command = words.next().map(Vec::from).unwrap_or_default();
        info.key = words.next().map(Vec::from).unwrap_or_default();
        info.msg_type = LogMessageType::Request;
        info.request = context;
    }

    fn fill_response(&mut self, context: Vec<u8>, error_response: bool, info: &mut RedisInfo) {
        info.msg_type = LogMessageType::Response;
        if context.is_empty() {
            info.resp_status = L7ResponseStatus::Ok;
            return;
        }

        info.resp_status = L7ResponseStatus::Ok;
        if error_response {
            info.error = context;
            info.resp_status = L7ResponseStatus::ServerError;
        } else {
            info.status = context;
        }
    }
}

// RESP: https://redis.io/docs/reference/protocol-spec/
fn find_separator(payload: &[u8]) -> Option<usize> {
    payload.windows(2).position(|w| w == b"\r\n")
}

fn decode_integer(payload: &[u8]) -> Result<(isize, usize)> {
    let separator_pos =
        find_separator(payload).ok_or(Error::IncompleteMessage(L7Protocol::Redis))?;
    if separator_pos < 1 {
        return Err(Error::RedisLogParseFailed);
    }

    let integer = str::from_utf8(&payload[..separator_pos])
        .unwrap_or_default()
        .parse::<isize>()
        .map_err(|_| Error::RedisLogParseFailed)?;

    Ok((integer, separator_pos + SEPARATOR_SIZE))
}

// bulk string, e.g. "$3\r\nSET\r\n"
fn decode_bulk(payload: &[u8], strict: bool) -> Result<(Vec<u8>, usize)> {
    let offset = 1; // leading '$'
    let (length, sub_offset) = decode_integer(&payload[offset..])?;

    // "$-1\r\n" null and "$0\r\n\r\n" empty replies
    if length <= 0 {
        return Ok((
            payload[offset..offset + sub_offset - SEPARATOR_SIZE].to_vec(),
            offset + sub_offset,
        ));
    }

    let offset = offset + sub_offset;
    let length = length as usize;

    if offset + length + SEPARATOR_SIZE > payload.len()
        || payload[offset + length] != b'\r'
        || payload[offset + length + 1] != b'\n'
    {
        if strict {
            return Err(Error::IncompleteMessage(L7Protocol::Redis));
        }
        return Ok((payload[offset..].to_vec(), payload.len()));
    }

    Ok((
        payload[offset..offset + length].to_vec(),
        offset + length + SEPARATOR_SIZE,
    ))
}

// "set mykey myvalue" goes on the wire as
// "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n"
fn decode_asterisk(payload: &[u8], strict: bool) -> Result<(Vec<u8>, usize)> {
    let mut offset = 1; // leading '*'
    let (element_count, sub_offset) = decode_integer(&payload[offset..])?;

    // "*-1\r\n" null and "*0\r\n" empty arrays
    if element_count <= 0 {
        return Ok((
            payload[offset..offset + sub_offset - SEPARATOR_SIZE].to_vec(),
            offset + sub_offset,
        ));
    }
    offset += sub_offset;

    let mut context = Vec::new();
    let len = payload.len();

    for _ in 0..element_count {
        if offset >= len {
            if strict {
                return Err(Error::IncompleteMessage(L7Protocol::Redis));
            }
            return Ok((context, len));
        }
        let (element, sub_offset, _) = decode(&payload[offset..], strict)?;
        if !context.is_empty() {
            context.push(b' ');
        }
        context.extend_from_slice(&element);
        offset += sub_offset;
    }
    Ok((context, offset))
}

fn decode_ascii_str(payload: &[u8], limit: usize) -> Result<(Vec<u8>, usize)> {
    let len = payload.len();
    let separator_pos = find_separator(payload).unwrap_or(len);

    let (context, length) = if separator_pos > limit {
        // cut without an ellipsis marker
        (&payload[..limit], limit)
    } else {
        (&payload[..separator_pos], separator_pos)
    };

    if !context.is_ascii() {
        return Err(Error::RedisLogParseFailed);
    }

    Ok((context.to_vec(), length))
}

// returns (content, consumed, is_error_reply). "$-1" and "-1" both decode
// to "-1", the flag tells error replies apart.
pub fn decode(payload: &[u8], strict: bool) -> Result<(Vec<u8>, usize, bool)> {
    if payload.len() < SEPARATOR_SIZE {
        return Err(Error::IncompleteMessage(L7Protocol::Redis));
    }

    match payload[0] {
        // command request or nested array reply
        b'*' => decode_asterisk(payload, strict).map(|(v, s)| (v, s, false)),
        // status and integer replies
        b'+' | b':' => {
            decode_ascii_str(&payload[1..], STATUS_REPLY_LIMIT).map(|(v, s)| (v, s + 1, false))
        }
        // error reply
        b'-' => decode_ascii_str(&payload[1..], ERROR_REPLY_LIMIT).map(|(v, s)| (v, s + 1, true)),
        // bulk reply
        b'$' => decode_bulk(payload, strict).map(|(v, s)| (v, s, false)),
        _ => Err(Error::RedisLogParseFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ClientToServer, 6379)
    }

    fn resp_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ServerToClient, 6379)
    }

    #[test]
    fn decode_set_command() {
        let payload = b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n";
        let (context, n, e) = decode(payload, true).unwrap();
        assert_eq!(context, b"SET mykey myvalue".to_vec());
        assert_eq!(n, payload.len());
        assert!(!e);
    }

    #[test]
    fn parse_request_command_and_key() {
        let mut log = RedisLog::default();
        let payload = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n";
        let info = log
            .parse_payload(payload, &req_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RedisInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.command, b"SET".to_vec());
        assert_eq!(info.key, b"a".to_vec());
        assert_eq!(info.request, b"SET a b".to_vec());
    }

    #[test]
    fn split_request_needs_more_bytes() {
        let mut log = RedisLog::default();
        let payload = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n";
        for cut in [3, 9, 17] {
            let err = log.parse_payload(&payload[..cut], &req_param()).unwrap_err();
            assert!(err.is_incomplete(), "cut at {} should be incomplete", cut);
        }
    }

    #[test]
    fn parse_error_reply() {
        let mut log = RedisLog::default();
        let payload = b"-ERR unknown command 'foo'\r\n";
        let info = log
            .parse_payload(payload, &resp_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RedisInfo(info) = info else {
            unreachable!()
        };
        assert!(info.is_error());
        assert_eq!(info.error, b"ERR unknown command 'foo'".to_vec());
    }

    #[test]
    fn parse_status_reply() {
        let mut log = RedisLog::default();
        let payload = b"+OK\r\n";
        let info = log
            .parse_payload(payload, &resp_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::RedisInfo(info) = info else {
            unreachable!()
        };
        assert!(!info.is_error());
        assert_eq!(info.status, b"OK".to_vec());
    }

    #[test]
    fn null_replies_decode() {
        let (context, n, e) = decode(b"*-1\r\n", true).unwrap();
        assert_eq!(context, b"-1".to_vec());
        assert_eq!(n, 5);
        assert!(!e);

        let (context, n, _) = decode(b"$-1\r\n", false).unwrap();
        assert_eq!(context, b"-1".to_vec());
        assert_eq!(n, 5);
    }
}
