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

use super::super::{value_is_default, AppProtoHead, L7ResponseStatus};
use super::super::consts::*;
use super::is_valid_sql;

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::AttributeMap;
use crate::common::enums::{IpProtocol, PacketDirection};
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::bytes::{read_u16_le, read_u24_le, read_u32_le, read_u64_le};
use public::l7_protocol::{L7Protocol, LogMessageType};

const SERVER_STATUS_CODE_MIN: u16 = 1000;
const CLIENT_STATUS_CODE_MIN: u16 = 2000;
const CLIENT_STATUS_CODE_MAX: u16 = 2999;

#[derive(Serialize, Debug, Default, Clone)]
pub struct MysqlInfo {
    pub msg_type: LogMessageType,

    // request
    #[serde(rename = "request_type")]
    pub command: u8,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub context: String,

    // response
    pub response_code: u8,
    #[serde(skip)]
    pub error_code: Option<i32>,
    #[serde(rename = "sql_affected_rows", skip_serializing_if = "value_is_default")]
    pub affected_rows: u64,
    #[serde(rename = "response_exception", skip_serializing_if = "value_is_default")]
    pub error_message: String,
    #[serde(rename = "response_status")]
    pub status: L7ResponseStatus,
}

impl L7ProtocolInfoInterface for MysqlInfo {
    fn session_id(&self) -> Option<u32> {
        None
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::MysqlInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::MySQL,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.status.is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        if !self.context.is_empty() {
            attrs.add_str("sql", self.context.clone());
        }
        let command = self.get_command_str();
        if !command.is_empty() {
            attrs.add_str("mysql.command", command);
        }
        if let Some(code) = self.error_code {
            attrs.add_int("mysql.error_code", code as i64);
        }
        if !self.error_message.is_empty() {
            attrs.add_str("mysql.error_msg", self.error_message.clone());
        }
        if self.affected_rows > 0 {
            attrs.add_int("mysql.affected_rows", self.affected_rows as i64);
        }
    }
}

impl MysqlInfo {
    pub fn merge(&mut self, other: &mut Self) {
        match other.msg_type {
            LogMessageType::Request => {
                self.command = other.command;
                std::mem::swap(&mut self.context, &mut other.context);
            }
            LogMessageType::Response => {
                self.response_code = other.response_code;
                self.affected_rows = other.affected_rows;
                std::mem::swap(&mut self.error_message, &mut other.error_message);
                self.status = other.status;
                if self.error_code.is_none() {
                    self.error_code = other.error_code;
                }
            }
            _ => {}
        }
        self.msg_type = LogMessageType::Session;
    }

    pub fn get_command_str(&self) -> &'static str {
        let command = [
            "", // command 0 is resp, ignore
            "COM_QUIT",
            "COM_INIT_DB",
            "COM_QUERY",
            "COM_FIELD_LIST",
            "COM_CREATE_DB",
            "COM_DROP_DB",
            "COM_REFRESH",
            "COM_SHUTDOWN",
            "COM_STATISTICS",
            "COM_PROCESS_INFO",
            "COM_CONNECT",
            "COM_PROCESS_KILL",
            "COM_DEBUG",
            "COM_PING",
            "COM_TIME",
            "COM_DELAYED_INSERT",
            "COM_CHANGE_USER",
            "COM_BINLOG_DUMP",
            "COM_TABLE_DUMP",
            "COM_CONNECT_OUT",
            "COM_REGISTER_SLAVE",
            "COM_STMT_PREPARE",
            "COM_STMT_EXECUTE",
            "COM_STMT_SEND_LONG_DATA",
            "COM_STMT_CLOSE",
            "COM_STMT_RESET",
            "COM_SET_OPTION",
            "COM_STMT_FETCH",
        ];
        match self.command {
            0x00..=0x1c => command[self.command as usize],
            _ => "",
        }
    }
}

/// 3 byte little-endian payload length plus 1 byte sequence id.
#[derive(Debug, Default)]
pub struct MysqlHeader {
    pub length: u32,
    pub number: u8,
}

impl MysqlHeader {
    // returns the payload offset, or None for a hopeless buffer
    pub fn decode(&mut self, payload: &[u8]) -> Option<usize> {
        if payload.len() < MYSQL_HEADER_LEN {
            return None;
        }
        let len = read_u24_le(payload);
        if len == 0 || len >= MYSQL_MAX_PACKET_LEN {
            return None;
        }
        self.length = len;
        self.number = payload[3];
        Some(MYSQL_HEADER_LEN)
    }
}

#[derive(Default)]
pub struct MysqlLog {}

impl L7ProtocolParserInterface for MysqlLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        if param.l4_protocol != IpProtocol::Tcp {
            return false;
        }
        let mut header = MysqlHeader::default();
        let Some(offset) = header.decode(payload) else {
            return false;
        };
        // command packets restart the sequence
        if header.number != 0 || offset >= payload.len() {
            return false;
        }
        payload[offset] < COM_MAX
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if param.l4_protocol != IpProtocol::Tcp {
            return Err(Error::InvalidIpProtocol);
        }
        let mut info = MysqlInfo::default();
        if self.parse(payload, param, &mut info)? {
            // greeting packets carry no request or response semantics
            return Ok(L7ParseResult::None);
        }
        Ok(L7ParseResult::Single(L7ProtocolInfo::MysqlInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::MySQL
    }

    fn parsable_on_udp(&self) -> bool {
        false
    }
}

impl MysqlLog {
    fn request(&mut self, payload: &[u8], info: &mut MysqlInfo) -> Result<()> {
        if payload.len() < COMMAND_LEN {
            return Err(Error::MysqlLogParseFailed);
        }
        info.command = payload[COMMAND_OFFSET];
        info.msg_type = LogMessageType::Request;
        match info.command {
            COM_QUIT | COM_PING | COM_STMT_CLOSE | COM_STMT_FETCH | COM_FIELD_LIST => {}
            COM_INIT_DB | COM_QUERY | COM_STMT_PREPARE => {
                let sql = &payload[COMMAND_OFFSET + COMMAND_LEN..];
                if !sql.is_ascii() {
                    return Err(Error::MysqlLogParseFailed);
                }
                if (info.command == COM_QUERY || info.command == COM_STMT_PREPARE)
                    && !is_valid_sql(sql)
                {
                    return Err(Error::MysqlLogParseFailed);
                }
                info.context = String::from_utf8_lossy(sql).into_owned();
            }
            COM_STMT_EXECUTE => {
                if payload.len() >= COMMAND_LEN + STATEMENT_ID_LEN {
                    info.context = format!("statement_id={}", read_u32_le(&payload[COMMAND_LEN..]));
                }
            }
            _ => return Err(Error::MysqlLogParseFailed),
        }
        Ok(())
    }

    fn decode_compress_int(payload: &[u8]) -> u64 {
        let remain = payload.len();
        if remain == 0 {
            return 0;
        }
        let value = payload[0];
        match value {
            INT_FLAGS_2 if remain > INT_BASE_LEN + 2 => {
                read_u16_le(&payload[INT_BASE_LEN..]) as u64
            }
            INT_FLAGS_3 if remain > INT_BASE_LEN + 3 => {
                read_u16_le(&payload[INT_BASE_LEN..]) as u64
                    | ((payload[INT_BASE_LEN + 2] as u64) << 16)
            }
            INT_FLAGS_8 if remain > INT_BASE_LEN + 8 => read_u64_le(&payload[INT_BASE_LEN..]),
            _ => value as u64,
        }
    }

    fn set_status(&mut self, status_code: u16, info: &mut MysqlInfo) {
        if status_code != 0 {
            if (CLIENT_STATUS_CODE_MIN..=CLIENT_STATUS_CODE_MAX).contains(&status_code) {
                info.status = L7ResponseStatus::ClientError;
            } else {
                info.status = L7ResponseStatus::ServerError;
            }
        } else {
            info.status = L7ResponseStatus::Ok;
        }
    }

    fn response(&mut self, payload: &[u8], info: &mut MysqlInfo) -> Result<()> {
        let mut remain = payload.len();
        if remain < RESPONSE_CODE_LEN {
            return Err(Error::MysqlLogParseFailed);
        }
        info.response_code = payload[0];
        info.msg_type = LogMessageType::Response;
        remain -= RESPONSE_CODE_LEN;
        match info.response_code {
            MYSQL_RESPONSE_CODE_ERR => {
                if remain > ERROR_CODE_LEN {
                    let code = read_u16_le(&payload[RESPONSE_CODE_LEN..]);
                    if code < SERVER_STATUS_CODE_MIN || code > CLIENT_STATUS_CODE_MAX {
                        return Err(Error::MysqlLogParseFailed);
                    }
                    info.error_code = Some(code as i32);
                    self.set_status(code, info);
                    remain -= ERROR_CODE_LEN;
                }
                let error_message_offset = if remain > SQL_STATE_LEN
                    && payload[RESPONSE_CODE_LEN + ERROR_CODE_LEN] == SQL_STATE_MARKER
                {
                    RESPONSE_CODE_LEN + ERROR_CODE_LEN + SQL_STATE_LEN
                } else {
                    RESPONSE_CODE_LEN + ERROR_CODE_LEN
                };
                if error_message_offset < payload.len() {
                    let context = &payload[error_message_offset..];
                    if !context.is_ascii() {
                        return Err(Error::MysqlLogParseFailed);
                    }
                    info.error_message = String::from_utf8_lossy(context).into_owned();
                }
            }
            MYSQL_RESPONSE_CODE_OK | MYSQL_RESPONSE_CODE_EOF => {
                info.status = L7ResponseStatus::Ok;
                info.affected_rows =
                    Self::decode_compress_int(&payload[AFFECTED_ROWS_OFFSET..]);
            }
            // result set header, only the kind is of interest
            _ => {
                info.status = L7ResponseStatus::Ok;
            }
        }
        Ok(())
    }

    // returns is_greeting
    fn parse(&mut self, payload: &[u8], param: &ParseParam, info: &mut MysqlInfo) -> Result<bool> {
        let mut header = MysqlHeader::default();
        let offset = header.decode(payload).ok_or(Error::MysqlLogParseFailed)?;
        // a frame cut at the syscall boundary is completed by later events
        if (header.length as usize) + offset > payload.len() && !param.truncated {
            return Err(Error::IncompleteMessage(L7Protocol::MySQL));
        }
        let frame = &payload[offset..payload.len().min(offset + header.length as usize)];

        match param.direction {
            PacketDirection::ClientToServer => {
                if header.number != 0 {
                    return Err(Error::MysqlLogParseFailed);
                }
                self.request(frame, info)?;
            }
            PacketDirection::ServerToClient => {
                if header.number == 0 && frame.first() == Some(&PROTOCOL_VERSION) {
                    return Ok(true);
                }
                self.response(frame, info)?;
            }
        }
        Ok(false)
    }
}

const STATEMENT_ID_LEN: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![
            (payload.len() & 0xff) as u8,
            ((payload.len() >> 8) & 0xff) as u8,
            ((payload.len() >> 16) & 0xff) as u8,
            seq,
        ];
        p.extend_from_slice(payload);
        p
    }

    fn req_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ClientToServer, 3306)
    }

    fn resp_param() -> ParseParam {
        ParseParam::new(IpProtocol::Tcp, PacketDirection::ServerToClient, 3306)
    }

    #[test]
    fn check_query() {
        let mut log = MysqlLog::default();
        let mut com_query = vec![COM_QUERY];
        com_query.extend_from_slice(b"SELECT 1");
        let payload = frame(0, &com_query);
        assert!(log.check_payload(&payload, &req_param()));
        // responses never restart the sequence at 0 with a command byte
        let payload = frame(1, &com_query);
        assert!(!log.check_payload(&payload, &req_param()));
    }

    #[test]
    fn parse_query_request() {
        let mut log = MysqlLog::default();
        let mut com_query = vec![COM_QUERY];
        com_query.extend_from_slice(b"SELECT 1 FROM no_table");
        let payload = frame(0, &com_query);
        let info = log
            .parse_payload(&payload, &req_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::MysqlInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.command, COM_QUERY);
        assert_eq!(info.context, "SELECT 1 FROM no_table");
        assert_eq!(info.get_command_str(), "COM_QUERY");
    }

    #[test]
    fn parse_err_response() {
        let mut log = MysqlLog::default();
        // ERR 1146 (42S02): Table 'no_table' doesn't exist
        let mut body = vec![MYSQL_RESPONSE_CODE_ERR];
        body.extend_from_slice(&1146u16.to_le_bytes());
        body.extend_from_slice(b"#42S02");
        body.extend_from_slice(b"Table 'no_table' doesn't exist");
        let payload = frame(1, &body);
        let info = log
            .parse_payload(&payload, &resp_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::MysqlInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.error_code, Some(1146));
        assert_eq!(info.error_message, "Table 'no_table' doesn't exist");
        assert_eq!(info.status, L7ResponseStatus::ServerError);
        assert!(info.is_error());
    }

    #[test]
    fn parse_ok_response_affected_rows() {
        let mut log = MysqlLog::default();
        let body = vec![MYSQL_RESPONSE_CODE_OK, 3, 0, 2, 0, 0, 0];
        let payload = frame(1, &body);
        let info = log
            .parse_payload(&payload, &resp_param())
            .unwrap()
            .unwrap_single();
        let L7ProtocolInfo::MysqlInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.affected_rows, 3);
        assert_eq!(info.status, L7ResponseStatus::Ok);
    }

    #[test]
    fn greeting_is_skipped() {
        let mut log = MysqlLog::default();
        let mut body = vec![PROTOCOL_VERSION];
        body.extend_from_slice(b"8.0.30\0");
        let payload = frame(0, &body);
        assert!(log.parse_payload(&payload, &resp_param()).unwrap().is_none());
    }

    #[test]
    fn split_frame_needs_more_bytes() {
        let mut log = MysqlLog::default();
        let mut com_query = vec![COM_QUERY];
        com_query.extend_from_slice(b"SELECT * FROM some_very_long_table_name");
        let payload = frame(0, &com_query);
        let err = log
            .parse_payload(&payload[..10], &req_param())
            .unwrap_err();
        assert!(err.is_incomplete());
    }
}
