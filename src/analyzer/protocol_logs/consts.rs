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

// HTTP constants
pub const HTTP_V1_0_VERSION: &str = "HTTP/1.0";
pub const HTTP_V1_1_VERSION: &str = "HTTP/1.1";
pub const HTTP_RESP_MIN_LEN: usize = 12; // e.g. "HTTP/1.1 200"
pub const HTTP_STATUS_CODE_MIN: u16 = 100;
pub const HTTP_STATUS_CODE_MAX: u16 = 600;
pub const HTTP_STATUS_CLIENT_ERROR_MIN: u16 = 400;
pub const HTTP_STATUS_SERVER_ERROR_MIN: u16 = 500;

pub const TRACE_ID_B3: &str = "x-b3-traceid";
pub const TRACE_ID_TRACEPARENT: &str = "traceparent";

// MySQL packet constants
pub const MYSQL_HEADER_LEN: usize = 4;
pub const MYSQL_MAX_PACKET_LEN: u32 = 1 << 24; // 3 byte length field
pub const PROTOCOL_VERSION: u8 = 10;

pub const COMMAND_OFFSET: usize = 0;
pub const COMMAND_LEN: usize = 1;

// client command codes
pub const COM_QUIT: u8 = 1;
pub const COM_INIT_DB: u8 = 2;
pub const COM_QUERY: u8 = 3;
pub const COM_FIELD_LIST: u8 = 4;
pub const COM_PING: u8 = 14;
pub const COM_STMT_PREPARE: u8 = 22;
pub const COM_STMT_EXECUTE: u8 = 23;
pub const COM_STMT_CLOSE: u8 = 25;
pub const COM_STMT_FETCH: u8 = 28;
pub const COM_MAX: u8 = 32;

// response packet first byte
pub const MYSQL_RESPONSE_CODE_OK: u8 = 0;
pub const MYSQL_RESPONSE_CODE_EOF: u8 = 0xfe;
pub const MYSQL_RESPONSE_CODE_ERR: u8 = 0xff;

pub const RESPONSE_CODE_LEN: usize = 1;
pub const ERROR_CODE_LEN: usize = 2;
pub const AFFECTED_ROWS_OFFSET: usize = RESPONSE_CODE_LEN;
pub const SQL_STATE_LEN: usize = 6;
pub const SQL_STATE_MARKER: u8 = b'#';

// length encoded integer flags
pub const INT_FLAGS_2: u8 = 0xfc;
pub const INT_FLAGS_3: u8 = 0xfd;
pub const INT_FLAGS_8: u8 = 0xfe;
pub const INT_BASE_LEN: usize = 1;

// Dubbo constants
pub const DUBBO_MAGIC_HIGH: u8 = 0xda;
pub const DUBBO_MAGIC_LOW: u8 = 0xbb;
pub const DUBBO_HEADER_LEN: usize = 16;

pub const SERIAL_ID_HESSIAN2: u8 = 2;
pub const SERIAL_ID_FASTJSON: u8 = 6;

// hessian2 string tags
pub const BC_STRING_SHORT: u8 = 0x30;
pub const BC_STRING_SHORT_MAX: u8 = 0x33;

// fastjson body delimiters, fields look like "key":"value"\n
pub const JSON_NEXT_LINE: u8 = 0x0a;
pub const JSON_QUOTES: u8 = 0x22;
pub const JSON_COLON: u8 = 0x3a;

// Kafka constants
pub const KAFKA_REQ_HEADER_LEN: usize = 14;
pub const KAFKA_RESP_HEADER_LEN: usize = 8;

// DNS constants
pub const DNS_HEADER_SIZE: usize = 12;
pub const DNS_TCP_PAYLOAD_OFFSET: usize = 2;
pub const DNS_MAX_MESSAGE_SIZE: usize = 512;
pub const DNS_MAX_NUM_RR: u16 = 25;
pub const DNS_MAX_OPCODE: u16 = 2;
pub const DNS_MAX_RCODE: u16 = 5;
pub const DNS_TYPE_A: u16 = 1;
pub const DNS_TYPE_AAAA: u16 = 28;
pub const DNS_NAME_COMPRESS_POINTER: u8 = 0xc0;
pub const DNS_NAME_MAX_SIZE: usize = 255;

// RocketMQ constants
pub const ROCKETMQ_MIN_FRAME_LEN: usize = 8;
pub const ROCKETMQ_MAX_FRAME_LEN: i32 = 1 << 25;
pub const ROCKETMQ_SERIALIZE_JSON: u8 = 0;
pub const ROCKETMQ_SERIALIZE_ROCKETMQ: u8 = 1;
// code(2B) + language(1B) + version(2B) + opaque(4B) + flag(4B)
pub const ROCKETMQ_TYPE_MIN_HEADER_LEN: i32 = 13;
