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

use std::str::Utf8Error;

use public::l7_protocol::L7Protocol;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("zero payload len")]
    ZeroPayloadLen,
    #[error("invalid ip protocol")]
    InvalidIpProtocol,

    // decoder needs more bytes, the caller keeps the buffer and retries
    #[error("{0:?} message incomplete")]
    IncompleteMessage(L7Protocol),

    #[error("http header parse failed")]
    HttpHeaderParseFailed,
    #[error("{0}")]
    DnsLogParseFailed(String),
    #[error("mysql log parse failed")]
    MysqlLogParseFailed,
    #[error("redis log parse failed")]
    RedisLogParseFailed,
    #[error("dubbo header parse failed")]
    DubboHeaderParseFailed,
    #[error("kafka log parse failed")]
    KafkaLogParseFailed,
    #[error("rocketmq log parse failed")]
    RocketmqLogParseFailed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::IncompleteMessage(_))
    }
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Self::HttpHeaderParseFailed
    }
}
