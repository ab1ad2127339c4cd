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

use std::fmt::Write;

use serde::Serialize;

use super::{AppProtoHead, L7ResponseStatus};

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::AttributeMap;
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::l7_protocol::{L7Protocol, LogMessageType};

const HEX_PREVIEW_LEN: usize = 16;

/// Fallback record for connections no decoder locked onto. Carries the
/// payload size and a short hex preview, never an error.
#[derive(Serialize, Debug, Default, Clone)]
pub struct GenericInfo {
    pub msg_type: LogMessageType,
    pub payload_size: u64,
    pub preview: String,
}

impl L7ProtocolInfoInterface for GenericInfo {
    fn session_id(&self) -> Option<u32> {
        None
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::GenericInfo(other) = other {
            if other.msg_type == LogMessageType::Response {
                self.payload_size += other.payload_size;
            }
            self.msg_type = LogMessageType::Session;
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::Generic,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        false
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        attrs.add_int("payload_size", self.payload_size as i64);
        if !self.preview.is_empty() {
            attrs.add_str("payload_preview", self.preview.clone());
        }
    }
}

#[derive(Default)]
pub struct GenericLog {}

impl L7ProtocolParserInterface for GenericLog {
    fn check_payload(&mut self, payload: &[u8], _param: &ParseParam) -> bool {
        !payload.is_empty()
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        if payload.is_empty() {
            return Err(Error::ZeroPayloadLen);
        }
        let mut preview = String::with_capacity(HEX_PREVIEW_LEN * 2);
        for b in payload.iter().take(HEX_PREVIEW_LEN) {
            let _ = write!(&mut preview, "{:02x}", b);
        }
        let info = GenericInfo {
            msg_type: param.direction.into(),
            payload_size: payload.len() as u64,
            preview,
        };
        Ok(L7ParseResult::Single(L7ProtocolInfo::GenericInfo(info)))
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::Generic
    }
}

// fallback records always report ok
impl GenericInfo {
    pub fn status(&self) -> L7ResponseStatus {
        L7ResponseStatus::Ok
    }
}
