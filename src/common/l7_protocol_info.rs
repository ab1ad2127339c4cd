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

use enum_dispatch::enum_dispatch;
use serde::Serialize;

use crate::analyzer::payload::AttributeMap;
use crate::analyzer::protocol_logs::{
    AppProtoHead, DnsInfo, DubboInfo, GenericInfo, HttpInfo, KafkaInfo, MysqlInfo, RedisInfo,
    RocketmqInfo,
};
use crate::analyzer::Result;

#[derive(Serialize, Debug, Clone)]
#[enum_dispatch(L7ProtocolInfoInterface)]
#[serde(untagged)]
pub enum L7ProtocolInfo {
    DnsInfo(DnsInfo),
    HttpInfo(HttpInfo),
    MysqlInfo(MysqlInfo),
    RedisInfo(RedisInfo),
    DubboInfo(DubboInfo),
    KafkaInfo(KafkaInfo),
    RocketmqInfo(RocketmqInfo),
    GenericInfo(GenericInfo),
}

#[enum_dispatch]
pub trait L7ProtocolInfoInterface {
    // stream identifier for protocols that match request to response by id,
    // such as the dns transaction id or the kafka correlation id
    fn session_id(&self) -> Option<u32>;
    // merge a response info into the request info of the same session
    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()>;

    fn app_proto_head(&self) -> Option<AppProtoHead>;
    fn is_error(&self) -> bool;

    // render the extracted fields into the merged attribute map of the
    // emitted record
    fn fill_attributes(&self, attrs: &mut AttributeMap);
}
