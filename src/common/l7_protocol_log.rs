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

use super::enums::{IpProtocol, PacketDirection};
use super::l7_protocol_info::L7ProtocolInfo;

use crate::analyzer::protocol_logs::{
    DnsLog, DubboLog, GenericLog, HttpLog, KafkaLog, MysqlLog, RedisLog, RocketmqLog,
};
use crate::analyzer::Result;

use public::l7_protocol::L7Protocol;

/*
 Every protocol implements L7ProtocolParserInterface.

 check_payload is the cheap fast-fail predicate used during protocol
 identification, parse_payload the full decoder. Identification walks the
 candidates from get_candidates(), checks, then parses; the first complete
 parse locks the connection to that protocol.

 the parser flow:

    check_payload -> parse_payload -> reset --
                        /|\                  |
                         |                   |
                         |_____next event____|
*/

macro_rules! count {
    () => (0);
    ($x:tt $($xs: tt)* ) => (1usize + count!($($xs)*));
}

macro_rules! impl_protocol_parser {
    (pub enum $name:ident { $($proto:ident($log_type:ty)),* $(,)? }) => {
        #[enum_dispatch(L7ProtocolParserInterface)]
        pub enum $name {
            // http must head the default candidate order, generic is the
            // fallback and never a candidate, so neither sits in the macro
            Http(HttpLog),
            $($proto($log_type),)*
            Generic(GenericLog),
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::Http(_) => "HTTP",
                    Self::Generic(_) => "Generic",
                    $(
                        Self::$proto(_) => stringify!($proto),
                    )*
                }
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                match value {
                    "HTTP" => Ok(Self::Http(HttpLog::default())),
                    "Generic" => Ok(Self::Generic(GenericLog::default())),
                    $(
                        stringify!($proto) => Ok(Self::$proto(Default::default())),
                    )*
                    _ => Err(format!("unknown protocol {}", value)),
                }
            }
        }

        pub fn get_parser(p: L7Protocol) -> Option<$name> {
            match p {
                L7Protocol::Http1 => Some($name::Http(HttpLog::default())),
                L7Protocol::Generic => Some($name::Generic(GenericLog::default())),
                $(
                    L7Protocol::$proto => Some($name::$proto(Default::default())),
                )*
                _ => None,
            }
        }

        // candidate order when no port hint applies
        pub fn get_all_protocol() -> [$name; 1 + count!($($proto)*)] {
            [
                $name::Http(HttpLog::default()),
                $(
                    $name::$proto(Default::default()),
                )*
            ]
        }
    }
}

impl_protocol_parser! {
    pub enum L7ProtocolParser {
        Redis(RedisLog),
        DNS(DnsLog),
        MySQL(MysqlLog),
        Dubbo(DubboLog),
        Kafka(KafkaLog),
        RocketMQ(RocketmqLog),
        // add protocol above
    }
}

#[derive(Debug)]
pub enum L7ParseResult {
    Single(L7ProtocolInfo),
    Multi(Vec<L7ProtocolInfo>),
    None,
}

impl L7ParseResult {
    pub fn is_none(&self) -> bool {
        matches!(self, L7ParseResult::None)
    }

    pub fn unwrap_single(self) -> L7ProtocolInfo {
        match self {
            L7ParseResult::Single(s) => s,
            L7ParseResult::Multi(_) => panic!("parse result is multi but unwrap single"),
            L7ParseResult::None => panic!("parse result is none but unwrap single"),
        }
    }

    pub fn into_vec(self) -> Vec<L7ProtocolInfo> {
        match self {
            L7ParseResult::Single(s) => vec![s],
            L7ParseResult::Multi(m) => m,
            L7ParseResult::None => vec![],
        }
    }
}

#[enum_dispatch]
pub trait L7ProtocolParserInterface {
    // O(1), side effect free rejection on length and magic bytes
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool;
    // full decode. Err(IncompleteMessage) means the caller must buffer the
    // payload and retry with more bytes; any other error is a reject.
    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult>;
    fn protocol(&self) -> L7Protocol;

    fn parsable_on_tcp(&self) -> bool {
        true
    }

    fn parsable_on_udp(&self) -> bool {
        true
    }

    fn reset(&mut self) {}
}

#[derive(Clone, Copy, Debug)]
pub struct ParseParam {
    pub l4_protocol: IpProtocol,
    pub direction: PacketDirection,
    // server side port of the normalized connection
    pub port: u16,
    pub time_ns: u64,
    pub truncated: bool,
}

impl ParseParam {
    pub fn new(l4_protocol: IpProtocol, direction: PacketDirection, port: u16) -> Self {
        Self {
            l4_protocol,
            direction,
            port,
            time_ns: 0,
            truncated: false,
        }
    }
}

/*
    u128 bitmap of protocols enabled for identification. Protocol numbers
    stay below 128 for this reason.
*/
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct L7ProtocolBitmap(u128);

impl L7ProtocolBitmap {
    pub fn set_enabled(&mut self, p: L7Protocol) {
        self.0 |= 1 << (p as u128);
    }

    pub fn set_disabled(&mut self, p: L7Protocol) {
        self.0 &= !(1 << (p as u128));
    }

    pub fn is_disabled(&self, p: L7Protocol) -> bool {
        self.0 & (1 << (p as u128)) == 0
    }

    pub fn is_enabled(&self, p: L7Protocol) -> bool {
        !self.is_disabled(p)
    }

    pub fn all_enabled() -> Self {
        let mut bitmap = L7ProtocolBitmap(0);
        for p in get_all_protocol() {
            bitmap.set_enabled(p.protocol());
        }
        bitmap
    }
}

impl From<&Vec<String>> for L7ProtocolBitmap {
    fn from(vs: &Vec<String>) -> Self {
        let mut bitmap = L7ProtocolBitmap(0);
        for v in vs.iter() {
            let p = L7Protocol::from(v.as_str());
            if p != L7Protocol::Unknown {
                bitmap.set_enabled(p);
            }
        }
        bitmap
    }
}

impl std::fmt::Debug for L7ProtocolBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut p = vec![];
        for i in get_all_protocol() {
            if self.is_enabled(i.protocol()) {
                p.push(i.protocol());
            }
        }
        f.write_str(format!("{:#?}", p).as_str())
    }
}
