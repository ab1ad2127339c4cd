/*
 * Copyright (c) 2022 Yunshan Networks
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

use std::net::IpAddr;
use std::num::NonZeroUsize;

use ahash::{AHashMap, RandomState};
use lru::LruCache;

use crate::common::{L7_PROTOCOL_INFERENCE_MAX_FAIL_COUNT, L7_PROTOCOL_INFERENCE_TTL};
use crate::common::l7_protocol_log::{get_all_protocol, get_parser, L7ProtocolParser};

use public::l7_protocol::L7Protocol;

#[derive(Eq, Hash, PartialEq)]
struct AppTableKey {
    ip: IpAddr,
    port: u16,
}

struct AppTableValue {
    unknown_count: usize,
    protocol: L7Protocol,
    last: u64, // seconds
}

/// Ordered decoder candidates per well known server port, plus a cache of
/// what identification concluded for a given server endpoint. One server
/// speaks one protocol, so a conclusion for (ip, port) short-circuits
/// identification of later connections to it.
pub struct AppTable {
    port_map: AHashMap<u16, Vec<L7Protocol>>,
    inferred: LruCache<AppTableKey, AppTableValue, RandomState>,

    max_fail_count: usize,
    ttl: u64,
}

impl Default for AppTable {
    fn default() -> Self {
        Self {
            port_map: AHashMap::new(),
            inferred: LruCache::with_hasher(Self::APP_LRU_SIZE, RandomState::new()),
            max_fail_count: L7_PROTOCOL_INFERENCE_MAX_FAIL_COUNT,
            ttl: L7_PROTOCOL_INFERENCE_TTL,
        }
    }
}

impl AppTable {
    // safe because the parameter is not zero
    const APP_LRU_SIZE: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1 << 12) };

    pub fn new(port_map: AHashMap<u16, Vec<L7Protocol>>) -> Self {
        Self {
            port_map,
            ..Default::default()
        }
    }

    pub fn is_server_port(&self, port: u16) -> bool {
        self.port_map.contains_key(&port)
    }

    // candidates in identification order: the port hint list when the
    // server port is well known, otherwise every decoder
    pub fn candidates(&self, server_port: u16) -> Vec<L7ProtocolParser> {
        match self.port_map.get(&server_port) {
            Some(protocols) => protocols.iter().filter_map(|p| get_parser(*p)).collect(),
            None => get_all_protocol().into_iter().collect(),
        }
    }

    pub fn get_protocol(&mut self, ip: IpAddr, port: u16, time_in_sec: u64) -> Option<L7Protocol> {
        let key = AppTableKey { ip, port };
        if let Some(v) = self.inferred.get_mut(&key) {
            if v.last + self.ttl < time_in_sec {
                self.inferred.pop(&key);
                return None;
            }
            v.last = time_in_sec;
            // a failed first check is cached as unknown, count before trusting
            if v.protocol == L7Protocol::Unknown && v.unknown_count < self.max_fail_count {
                return None;
            }
            return Some(v.protocol);
        }
        None
    }

    // returns true when the unknown count hits the limit and the endpoint
    // should be treated as undecodable
    pub fn set_protocol(
        &mut self,
        ip: IpAddr,
        port: u16,
        protocol: L7Protocol,
        time_in_sec: u64,
    ) -> bool {
        let key = AppTableKey { ip, port };
        if let Some(value) = self.inferred.get_mut(&key) {
            value.last = time_in_sec;
            if protocol == L7Protocol::Unknown {
                value.unknown_count += 1;
                if value.unknown_count > self.max_fail_count {
                    value.protocol = protocol;
                    return true;
                }
            } else {
                value.unknown_count = 0;
                value.protocol = protocol;
            }
        } else {
            self.inferred.put(
                key,
                AppTableValue {
                    unknown_count: 0,
                    protocol,
                    last: time_in_sec,
                },
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::l7_protocol_log::L7ProtocolParserInterface;

    fn table() -> AppTable {
        AppTable::new(
            [
                (3306u16, vec![L7Protocol::MySQL]),
                (80, vec![L7Protocol::Http1]),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn port_hint_order_dominates() {
        let table = table();
        let candidates = table.candidates(3306);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].protocol(), L7Protocol::MySQL);

        // no mapping falls back to the full list, http first
        let candidates = table.candidates(4000);
        assert_eq!(candidates[0].protocol(), L7Protocol::Http1);
        assert!(candidates.len() > 3);
    }

    #[test]
    fn inference_cache_ttl() {
        let mut table = table();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        table.set_protocol(ip, 6000, L7Protocol::Redis, 100);
        assert_eq!(table.get_protocol(ip, 6000, 110), Some(L7Protocol::Redis));
        // expired
        assert_eq!(
            table.get_protocol(ip, 6000, 110 + L7_PROTOCOL_INFERENCE_TTL + 1),
            None
        );
    }
}
