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

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use serde::Serialize;

use super::enums::IpProtocol;
use super::event::SocketEvent;

/// 4-tuple normalized so that (client, server) is stable for both
/// directions of a connection. Orientation is decided by the tracker: the
/// server is the endpoint on a well-known port, or failing that, the side
/// that received the first payload.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub proto: IpProtocol,
    pub pid: u32,
}

impl ConnectionKey {
    // orient the event tuple as if the destination were the server
    pub fn forward(e: &SocketEvent) -> Self {
        Self {
            client_ip: e.src_ip,
            client_port: e.src_port,
            server_ip: e.dst_ip,
            server_port: e.dst_port,
            proto: e.l4_protocol,
            pid: e.pid,
        }
    }

    // orient the event tuple as if the source were the server
    pub fn reversed(e: &SocketEvent) -> Self {
        Self {
            client_ip: e.dst_ip,
            client_port: e.dst_port,
            server_ip: e.src_ip,
            server_port: e.src_port,
            proto: e.l4_protocol,
            pid: e.pid,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}:{} -> {}:{}",
            self.proto, self.client_ip, self.client_port, self.server_ip, self.server_port
        )
    }
}

/// Lane routing hash. Must be symmetric in the endpoints so that requests
/// and responses of one connection land on the same worker regardless of
/// tuple orientation.
pub fn lane_hash(e: &SocketEvent) -> u64 {
    let mut a = std::collections::hash_map::DefaultHasher::new();
    let mut b = std::collections::hash_map::DefaultHasher::new();
    (e.src_ip, e.src_port).hash(&mut a);
    (e.dst_ip, e.dst_port).hash(&mut b);
    let (a, b) = (a.finish(), b.finish());
    let mut h = std::collections::hash_map::DefaultHasher::new();
    (a.min(b), a.max(b), e.l4_protocol as u8, e.pid).hash(&mut h);
    h.finish()
}
