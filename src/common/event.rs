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

use std::net::{IpAddr, Ipv4Addr};

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive};

use super::enums::IpProtocol;

bitflags! {
    pub struct EventFlags: u32 {
        const NONE = 0;
        // the probe truncated the payload at its capture limit
        const TRUNCATED = 1;
        // socket close, no payload
        const CLOSE = 1 << 1;
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        EventFlags::NONE
    }
}

// Whether the local process read or wrote the payload. This is relative to
// the traced process, not to the connection; client/server orientation is
// resolved later by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Ingress,
    Egress,
}

impl Default for IoDirection {
    fn default() -> Self {
        IoDirection::Egress
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Syscall {
    #[num_enum(default)]
    Unknown = 0,
    Read = 1,
    Write = 2,
    RecvFrom = 3,
    SendTo = 4,
    RecvMsg = 5,
    SendMsg = 6,
    Close = 7,
}

/// One raw payload fragment captured by the kernel probe at a syscall
/// boundary. Fragments carry no framing: a protocol message may span many
/// events and one event may hold many messages.
#[derive(Debug, Clone)]
pub struct SocketEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,

    pub direction: IoDirection,
    pub syscall: Syscall,

    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub l4_protocol: IpProtocol,

    pub payload: Vec<u8>,
    pub flags: EventFlags,
}

impl Default for SocketEvent {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            pid: 0,
            tid: 0,
            direction: IoDirection::default(),
            syscall: Syscall::Unknown,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_port: 0,
            l4_protocol: IpProtocol::Tcp,
            payload: vec![],
            flags: EventFlags::NONE,
        }
    }
}

impl SocketEvent {
    pub fn is_close(&self) -> bool {
        self.flags.contains(EventFlags::CLOSE) || self.syscall == Syscall::Close
    }

    pub fn is_truncated(&self) -> bool {
        self.flags.contains(EventFlags::TRUNCATED)
    }
}
