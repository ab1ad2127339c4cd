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

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use super::consts::*;
use super::{value_is_default, AppProtoHead, L7ResponseStatus};

use crate::analyzer::error::{Error, Result};
use crate::analyzer::payload::{AttributeMap, PayloadMessage};
use crate::common::enums::IpProtocol;
use crate::common::l7_protocol_info::{L7ProtocolInfo, L7ProtocolInfoInterface};
use crate::common::l7_protocol_log::{L7ParseResult, L7ProtocolParserInterface, ParseParam};

use public::l7_protocol::{L7Protocol, LogMessageType};

/*
 Header
    0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |                      ID                       |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |                    QDCOUNT                    |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |                    ANCOUNT                    |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |                    NSCOUNT                    |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
  |                    ARCOUNT                    |
  +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/

#[derive(Serialize, Debug, Default, Clone)]
pub struct DnsInfo {
    pub msg_type: LogMessageType,

    #[serde(rename = "request_id")]
    pub trans_id: u16,
    #[serde(rename = "request_type", skip_serializing_if = "value_is_default")]
    pub query_type: u16,
    #[serde(rename = "request_resource", skip_serializing_if = "value_is_default")]
    pub query_name: String,
    #[serde(rename = "response_result", skip_serializing_if = "value_is_default")]
    pub answers: Vec<String>,
    #[serde(rename = "response_code", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u8>,
}

impl L7ProtocolInfoInterface for DnsInfo {
    fn session_id(&self) -> Option<u32> {
        Some(self.trans_id as u32)
    }

    fn merge_log(&mut self, other: &mut L7ProtocolInfo) -> Result<()> {
        if let L7ProtocolInfo::DnsInfo(other) = other {
            self.merge(other);
        }
        Ok(())
    }

    fn app_proto_head(&self) -> Option<AppProtoHead> {
        Some(AppProtoHead {
            proto: L7Protocol::DNS,
            msg_type: self.msg_type,
            rrt: 0,
        })
    }

    fn is_error(&self) -> bool {
        self.status().is_error()
    }

    fn fill_attributes(&self, attrs: &mut AttributeMap) {
        if !self.query_name.is_empty() {
            attrs.add_str("dns.domain", self.query_name.clone());
        }
        if !self.answers.is_empty() {
            attrs.add_str("dns.ip", self.answers.join(","));
        }
        attrs.add_int("dns.id", self.trans_id as i64);
        if let Some(rcode) = self.status_code {
            attrs.add_int("dns.rcode", rcode as i64);
        }
    }
}

impl DnsInfo {
    pub fn merge(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.answers, &mut other.answers);
        if let Some(code) = other.status_code {
            self.status_code = Some(code);
        }
        if self.query_name.is_empty() {
            std::mem::swap(&mut self.query_name, &mut other.query_name);
        }
        self.msg_type = LogMessageType::Session;
    }

    fn status(&self) -> L7ResponseStatus {
        match self.status_code {
            Some(0) => L7ResponseStatus::Ok,
            // format error and name error are the requester's fault
            Some(1) | Some(3) => L7ResponseStatus::ClientError,
            Some(_) => L7ResponseStatus::ServerError,
            None => L7ResponseStatus::Unknown,
        }
    }
}

#[derive(Default)]
pub struct DnsLog {}

impl L7ProtocolParserInterface for DnsLog {
    fn check_payload(&mut self, payload: &[u8], param: &ParseParam) -> bool {
        let offset = if param.l4_protocol == IpProtocol::Tcp {
            DNS_TCP_PAYLOAD_OFFSET
        } else {
            0
        };
        if payload.len() <= DNS_HEADER_SIZE + offset
            || payload.len() > DNS_MAX_MESSAGE_SIZE + offset
        {
            return false;
        }
        header_sane(&payload[offset..])
    }

    fn parse_payload(&mut self, payload: &[u8], param: &ParseParam) -> Result<L7ParseResult> {
        match param.l4_protocol {
            IpProtocol::Udp => {
                let info = parse_dns_message(payload)?;
                Ok(L7ParseResult::Single(L7ProtocolInfo::DnsInfo(info)))
            }
            IpProtocol::Tcp => self.parse_tcp(payload),
            _ => Err(Error::InvalidIpProtocol),
        }
    }

    fn protocol(&self) -> L7Protocol {
        L7Protocol::DNS
    }
}

impl DnsLog {
    // DNS over TCP prepends a 2 byte length to each message, but eBPF data
    // may surface the payload with or without it. If the remaining bytes
    // match the prefix exactly, only try the prefixed form; otherwise try
    // both offsets, longer-than-prefix first.
    fn parse_tcp(&mut self, payload: &[u8]) -> Result<L7ParseResult> {
        let mut offset = 0;
        let mut all_info = vec![];

        while offset < payload.len() {
            let frame = &payload[offset..];
            if frame.len() < DNS_TCP_PAYLOAD_OFFSET {
                break;
            }
            let msg = PayloadMessage::new(frame);
            let len = msg.read_u16(0).unwrap() as usize;
            if len < DNS_HEADER_SIZE {
                break;
            }
            if frame.len() < DNS_HEADER_SIZE {
                if offset == 0 && all_info.is_empty() {
                    return Err(Error::IncompleteMessage(L7Protocol::DNS));
                }
                break;
            }

            let remaining = frame.len() - DNS_TCP_PAYLOAD_OFFSET;
            let tries: [Option<usize>; 2] = if remaining == len {
                [Some(DNS_TCP_PAYLOAD_OFFSET), None]
            } else if remaining > len {
                [Some(DNS_TCP_PAYLOAD_OFFSET), Some(0)]
            } else if offset == 0 && all_info.is_empty() {
                // a single message cut short by the syscall boundary
                return Err(Error::IncompleteMessage(L7Protocol::DNS));
            } else {
                break;
            };

            let mut valid = false;
            for t in tries.iter().flatten() {
                let end_of_frame = frame.len().min(t + len);
                if let Ok(info) = parse_dns_message(&frame[*t..end_of_frame]) {
                    valid = true;
                    offset += end_of_frame;
                    all_info.push(L7ProtocolInfo::DnsInfo(info));
                    break;
                }
            }
            if !valid {
                break;
            }
        }

        match all_info.len() {
            0 => Err(Error::DnsLogParseFailed(
                "no valid DNS message found".to_owned(),
            )),
            1 => Ok(L7ParseResult::Single(all_info.pop().unwrap())),
            _ => Ok(L7ParseResult::Multi(all_info)),
        }
    }
}

struct DnsHeader {
    id: u16,
    qr: u16,
    opcode: u16,
    rcode: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl DnsHeader {
    fn read(msg: &PayloadMessage) -> Option<Self> {
        let flags = msg.read_u16(2)?;
        Some(Self {
            id: msg.read_u16(0)?,
            qr: (flags >> 15) & 0x1,
            opcode: (flags >> 11) & 0xf,
            rcode: flags & 0xf,
            qdcount: msg.read_u16(4)?,
            ancount: msg.read_u16(6)?,
            nscount: msg.read_u16(8)?,
            arcount: msg.read_u16(10)?,
        })
    }

    fn num_rr(&self) -> u16 {
        self.qdcount
            .saturating_add(self.ancount)
            .saturating_add(self.nscount)
            .saturating_add(self.arcount)
    }

    /*
        Kind of query in this message
            0   a standard query (QUERY)
            1   an inverse query (IQUERY)
            2   a server status request (STATUS)
        Response code
            0   no error, 1 format error, 2 server failure,
            3   name error, 4 not implemented, 5 refused
    */
    fn sane(&self) -> bool {
        self.opcode <= DNS_MAX_OPCODE
            && self.rcode <= DNS_MAX_RCODE
            && self.qdcount >= 1
            && self.num_rr() <= DNS_MAX_NUM_RR
    }
}

fn header_sane(payload: &[u8]) -> bool {
    let msg = PayloadMessage::new(payload);
    DnsHeader::read(&msg).map(|h| h.sane()).unwrap_or(false)
}

fn parse_dns_message(payload: &[u8]) -> Result<DnsInfo> {
    let msg = PayloadMessage::new(payload);
    let header = DnsHeader::read(&msg)
        .ok_or_else(|| Error::DnsLogParseFailed("header too short".to_owned()))?;
    if !header.sane() {
        return Err(Error::DnsLogParseFailed("header rejected".to_owned()));
    }

    let mut info = DnsInfo {
        trans_id: header.id,
        msg_type: if header.qr == 0 {
            LogMessageType::Request
        } else {
            LogMessageType::Response
        },
        ..Default::default()
    };

    let mut offset = DNS_HEADER_SIZE;
    // in practice requests carry exactly one question, read the first
    let (next, name) = read_domain_name(&msg, offset)?;
    info.query_name = name;
    info.query_type = msg
        .read_u16(next)
        .ok_or_else(|| Error::DnsLogParseFailed("question cut short".to_owned()))?;
    offset = next + 4; // qtype + qclass
    for _ in 1..header.qdcount {
        let (next, _) = read_domain_name(&msg, offset)?;
        offset = next + 4;
    }

    if header.qr == 1 {
        info.status_code = Some(header.rcode as u8);
        read_answers(&msg, offset, header.ancount, &mut info);
    } else if info.query_name.is_empty() {
        return Err(Error::DnsLogParseFailed("no question in request".to_owned()));
    }

    Ok(info)
}

/*
    uint16 name (or labels)
    uint16 type
    uint16 class
    uint32 ttl
    uint16 rdlength
    bytes  rdata
*/
fn read_answers(msg: &PayloadMessage, mut offset: usize, ancount: u16, info: &mut DnsInfo) {
    for _ in 0..ancount {
        let Ok(next) = skip_domain_name(msg, offset) else {
            break;
        };
        let Some(atype) = msg.read_u16(next) else {
            break;
        };
        let Some(rdlength) = msg.read_u16(next + 8) else {
            break;
        };
        let rdata_offset = next + 10;
        let Some((after, rdata)) = msg.read_bytes(rdata_offset, rdlength as usize) else {
            break;
        };
        match atype {
            DNS_TYPE_A if rdlength == 4 => {
                let ip: [u8; 4] = rdata.try_into().unwrap();
                info.answers.push(Ipv4Addr::from(ip).to_string());
            }
            DNS_TYPE_AAAA if rdlength == 16 => {
                let ip: [u8; 16] = rdata.try_into().unwrap();
                info.answers.push(Ipv6Addr::from(ip).to_string());
            }
            _ => {}
        }
        offset = after;
    }
}

// Walks labels, following at most one level of 0xc0 compression pointers
// per jump, bounded by the maximum encoded name size.
fn read_domain_name(msg: &PayloadMessage, offset: usize) -> Result<(usize, String)> {
    let mut name = String::new();
    let mut cursor = offset;
    // the offset to resume at, set when the first pointer is followed
    let mut resume = None;
    let mut remaining = DNS_NAME_MAX_SIZE;

    loop {
        if remaining == 0 {
            return Err(Error::DnsLogParseFailed("name too long".to_owned()));
        }
        remaining -= 1;
        let len = msg
            .read_u8(cursor)
            .ok_or_else(|| Error::DnsLogParseFailed("name cut short".to_owned()))?;
        if len == 0 {
            cursor += 1;
            break;
        }
        if len & DNS_NAME_COMPRESS_POINTER == DNS_NAME_COMPRESS_POINTER {
            let low = msg
                .read_u8(cursor + 1)
                .ok_or_else(|| Error::DnsLogParseFailed("pointer cut short".to_owned()))?;
            let target = (((len & 0x3f) as usize) << 8) | low as usize;
            if target >= cursor {
                return Err(Error::DnsLogParseFailed("bad compression pointer".to_owned()));
            }
            if resume.is_none() {
                resume = Some(cursor + 2);
            }
            cursor = target;
            continue;
        }
        let (next, label) = msg
            .read_bytes(cursor + 1, len as usize)
            .ok_or_else(|| Error::DnsLogParseFailed("label cut short".to_owned()))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        cursor = next;
    }

    Ok((resume.unwrap_or(cursor), name))
}

fn skip_domain_name(msg: &PayloadMessage, offset: usize) -> Result<usize> {
    let mut cursor = offset;
    let mut remaining = DNS_NAME_MAX_SIZE;
    loop {
        if remaining == 0 {
            return Err(Error::DnsLogParseFailed("name too long".to_owned()));
        }
        remaining -= 1;
        let len = msg
            .read_u8(cursor)
            .ok_or_else(|| Error::DnsLogParseFailed("name cut short".to_owned()))?;
        if len == 0 {
            return Ok(cursor + 1);
        }
        if len & DNS_NAME_COMPRESS_POINTER == DNS_NAME_COMPRESS_POINTER {
            // a pointer ends the name
            return Ok(cursor + 2);
        }
        cursor += 1 + len as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::PacketDirection;

    fn encode_name(name: &str, out: &mut Vec<u8>) {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&id.to_be_bytes());
        p.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        p.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        p.extend_from_slice(&[0; 6]);
        encode_name(name, &mut p);
        p.extend_from_slice(&qtype.to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes()); // IN
        p
    }

    fn response_a(id: u16, name: &str, rcode: u16, answer: Option<[u8; 4]>) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&id.to_be_bytes());
        p.extend_from_slice(&(0x8180u16 | rcode).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        p.extend_from_slice(&(answer.is_some() as u16).to_be_bytes()); // ANCOUNT
        p.extend_from_slice(&[0; 4]);
        encode_name(name, &mut p);
        p.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        if let Some(ip) = answer {
            // compression pointer back to the question name
            p.extend_from_slice(&[0xc0, 0x0c]);
            p.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
            p.extend_from_slice(&1u16.to_be_bytes());
            p.extend_from_slice(&300u32.to_be_bytes());
            p.extend_from_slice(&4u16.to_be_bytes());
            p.extend_from_slice(&ip);
        }
        p
    }

    fn param(proto: IpProtocol, direction: PacketDirection) -> ParseParam {
        ParseParam::new(proto, direction, 53)
    }

    #[test]
    fn parse_a_query_and_response() {
        let mut dns = DnsLog::default();
        let q = query(0x1234, "example.com", DNS_TYPE_A);
        let p = param(IpProtocol::Udp, PacketDirection::ClientToServer);
        assert!(dns.check_payload(&q, &p));
        let info = dns.parse_payload(&q, &p).unwrap().unwrap_single();
        let L7ProtocolInfo::DnsInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.trans_id, 0x1234);
        assert_eq!(info.query_name, "example.com");
        assert_eq!(info.msg_type, LogMessageType::Request);

        let r = response_a(0x1234, "example.com", 0, Some([93, 184, 216, 34]));
        let p = param(IpProtocol::Udp, PacketDirection::ServerToClient);
        let info = dns.parse_payload(&r, &p).unwrap().unwrap_single();
        let L7ProtocolInfo::DnsInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.answers, vec!["93.184.216.34".to_owned()]);
        assert_eq!(info.status_code, Some(0));
        assert!(!info.is_error());

        let mut attrs = AttributeMap::default();
        info.fill_attributes(&mut attrs);
        assert_eq!(
            attrs.get("dns.ip").unwrap().to_string(),
            "93.184.216.34".to_owned()
        );
    }

    #[test]
    fn nxdomain_is_error() {
        let mut dns = DnsLog::default();
        let r = response_a(0x1234, "example.com", 3, None);
        let p = param(IpProtocol::Udp, PacketDirection::ServerToClient);
        let info = dns.parse_payload(&r, &p).unwrap().unwrap_single();
        let L7ProtocolInfo::DnsInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.status_code, Some(3));
        assert!(info.is_error());
    }

    #[test]
    fn reject_bad_opcode_and_rcode() {
        let mut q = query(1, "a.b", DNS_TYPE_A);
        // opcode 3
        q[2] = 0x18;
        assert!(parse_dns_message(&q).is_err());

        let mut r = response_a(1, "a.b", 0, None);
        // rcode 6
        r[3] = (r[3] & 0xf0) | 6;
        assert!(parse_dns_message(&r).is_err());
    }

    #[test]
    fn tcp_length_prefix() {
        let mut dns = DnsLog::default();
        let q = query(7, "example.com", DNS_TYPE_A);
        let mut framed = Vec::from((q.len() as u16).to_be_bytes());
        framed.extend_from_slice(&q);
        let p = param(IpProtocol::Tcp, PacketDirection::ClientToServer);
        let info = dns.parse_payload(&framed, &p).unwrap().unwrap_single();
        let L7ProtocolInfo::DnsInfo(info) = info else {
            unreachable!()
        };
        assert_eq!(info.trans_id, 7);

        // cut mid message: need more bytes
        let err = dns.parse_payload(&framed[..10], &p).unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn matches_by_transaction_id() {
        let info = DnsInfo {
            trans_id: 0x4321,
            ..Default::default()
        };
        assert_eq!(info.session_id(), Some(0x4321));
    }
}
