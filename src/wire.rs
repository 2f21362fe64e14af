// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire packet headers for every packet type the dispatcher handles.
//!
//! Encoding follows an explicit byte-buffer style (no serde): each header
//! exposes `encode(&self) -> Vec<u8>` and `decode(&[u8]) -> Option<Self>`,
//! using network byte order (`to_be_bytes`/`from_be_bytes`) throughout.

use crate::rpc::RpcId;

/// Maximum number of priority cutoff levels carried in a CUTOFFS packet.
pub const MAX_PRIORITIES: usize = 8;

/// Discriminates the eight packet kinds defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Grant,
    Resend,
    Unknown,
    Busy,
    Cutoffs,
    NeedAck,
    Ack,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PacketType::Data,
            1 => PacketType::Grant,
            2 => PacketType::Resend,
            3 => PacketType::Unknown,
            4 => PacketType::Busy,
            5 => PacketType::Cutoffs,
            6 => PacketType::NeedAck,
            7 => PacketType::Ack,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Grant => 1,
            PacketType::Resend => 2,
            PacketType::Unknown => 3,
            PacketType::Busy => 4,
            PacketType::Cutoffs => 5,
            PacketType::NeedAck => 6,
            PacketType::Ack => 7,
        }
    }
}

/// Fields common to every packet, independent of `PacketType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub rpc_id: u64,
    pub sport: u16,
    pub dport: u16,
    pub packet_type: PacketType,
}

impl CommonHeader {
    pub const ENCODED_LEN: usize = 8 + 2 + 2 + 1;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.rpc_id.to_be_bytes());
        out.extend_from_slice(&self.sport.to_be_bytes());
        out.extend_from_slice(&self.dport.to_be_bytes());
        out.push(self.packet_type.as_u8());
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let rpc_id = u64::from_be_bytes(buf[0..8].try_into().ok()?);
        let sport = u16::from_be_bytes(buf[8..10].try_into().ok()?);
        let dport = u16::from_be_bytes(buf[10..12].try_into().ok()?);
        let packet_type = PacketType::from_u8(buf[12])?;
        Some((
            CommonHeader {
                rpc_id,
                sport,
                dport,
                packet_type,
            },
            &buf[Self::ENCODED_LEN..],
        ))
    }

    pub fn rpc_id(&self) -> RpcId {
        RpcId::new(self.rpc_id)
    }
}

/// Optional ACK piggybacked on a DATA packet's trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiggybackAck {
    pub acked_rpc: u64,
}

/// `DATA` — carries one segment of a message plus scheduling metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub message_length: u64,
    pub incoming: u64,
    pub cutoff_version: u16,
    pub retransmit: bool,
    pub offset: u64,
    pub segment_length: u32,
    pub ack: Option<PiggybackAck>,
    pub payload: Vec<u8>,
}

impl DataHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.payload.len());
        out.extend_from_slice(&self.message_length.to_be_bytes());
        out.extend_from_slice(&self.incoming.to_be_bytes());
        out.extend_from_slice(&self.cutoff_version.to_be_bytes());
        out.push(self.retransmit as u8);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.segment_length.to_be_bytes());
        match self.ack {
            Some(ack) => {
                out.push(1);
                out.extend_from_slice(&ack.acked_rpc.to_be_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 31 {
            return None;
        }
        let message_length = u64::from_be_bytes(buf[0..8].try_into().ok()?);
        let incoming = u64::from_be_bytes(buf[8..16].try_into().ok()?);
        let cutoff_version = u16::from_be_bytes(buf[16..18].try_into().ok()?);
        let retransmit = buf[18] != 0;
        let offset = u64::from_be_bytes(buf[19..27].try_into().ok()?);
        let segment_length = u32::from_be_bytes(buf[27..31].try_into().ok()?);
        let has_ack = *buf.get(31)?;
        let (ack, payload_start) = if has_ack != 0 {
            let acked_rpc = u64::from_be_bytes(buf.get(32..40)?.try_into().ok()?);
            (Some(PiggybackAck { acked_rpc }), 40)
        } else {
            (None, 32)
        };
        let payload = buf.get(payload_start..)?.to_vec();
        Some(DataHeader {
            message_length,
            incoming,
            cutoff_version,
            retransmit,
            offset,
            segment_length,
            ack,
            payload,
        })
    }
}

/// `GRANT` — authorizes the sender to transmit `offset` more bytes at
/// `priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantHeader {
    pub offset: u64,
    pub priority: u8,
    pub resend_all: bool,
}

impl GrantHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.push(self.priority);
        out.push(self.resend_all as u8);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 10 {
            return None;
        }
        Some(GrantHeader {
            offset: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            priority: buf[8],
            resend_all: buf[9] != 0,
        })
    }
}

/// `RESEND` — requests retransmission of `[offset, offset+length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendHeader {
    pub offset: u64,
    pub length: u32,
    pub priority: u8,
}

impl ResendHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.push(self.priority);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 13 {
            return None;
        }
        Some(ResendHeader {
            offset: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            length: u32::from_be_bytes(buf[8..12].try_into().ok()?),
            priority: buf[12],
        })
    }
}

/// `CUTOFFS` — announces the sender's unscheduled-byte cutoff per priority
/// level, versioned so stale copies can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoffsHeader {
    pub unsched_cutoffs: [u32; MAX_PRIORITIES],
    pub cutoff_version: u16,
}

impl CutoffsHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_PRIORITIES * 4 + 2);
        for c in &self.unsched_cutoffs {
            out.extend_from_slice(&c.to_be_bytes());
        }
        out.extend_from_slice(&self.cutoff_version.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < MAX_PRIORITIES * 4 + 2 {
            return None;
        }
        let mut cutoffs = [0u32; MAX_PRIORITIES];
        for (i, c) in cutoffs.iter_mut().enumerate() {
            *c = u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().ok()?);
        }
        let cutoff_version = u16::from_be_bytes(
            buf[MAX_PRIORITIES * 4..MAX_PRIORITIES * 4 + 2]
                .try_into()
                .ok()?,
        );
        Some(CutoffsHeader {
            unsched_cutoffs: cutoffs,
            cutoff_version,
        })
    }
}

/// `BUSY` — sender signals it cannot accept a grant-driven burst right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyHeader;

/// `NEED_ACK` — sender asks whether the receiver still has state for this
/// RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedAckHeader;

/// `ACK` — confirms receipt of one or more completed RPCs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHeader {
    pub acked: Vec<u64>,
}

impl AckHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.acked.len() * 8);
        out.extend_from_slice(&(self.acked.len() as u16).to_be_bytes());
        for id in &self.acked {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }
        let count = u16::from_be_bytes(buf[0..2].try_into().ok()?) as usize;
        let mut acked = Vec::with_capacity(count);
        let mut pos = 2;
        for _ in 0..count {
            acked.push(u64::from_be_bytes(buf.get(pos..pos + 8)?.try_into().ok()?));
            pos += 8;
        }
        Some(AckHeader { acked })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_round_trips() {
        let hdr = CommonHeader {
            rpc_id: 0xdead_beef,
            sport: 4000,
            dport: 80,
            packet_type: PacketType::Grant,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let (decoded, rest) = CommonHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert!(rest.is_empty());
    }

    #[test]
    fn data_header_round_trips_with_ack() {
        let hdr = DataHeader {
            message_length: 5000,
            incoming: 2000,
            cutoff_version: 3,
            retransmit: true,
            offset: 1400,
            segment_length: 1400,
            ack: Some(PiggybackAck { acked_rpc: 77 }),
            payload: vec![1, 2, 3, 4],
        };
        let buf = hdr.encode();
        let decoded = DataHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn grant_header_round_trips() {
        let hdr = GrantHeader {
            offset: 9000,
            priority: 5,
            resend_all: false,
        };
        let buf = hdr.encode();
        assert_eq!(GrantHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn ack_header_round_trips_multiple() {
        let hdr = AckHeader {
            acked: vec![1, 2, 3],
        };
        let buf = hdr.encode();
        assert_eq!(AckHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn truncated_buffer_fails_to_decode() {
        assert!(GrantHeader::decode(&[0u8; 3]).is_none());
        assert!(CommonHeader::decode(&[0u8; 2]).is_none());
    }
}
