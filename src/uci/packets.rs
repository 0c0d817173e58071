// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail, ensure};
use bytes::Bytes;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

pub const DATA_RCV_HEADER_LEN: usize = 19;

/// Fixed header of a DATA_MESSAGE_RCV packet. The remote address is
/// always 8 bytes on the wire; short MAC addresses arrive left-padded
/// with zeros.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DataRcvHeader {
    pub session_id: U32<BigEndian>,   // 0..4
    pub status: u8,                   // 4
    pub sequence_num: U16<BigEndian>, // 5..7
    pub address: [u8; 8],             // 7..15
    pub src_endpoint: u8,             // 15
    pub dst_endpoint: u8,             // 16
    pub payload_len: U16<BigEndian>,  // 17..19
}

/// One parsed inbound application-data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRcvPacket {
    pub session_id: u32,
    pub status: u8,
    pub sequence_num: u16,
    /// Extended (8-byte) remote address, big-endian packed into a u64.
    pub address: u64,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub payload: Bytes,
}

impl DataRcvPacket {
    pub fn parse(buf: &Bytes) -> Result<Self> {
        ensure!(
            buf.len() >= DATA_RCV_HEADER_LEN,
            "data packet shorter than header: {} bytes",
            buf.len()
        );
        let hdr = DataRcvHeader::ref_from_bytes(&buf[..DATA_RCV_HEADER_LEN])
            .map_err(|e| anyhow::anyhow!("failed to read data packet header: {e}"))?;

        let payload_len = hdr.payload_len.get() as usize;
        if buf.len() != DATA_RCV_HEADER_LEN + payload_len {
            bail!(
                "data packet length mismatch: header says {payload_len}, have {}",
                buf.len() - DATA_RCV_HEADER_LEN
            );
        }

        Ok(Self {
            session_id: hdr.session_id.get(),
            status: hdr.status,
            sequence_num: hdr.sequence_num.get(),
            address: u64::from_be_bytes(hdr.address),
            src_endpoint: hdr.src_endpoint,
            dst_endpoint: hdr.dst_endpoint,
            payload: buf.slice(DATA_RCV_HEADER_LEN..),
        })
    }

    /// Wire-encode; used by the in-process device in tests.
    pub fn to_bytes(&self) -> Bytes {
        let hdr = DataRcvHeader {
            session_id: U32::new(self.session_id),
            status: self.status,
            sequence_num: U16::new(self.sequence_num),
            address: self.address.to_be_bytes(),
            src_endpoint: self.src_endpoint,
            dst_endpoint: self.dst_endpoint,
            payload_len: U16::new(self.payload.len() as u16),
        };
        let mut out = Vec::with_capacity(DATA_RCV_HEADER_LEN + self.payload.len());
        out.extend_from_slice(hdr.as_bytes());
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }
}
