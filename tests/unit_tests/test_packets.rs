// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use uwb_ranging_rs::uci::packets::{DATA_RCV_HEADER_LEN, DataRcvPacket};

fn sample_packet() -> DataRcvPacket {
    DataRcvPacket {
        session_id: 42,
        status: 0,
        sequence_num: 7,
        address: 0x0102,
        src_endpoint: 1,
        dst_endpoint: 2,
        payload: Bytes::from_static(b"hello"),
    }
}

#[test]
fn test_packet_roundtrip() -> Result<()> {
    let packet = sample_packet();
    let bytes = packet.to_bytes();
    assert_eq!(bytes.len(), DATA_RCV_HEADER_LEN + 5);

    let parsed = DataRcvPacket::parse(&bytes)?;
    assert_eq!(parsed, packet);
    Ok(())
}

#[test]
fn test_short_address_is_left_padded_on_wire() {
    let bytes = sample_packet().to_bytes();
    // 8-byte address field always present; short addresses left-padded.
    assert_eq!(&bytes[7..15], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
}

#[test]
fn test_length_validation() {
    let mut truncated = sample_packet().to_bytes().to_vec();
    truncated.pop();
    assert!(DataRcvPacket::parse(&Bytes::from(truncated)).is_err());

    let mut oversized = sample_packet().to_bytes().to_vec();
    oversized.push(0xFF);
    assert!(DataRcvPacket::parse(&Bytes::from(oversized)).is_err());

    assert!(DataRcvPacket::parse(&Bytes::from_static(&[0u8; 5])).is_err());
}
