// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use uwb_ranging_rs::models::{
    csml::{
        controlee_info::ControleeInfo,
        session_data::{
            ConfigurationParams, MAC_ADDRESS_MODE_EXTENDED, SecureRangingInfo,
            SessionData,
        },
    },
    tlv::{Tlv, TlvBuilder},
};

#[test]
fn test_controlee_info_roundtrip() -> Result<()> {
    let info = ControleeInfo {
        version: [0x01, 0x01],
        phy_version_range: [0x01, 0x01, 0x02, 0x00],
        mac_version_range: [0x01, 0x01, 0x01, 0x03],
        device_roles: 0x03,
        ranging_methods: 0x02,
        sts_configs: 0x01,
        channels: vec![5, 9],
        extra: vec![Tlv::new(0xD0u16, vec![0x7F])],
    };

    let bytes = info.to_bytes();
    assert_eq!(&bytes[..2], &[0xBF, 0x70]);

    let parsed = ControleeInfo::from_bytes(&bytes)?;
    assert_eq!(parsed, info);
    // Unknown DOs survive the second trip byte-for-byte.
    assert_eq!(parsed.to_bytes(), bytes);
    Ok(())
}

#[test]
fn test_controlee_info_rejects_garbage() {
    assert!(ControleeInfo::from_bytes(&[0x80, 0x01, 0x00]).is_err());
    let missing_version = TlvBuilder::new()
        .put_children(0xBF70u16, TlvBuilder::new().put_u8(0xA3u16, 0x00))
        .build();
    assert!(ControleeInfo::from_bytes(&missing_version).is_err());
}

#[test]
fn test_session_data_roundtrip_with_keys() -> Result<()> {
    let data = SessionData {
        version: [0x01, 0x00],
        session_id: Some(0x1234_5678),
        sub_session_id: Some(0x0000_0042),
        configuration_params: Some(ConfigurationParams {
            mac_address_mode: MAC_ADDRESS_MODE_EXTENDED,
            ranging_interval_ms: 240,
            extra: vec![Tlv::new(0xE3u16, vec![0x01, 0x02])],
            ..ConfigurationParams::default()
        }),
        secure_ranging_info: Some(SecureRangingInfo::random(true)),
        extra: vec![Tlv::new(0xCFu16, vec![])],
    };

    let bytes = data.to_bytes();
    assert_eq!(&bytes[..2], &[0xBF, 0x78]);

    let parsed = SessionData::from_bytes(&bytes)?;
    assert_eq!(parsed, data);
    assert_eq!(parsed.session_id(), Some(0x1234_5678));

    let sri = parsed.secure_ranging_info.expect("keys");
    assert_eq!(sri.session_key.len(), SecureRangingInfo::KEY_LEN);
    assert_eq!(
        sri.sub_session_key.map(|k| k.len()),
        Some(SecureRangingInfo::KEY_LEN)
    );
    Ok(())
}

#[test]
fn test_session_data_minimal_default() -> Result<()> {
    let data = SessionData::for_default_session(77);
    assert_eq!(data.to_bytes(), hex!("BF780A8002010081040000004D"));

    let parsed = SessionData::from_bytes(&data.to_bytes())?;
    assert_eq!(parsed.session_id(), Some(77));
    assert!(parsed.configuration_params.is_none());
    assert!(parsed.secure_ranging_info.is_none());
    Ok(())
}

#[test]
fn test_random_keys_are_distinct() {
    let a = SecureRangingInfo::random(false);
    let b = SecureRangingInfo::random(false);
    assert_ne!(a.session_key, b.session_key);
    assert!(a.sub_session_key.is_none());
}
