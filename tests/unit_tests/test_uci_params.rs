// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use uwb_ranging_rs::uci::params::{
    Controlee, FiraAppConfig, MacAddressMode, MulticastAction, RangeDataNtfConfig,
    ReconfigureParams, app_config,
};

fn controlee(addr: u16, key: Option<Vec<u8>>) -> Controlee {
    Controlee {
        short_address: addr,
        sub_session_id: 0x100 + addr as u32,
        sub_session_key: key,
    }
}

#[test]
fn test_multicast_requires_addresses() {
    let params = ReconfigureParams::multicast(MulticastAction::Add, Vec::new());
    assert!(params.validate().is_err());

    let params = ReconfigureParams::multicast(
        MulticastAction::Add,
        vec![controlee(0x0001, None)],
    );
    assert!(params.validate().is_ok());
}

#[test]
fn test_provisioned_sts_key_lengths() {
    let short_ok = ReconfigureParams::multicast(
        MulticastAction::AddWithShortSubSessionKey,
        vec![controlee(0x0001, Some(vec![0u8; 16]))],
    );
    assert!(short_ok.validate().is_ok());

    let short_bad = ReconfigureParams::multicast(
        MulticastAction::AddWithShortSubSessionKey,
        vec![controlee(0x0001, Some(vec![0u8; 32]))],
    );
    assert!(short_bad.validate().is_err());

    let extended_missing = ReconfigureParams::multicast(
        MulticastAction::AddWithExtendedSubSessionKey,
        vec![controlee(0x0001, None)],
    );
    assert!(extended_missing.validate().is_err());

    let extended_ok = ReconfigureParams::multicast(
        MulticastAction::AddWithExtendedSubSessionKey,
        vec![controlee(0x0001, Some(vec![0u8; 32]))],
    );
    assert!(extended_ok.validate().is_ok());
}

#[test]
fn test_action_raw_values() {
    assert_eq!(MulticastAction::Add.to_raw(), 0x00);
    assert_eq!(MulticastAction::Delete.to_raw(), 0x01);
    assert_eq!(MulticastAction::AddWithShortSubSessionKey.to_raw(), 0x02);
    assert_eq!(MulticastAction::AddWithExtendedSubSessionKey.to_raw(), 0x03);
    assert!(MulticastAction::Add.is_add());
    assert!(!MulticastAction::Delete.is_add());
}

#[test]
fn test_ntf_config_delta() {
    let params = ReconfigureParams::ntf_config(RangeDataNtfConfig::Disable);
    assert!(params.validate().is_ok());
    let tlvs = params.to_delta_tlvs();
    assert_eq!(tlvs.len(), 1);
    assert_eq!(tlvs[0].tag, app_config::RNG_DATA_NTF);
    assert_eq!(tlvs[0].value, vec![0x00]);
}

#[test]
fn test_fira_config_tlvs() {
    let cfg = FiraAppConfig {
        device_mac_address: 0x0001,
        dst_mac_addresses: vec![0x0002, 0x0003],
        mac_address_mode: MacAddressMode::Short,
        ..FiraAppConfig::default()
    };
    let tlvs = cfg.to_tlvs();

    let mac_mode = tlvs
        .iter()
        .find(|t| t.tag == app_config::MAC_ADDRESS_MODE)
        .expect("mac address mode");
    assert_eq!(mac_mode.value, vec![0x00]);

    let count = tlvs
        .iter()
        .find(|t| t.tag == app_config::NO_OF_CONTROLEE)
        .expect("controlee count");
    assert_eq!(count.value, vec![2]);

    // Short mode packs two bytes per destination.
    let dst = tlvs
        .iter()
        .find(|t| t.tag == app_config::DST_MAC_ADDRESS)
        .expect("destinations");
    assert_eq!(dst.value, vec![0x00, 0x02, 0x00, 0x03]);
}
