// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail, ensure};

/// UCI session type byte used in SESSION_INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Ranging,
    DataTransfer,
    Ccc,
}

impl SessionType {
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Ranging => 0x00,
            Self::DataTransfer => 0x01,
            Self::Ccc => 0xA0,
        }
    }
}

/// Which service protocol owns a session's parameter space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Fira,
    Ccc,
}

/// MAC addressing mode negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAddressMode {
    /// 2-byte addresses.
    Short,
    /// 8-byte addresses.
    Extended,
}

impl MacAddressMode {
    pub fn address_len(&self) -> usize {
        match self {
            Self::Short => 2,
            Self::Extended => 8,
        }
    }
}

/// RANGE_DATA_NTF_CONFIG values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDataNtfConfig {
    Disable,
    Enable,
    EnableProximity,
}

impl RangeDataNtfConfig {
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Disable => 0x00,
            Self::Enable => 0x01,
            Self::EnableProximity => 0x02,
        }
    }
}

/// One applied app configuration parameter, as handed to
/// SESSION_SET_APP_CONFIG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigTlv {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl AppConfigTlv {
    pub fn new(tag: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

/// App-config parameter ids we emit.
pub mod app_config {
    pub const DEVICE_TYPE: u8 = 0x00;
    pub const RANGING_ROUND_USAGE: u8 = 0x01;
    pub const STS_CONFIG: u8 = 0x02;
    pub const MULTI_NODE_MODE: u8 = 0x03;
    pub const CHANNEL_NUMBER: u8 = 0x04;
    pub const NO_OF_CONTROLEE: u8 = 0x05;
    pub const DEVICE_MAC_ADDRESS: u8 = 0x06;
    pub const DST_MAC_ADDRESS: u8 = 0x07;
    pub const RANGING_DURATION: u8 = 0x09;
    pub const RNG_DATA_NTF: u8 = 0x0E;
    pub const DEVICE_ROLE: u8 = 0x11;
    pub const MAC_ADDRESS_MODE: u8 = 0x26;
    pub const SESSION_KEY: u8 = 0x45;
    pub const SUB_SESSION_KEY: u8 = 0x46;
}

pub const RANGING_ROUND_USAGE_OWR_AOA: u8 = 0x05;
pub const DEVICE_ROLE_OBSERVER: u8 = 0x06;

/// Protocol-specific open parameters. The FiRa variant is the one this
/// core drives end-to-end; CCC sessions reuse the lifecycle with an
/// opaque parameter blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParams {
    Fira(FiraAppConfig),
    Ccc(Vec<AppConfigTlv>),
}

impl ProtocolParams {
    pub fn to_tlvs(&self) -> Vec<AppConfigTlv> {
        match self {
            Self::Fira(cfg) => cfg.to_tlvs(),
            Self::Ccc(tlvs) => tlvs.clone(),
        }
    }

    pub fn fira(&self) -> Option<&FiraAppConfig> {
        match self {
            Self::Fira(cfg) => Some(cfg),
            Self::Ccc(_) => None,
        }
    }
}

/// FiRa open-session parameters the service cares about. Everything
/// else rides along in `vendor_tlvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiraAppConfig {
    pub device_type: u8,
    pub device_role: u8,
    pub ranging_round_usage: u8,
    pub multi_node_mode: u8,
    pub channel: u8,
    pub device_mac_address: u64,
    pub dst_mac_addresses: Vec<u64>,
    pub ranging_duration_ms: u32,
    pub mac_address_mode: MacAddressMode,
    pub range_data_ntf_config: RangeDataNtfConfig,
    pub vendor_tlvs: Vec<AppConfigTlv>,
}

impl Default for FiraAppConfig {
    fn default() -> Self {
        Self {
            device_type: 0x01,
            device_role: 0x01,
            ranging_round_usage: 0x02,
            multi_node_mode: 0x00,
            channel: 9,
            device_mac_address: 0x0001,
            dst_mac_addresses: Vec::new(),
            ranging_duration_ms: 200,
            mac_address_mode: MacAddressMode::Short,
            range_data_ntf_config: RangeDataNtfConfig::Enable,
            vendor_tlvs: Vec::new(),
        }
    }
}

impl FiraAppConfig {
    pub fn is_owr_aoa_observer(&self) -> bool {
        self.ranging_round_usage == RANGING_ROUND_USAGE_OWR_AOA
            && self.device_role == DEVICE_ROLE_OBSERVER
    }

    fn mac_bytes(&self, addr: u64) -> Vec<u8> {
        match self.mac_address_mode {
            MacAddressMode::Short => (addr as u16).to_be_bytes().to_vec(),
            MacAddressMode::Extended => addr.to_be_bytes().to_vec(),
        }
    }

    pub fn to_tlvs(&self) -> Vec<AppConfigTlv> {
        let mut out = vec![
            AppConfigTlv::new(app_config::DEVICE_TYPE, vec![self.device_type]),
            AppConfigTlv::new(app_config::DEVICE_ROLE, vec![self.device_role]),
            AppConfigTlv::new(
                app_config::RANGING_ROUND_USAGE,
                vec![self.ranging_round_usage],
            ),
            AppConfigTlv::new(app_config::MULTI_NODE_MODE, vec![self.multi_node_mode]),
            AppConfigTlv::new(app_config::CHANNEL_NUMBER, vec![self.channel]),
            AppConfigTlv::new(
                app_config::MAC_ADDRESS_MODE,
                vec![match self.mac_address_mode {
                    MacAddressMode::Short => 0x00,
                    MacAddressMode::Extended => 0x02,
                }],
            ),
            AppConfigTlv::new(
                app_config::DEVICE_MAC_ADDRESS,
                self.mac_bytes(self.device_mac_address),
            ),
            AppConfigTlv::new(
                app_config::RANGING_DURATION,
                self.ranging_duration_ms.to_be_bytes().to_vec(),
            ),
            AppConfigTlv::new(
                app_config::RNG_DATA_NTF,
                vec![self.range_data_ntf_config.to_raw()],
            ),
        ];
        if !self.dst_mac_addresses.is_empty() {
            out.push(AppConfigTlv::new(
                app_config::NO_OF_CONTROLEE,
                vec![self.dst_mac_addresses.len() as u8],
            ));
            let mut addrs = Vec::new();
            for addr in &self.dst_mac_addresses {
                addrs.extend_from_slice(&self.mac_bytes(*addr));
            }
            out.push(AppConfigTlv::new(app_config::DST_MAC_ADDRESS, addrs));
        }
        out.extend(self.vendor_tlvs.iter().cloned());
        out
    }
}

/// SESSION_UPDATE_CONTROLLER_MULTICAST_LIST action byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastAction {
    Add,
    Delete,
    AddWithShortSubSessionKey,
    AddWithExtendedSubSessionKey,
}

impl MulticastAction {
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Add => 0x00,
            Self::Delete => 0x01,
            Self::AddWithShortSubSessionKey => 0x02,
            Self::AddWithExtendedSubSessionKey => 0x03,
        }
    }

    pub fn requires_sub_session_key(&self) -> Option<usize> {
        match self {
            Self::AddWithShortSubSessionKey => Some(16),
            Self::AddWithExtendedSubSessionKey => Some(32),
            _ => None,
        }
    }

    pub fn is_add(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// One controlee entry in a multicast update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controlee {
    pub short_address: u16,
    pub sub_session_id: u32,
    pub sub_session_key: Option<Vec<u8>>,
}

/// Payload of a reconfigure call: either a multicast list mutation or a
/// plain app-config delta (no action).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureParams {
    pub action: Option<MulticastAction>,
    pub controlees: Vec<Controlee>,
    pub range_data_ntf_config: Option<RangeDataNtfConfig>,
    pub app_config_deltas: Vec<AppConfigTlv>,
}

impl ReconfigureParams {
    pub fn multicast(action: MulticastAction, controlees: Vec<Controlee>) -> Self {
        Self {
            action: Some(action),
            controlees,
            range_data_ntf_config: None,
            app_config_deltas: Vec::new(),
        }
    }

    pub fn ntf_config(config: RangeDataNtfConfig) -> Self {
        Self {
            action: None,
            controlees: Vec::new(),
            range_data_ntf_config: Some(config),
            app_config_deltas: Vec::new(),
        }
    }

    /// Multicast updates must carry the address list and, for the
    /// provisioned-STS add variants, keys of the exact length.
    pub fn validate(&self) -> Result<()> {
        let Some(action) = self.action else {
            return Ok(());
        };
        ensure!(
            !self.controlees.is_empty(),
            "multicast update without an address list"
        );
        if let Some(key_len) = action.requires_sub_session_key() {
            for c in &self.controlees {
                match &c.sub_session_key {
                    Some(key) if key.len() == key_len => {},
                    Some(key) => bail!(
                        "sub-session key for 0x{:04X} must be {key_len} bytes, got {}",
                        c.short_address,
                        key.len()
                    ),
                    None => bail!(
                        "action requires a {key_len}-byte sub-session key for 0x{:04X}",
                        c.short_address
                    ),
                }
            }
        }
        Ok(())
    }

    pub fn to_delta_tlvs(&self) -> Vec<AppConfigTlv> {
        let mut out = self.app_config_deltas.clone();
        if let Some(cfg) = self.range_data_ntf_config {
            out.push(AppConfigTlv::new(app_config::RNG_DATA_NTF, vec![cfg.to_raw()]));
        }
        out
    }
}
