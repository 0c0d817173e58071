// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, ensure};

use crate::models::{
    csml::common::CONTROLEE_INFO_DO,
    tlv::{Tag, Tlv, TlvBuilder},
};

const VERSION_TAG: Tag = Tag::new(0x80);
const CAPABILITY_TEMPLATE_TAG: Tag = Tag::new(0xA3);

const PHY_VERSION_RANGE_TAG: Tag = Tag::new(0x80);
const MAC_VERSION_RANGE_TAG: Tag = Tag::new(0x81);
const DEVICE_ROLES_TAG: Tag = Tag::new(0x82);
const RANGING_METHODS_TAG: Tag = Tag::new(0x83);
const STS_CONFIGS_TAG: Tag = Tag::new(0x84);
const CHANNELS_TAG: Tag = Tag::new(0x85);

/// UWB capabilities a controlee advertises during dynamic-STS
/// provisioning (`BF70`). Unrecognized DOs survive re-encoding
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControleeInfo {
    pub version: [u8; 2],
    pub phy_version_range: [u8; 4],
    pub mac_version_range: [u8; 4],
    pub device_roles: u8,
    pub ranging_methods: u8,
    pub sts_configs: u8,
    pub channels: Vec<u8>,
    /// DOs inside the capability template we do not model.
    pub extra: Vec<Tlv>,
}

impl Default for ControleeInfo {
    fn default() -> Self {
        Self {
            version: [0x01, 0x00],
            phy_version_range: [0x01, 0x01, 0x01, 0x03],
            mac_version_range: [0x01, 0x01, 0x01, 0x03],
            device_roles: 0x00,
            ranging_methods: 0x00,
            sts_configs: 0x00,
            channels: vec![9],
            extra: Vec::new(),
        }
    }
}

impl ControleeInfo {
    /// Encode the capability template and wrap it in `BF70`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut caps = TlvBuilder::new()
            .put(PHY_VERSION_RANGE_TAG, self.phy_version_range.to_vec())
            .put(MAC_VERSION_RANGE_TAG, self.mac_version_range.to_vec())
            .put_u8(DEVICE_ROLES_TAG, self.device_roles)
            .put_u8(RANGING_METHODS_TAG, self.ranging_methods)
            .put_u8(STS_CONFIGS_TAG, self.sts_configs)
            .put(CHANNELS_TAG, self.channels.clone());
        for tlv in &self.extra {
            caps = caps.put(tlv.tag, tlv.value.clone());
        }

        TlvBuilder::new()
            .put_children(
                CONTROLEE_INFO_DO,
                TlvBuilder::new()
                    .put(VERSION_TAG, self.version.to_vec())
                    .put_children(CAPABILITY_TEMPLATE_TAG, caps),
            )
            .build()
    }

    /// Parse a `BF70`-wrapped controlee info DO.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let outer = Tlv::parse_all(buf)?;
        let body = outer.require(CONTROLEE_INFO_DO)?.children()?;

        let version = body.require(VERSION_TAG)?;
        ensure!(version.value.len() == 2, "controlee info version must be 2 bytes");

        let mut info = Self {
            version: [version.value[0], version.value[1]],
            ..Self::default()
        };
        info.channels.clear();
        info.extra.clear();

        if let Some(caps) = body.get_first(CAPABILITY_TEMPLATE_TAG) {
            for tlv in caps.children()?.into_iter() {
                match tlv.tag {
                    PHY_VERSION_RANGE_TAG => {
                        info.phy_version_range = fixed4(&tlv, "phy version range")?;
                    },
                    MAC_VERSION_RANGE_TAG => {
                        info.mac_version_range = fixed4(&tlv, "mac version range")?;
                    },
                    DEVICE_ROLES_TAG => info.device_roles = single(&tlv)?,
                    RANGING_METHODS_TAG => info.ranging_methods = single(&tlv)?,
                    STS_CONFIGS_TAG => info.sts_configs = single(&tlv)?,
                    CHANNELS_TAG => info.channels = tlv.value,
                    _ => info.extra.push(tlv),
                }
            }
        }
        Ok(info)
    }
}

fn fixed4(tlv: &Tlv, what: &str) -> Result<[u8; 4]> {
    ensure!(tlv.value.len() == 4, "{what} must be 4 bytes");
    Ok([tlv.value[0], tlv.value[1], tlv.value[2], tlv.value[3]])
}

fn single(tlv: &Tlv) -> Result<u8> {
    ensure!(tlv.value.len() == 1, "DO {} must be 1 byte", tlv.tag);
    Ok(tlv.value[0])
}
