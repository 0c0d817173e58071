// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, ensure};
use rand::Rng;

use crate::models::{
    csml::common::SESSION_DATA_DO,
    tlv::{Tag, Tlv, TlvBuilder},
};

const VERSION_TAG: Tag = Tag::new(0x80);
const SESSION_ID_TAG: Tag = Tag::new(0x81);
const SUB_SESSION_ID_TAG: Tag = Tag::new(0x82);
const CONFIGURATION_PARAMS_TAG: Tag = Tag::new(0xA3);
const SECURE_RANGING_INFO_TAG: Tag = Tag::new(0xA4);

const PHY_VERSION_TAG: Tag = Tag::new(0x80);
const MAC_VERSION_TAG: Tag = Tag::new(0x81);
const DEVICE_ROLE_TAG: Tag = Tag::new(0x82);
const RANGING_METHOD_TAG: Tag = Tag::new(0x83);
const STS_CONFIG_TAG: Tag = Tag::new(0x84);
const MULTI_NODE_MODE_TAG: Tag = Tag::new(0x85);
const CHANNEL_TAG: Tag = Tag::new(0x86);
const PRF_MODE_TAG: Tag = Tag::new(0x87);
const SLOT_DURATION_TAG: Tag = Tag::new(0x88);
const RANGING_INTERVAL_TAG: Tag = Tag::new(0x89);
const MAC_ADDRESS_MODE_TAG: Tag = Tag::new(0x8A);

const SESSION_KEY_TAG: Tag = Tag::new(0x80);
const SUB_SESSION_KEY_TAG: Tag = Tag::new(0x81);

/// MAC address mode byte inside configuration params: `0` short (2-byte
/// addresses), `2` extended (8-byte).
pub const MAC_ADDRESS_MODE_SHORT: u8 = 0x00;
pub const MAC_ADDRESS_MODE_EXTENDED: u8 = 0x02;

/// Ranging parameters both parties must agree on, nested under `A3`.
/// Unknown DOs are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationParams {
    pub phy_version: [u8; 2],
    pub mac_version: [u8; 2],
    pub device_role: u8,
    pub ranging_method: u8,
    pub sts_config: u8,
    pub multi_node_mode: u8,
    pub channel: u8,
    pub prf_mode: u8,
    pub slot_duration_rstu: u16,
    pub ranging_interval_ms: u16,
    pub mac_address_mode: u8,
    pub extra: Vec<Tlv>,
}

impl Default for ConfigurationParams {
    fn default() -> Self {
        Self {
            phy_version: [0x01, 0x01],
            mac_version: [0x01, 0x01],
            device_role: 0x00,
            ranging_method: 0x02,
            sts_config: 0x01,
            multi_node_mode: 0x00,
            channel: 9,
            prf_mode: 0x00,
            slot_duration_rstu: 2400,
            ranging_interval_ms: 200,
            mac_address_mode: MAC_ADDRESS_MODE_SHORT,
            extra: Vec::new(),
        }
    }
}

impl ConfigurationParams {
    fn to_builder(&self) -> TlvBuilder {
        let mut b = TlvBuilder::new()
            .put(PHY_VERSION_TAG, self.phy_version.to_vec())
            .put(MAC_VERSION_TAG, self.mac_version.to_vec())
            .put_u8(DEVICE_ROLE_TAG, self.device_role)
            .put_u8(RANGING_METHOD_TAG, self.ranging_method)
            .put_u8(STS_CONFIG_TAG, self.sts_config)
            .put_u8(MULTI_NODE_MODE_TAG, self.multi_node_mode)
            .put_u8(CHANNEL_TAG, self.channel)
            .put_u8(PRF_MODE_TAG, self.prf_mode)
            .put_u16(SLOT_DURATION_TAG, self.slot_duration_rstu)
            .put_u16(RANGING_INTERVAL_TAG, self.ranging_interval_ms)
            .put_u8(MAC_ADDRESS_MODE_TAG, self.mac_address_mode);
        for tlv in &self.extra {
            b = b.put(tlv.tag, tlv.value.clone());
        }
        b
    }

    fn parse(template: &Tlv) -> Result<Self> {
        let mut params = Self::default();
        params.extra.clear();
        for tlv in template.children()?.into_iter() {
            match tlv.tag {
                PHY_VERSION_TAG => params.phy_version = fixed2(&tlv, "phy version")?,
                MAC_VERSION_TAG => params.mac_version = fixed2(&tlv, "mac version")?,
                DEVICE_ROLE_TAG => params.device_role = single(&tlv)?,
                RANGING_METHOD_TAG => params.ranging_method = single(&tlv)?,
                STS_CONFIG_TAG => params.sts_config = single(&tlv)?,
                MULTI_NODE_MODE_TAG => params.multi_node_mode = single(&tlv)?,
                CHANNEL_TAG => params.channel = single(&tlv)?,
                PRF_MODE_TAG => params.prf_mode = single(&tlv)?,
                SLOT_DURATION_TAG => {
                    params.slot_duration_rstu = be16(&tlv, "slot duration")?;
                },
                RANGING_INTERVAL_TAG => {
                    params.ranging_interval_ms = be16(&tlv, "ranging interval")?;
                },
                MAC_ADDRESS_MODE_TAG => params.mac_address_mode = single(&tlv)?,
                _ => params.extra.push(tlv),
            }
        }
        Ok(params)
    }
}

/// STS key material nested under `A4`: 256-bit session key, plus the
/// sub-session key for multicast controlees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureRangingInfo {
    pub session_key: Vec<u8>,
    pub sub_session_key: Option<Vec<u8>>,
}

impl SecureRangingInfo {
    pub const KEY_LEN: usize = 32;

    /// Fresh random key material for a controller generating session
    /// data.
    pub fn random(with_sub_session_key: bool) -> Self {
        let mut rng = rand::rng();
        let mut session_key = vec![0u8; Self::KEY_LEN];
        rng.fill_bytes(&mut session_key);
        let sub_session_key = with_sub_session_key.then(|| {
            let mut key = vec![0u8; Self::KEY_LEN];
            rng.fill_bytes(&mut key);
            key
        });
        Self {
            session_key,
            sub_session_key,
        }
    }

    fn parse(template: &Tlv) -> Result<Self> {
        let children = template.children()?;
        let session_key = children.require(SESSION_KEY_TAG)?.value.clone();
        ensure!(!session_key.is_empty(), "empty session key DO");
        Ok(Self {
            session_key,
            sub_session_key: children
                .get_first(SUB_SESSION_KEY_TAG)
                .map(|t| t.value.clone()),
        })
    }
}

/// The `BF78` session data DO exchanged during the dynamic-STS dialog
/// and finally installed into the UCI session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub version: [u8; 2],
    pub session_id: Option<u32>,
    pub sub_session_id: Option<u32>,
    pub configuration_params: Option<ConfigurationParams>,
    pub secure_ranging_info: Option<SecureRangingInfo>,
    pub extra: Vec<Tlv>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            version: [0x01, 0x00],
            session_id: None,
            sub_session_id: None,
            configuration_params: None,
            secure_ranging_info: None,
            extra: Vec::new(),
        }
    }
}

impl SessionData {
    /// Minimal session data standing in when the applet handed out a
    /// default session id and no DO was exchanged.
    pub fn for_default_session(session_id: u32) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = TlvBuilder::new().put(VERSION_TAG, self.version.to_vec());
        if let Some(id) = self.session_id {
            body = body.put_u32(SESSION_ID_TAG, id);
        }
        if let Some(id) = self.sub_session_id {
            body = body.put_u32(SUB_SESSION_ID_TAG, id);
        }
        if let Some(params) = &self.configuration_params {
            body = body.put_children(CONFIGURATION_PARAMS_TAG, params.to_builder());
        }
        if let Some(info) = &self.secure_ranging_info {
            let mut sri = TlvBuilder::new().put(SESSION_KEY_TAG, info.session_key.clone());
            if let Some(key) = &info.sub_session_key {
                sri = sri.put(SUB_SESSION_KEY_TAG, key.clone());
            }
            body = body.put_children(SECURE_RANGING_INFO_TAG, sri);
        }
        for tlv in &self.extra {
            body = body.put(tlv.tag, tlv.value.clone());
        }
        TlvBuilder::new().put_children(SESSION_DATA_DO, body).build()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let outer = Tlv::parse_all(buf)?;
        let body = outer.require(SESSION_DATA_DO)?.children()?;

        let version_do = body.require(VERSION_TAG)?;
        ensure!(version_do.value.len() == 2, "session data version must be 2 bytes");

        let mut data = Self {
            version: [version_do.value[0], version_do.value[1]],
            ..Self::default()
        };
        for tlv in body.into_iter() {
            match tlv.tag {
                VERSION_TAG => {},
                SESSION_ID_TAG => data.session_id = Some(be32(&tlv, "session id")?),
                SUB_SESSION_ID_TAG => {
                    data.sub_session_id = Some(be32(&tlv, "sub-session id")?);
                },
                CONFIGURATION_PARAMS_TAG => {
                    data.configuration_params = Some(ConfigurationParams::parse(&tlv)?);
                },
                SECURE_RANGING_INFO_TAG => {
                    data.secure_ranging_info = Some(SecureRangingInfo::parse(&tlv)?);
                },
                _ => data.extra.push(tlv),
            }
        }
        Ok(data)
    }
}

fn single(tlv: &Tlv) -> Result<u8> {
    ensure!(tlv.value.len() == 1, "DO {} must be 1 byte", tlv.tag);
    Ok(tlv.value[0])
}

fn fixed2(tlv: &Tlv, what: &str) -> Result<[u8; 2]> {
    ensure!(tlv.value.len() == 2, "{what} must be 2 bytes");
    Ok([tlv.value[0], tlv.value[1]])
}

fn be16(tlv: &Tlv, what: &str) -> Result<u16> {
    ensure!(tlv.value.len() == 2, "{what} must be 2 bytes");
    Ok(u16::from_be_bytes([tlv.value[0], tlv.value[1]]))
}

fn be32(tlv: &Tlv, what: &str) -> Result<u32> {
    ensure!(tlv.value.len() == 4, "{what} must be 4 bytes");
    Ok(u32::from_be_bytes([
        tlv.value[0],
        tlv.value[1],
        tlv.value[2],
        tlv.value[3],
    ]))
}
