// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail, ensure};
use tracing::warn;

use crate::models::{
    apdu::response::ResponseApdu,
    csml::common::{FiRaCommand, INS_DISPATCH, Oid},
    tlv::{Tag, Tlv, TlvBuilder},
};

const PAYLOAD_TAG: Tag = Tag::new(0x81);

const STATUS_TAG: Tag = Tag::new(0x80);
const DATA_TAG: Tag = Tag::new(0x81);
const NOTIFICATION_TEMPLATE_TAG: Tag = Tag::new(0xE1);

const NOTIFICATION_FORMAT_TAG: Tag = Tag::new(0x80);
const NOTIFICATION_ID_TAG: Tag = Tag::new(0x81);
const NOTIFICATION_DATA_TAG: Tag = Tag::new(0x82);

const NOTIFICATION_ID_ADF_SELECTED: u8 = 0x00;
const NOTIFICATION_ID_SECURE_CHANNEL_ESTABLISHED: u8 = 0x01;
const NOTIFICATION_ID_SECURE_SESSION_ABORTED: u8 = 0x02;
const NOTIFICATION_ID_CONTROLEE_INFO_AVAILABLE: u8 = 0x03;
const NOTIFICATION_ID_RDS_AVAILABLE: u8 = 0x04;

const RDS_SESSION_ID_TAG: Tag = Tag::new(0x80);
const RDS_ARBITRARY_DATA_TAG: Tag = Tag::new(0x81);

/// DISPATCH: hand a payload received over OOB to the applet for
/// secure-channel processing.
#[derive(Debug, Clone)]
pub struct DispatchCommand {
    pub payload: Vec<u8>,
}

impl DispatchCommand {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

impl FiRaCommand for DispatchCommand {
    fn ins(&self) -> u8 {
        INS_DISPATCH
    }

    fn command_data(&self) -> Vec<u8> {
        TlvBuilder::new().put(PAYLOAD_TAG, self.payload.clone()).build()
    }
}

/// Where the applet wants the dispatch transaction to go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Undefined,
    Complete,
    ForwardToHost,
    ForwardToRemote,
    WithError,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => Self::Undefined,
            0x01 => Self::Complete,
            0x02 => Self::ForwardToHost,
            0x03 => Self::ForwardToRemote,
            0xFF => Self::WithError,
            other => bail!("unknown dispatch transaction status 0x{other:02X}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundTarget {
    Host,
    Remote,
}

/// Zero-or-one payload the host must move after a dispatch: either up
/// to the secure session (`Host`) or over OOB to the peer (`Remote`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundData {
    pub target: OutboundTarget,
    pub data: Vec<u8>,
}

/// Applet-side events riding on a dispatch response, delivered in the
/// order the applet emitted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchNotification {
    AdfSelected {
        oid: Oid,
    },
    SecureChannelEstablished {
        /// Default unique session id handed out by the applet, when the
        /// provisioned ADF carries one.
        default_session_id: Option<u32>,
    },
    SecureSessionAborted,
    ControleeInfoAvailable {
        controlee_info: Vec<u8>,
    },
    RdsAvailable {
        session_id: u32,
        arbitrary_data: Option<Vec<u8>>,
    },
}

/// Parsed DISPATCH response: transaction status, optional outbound
/// payload and the ordered notification list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status: TransactionStatus,
    pub outbound: Option<OutboundData>,
    pub notifications: Vec<DispatchNotification>,
}

impl DispatchResponse {
    pub fn parse(response: &ResponseApdu) -> Result<Self> {
        ensure!(
            response.is_success(),
            "DISPATCH failed with {}",
            response.sw()
        );
        let map = Tlv::parse_all(response.data())?;

        let status = match map.get_first(STATUS_TAG) {
            Some(t) => {
                ensure!(!t.value.is_empty(), "empty dispatch status DO");
                TransactionStatus::from_byte(t.value[0])?
            },
            None => TransactionStatus::Undefined,
        };

        let outbound = map.get_first(DATA_TAG).map(|t| OutboundData {
            target: match status {
                TransactionStatus::ForwardToRemote => OutboundTarget::Remote,
                _ => OutboundTarget::Host,
            },
            data: t.value.clone(),
        });

        let mut notifications = Vec::new();
        for template in map.get_all(NOTIFICATION_TEMPLATE_TAG) {
            match Self::parse_notification(template) {
                Ok(n) => notifications.push(n),
                // An unknown notification must not poison the whole
                // response; the transaction outcome still stands.
                Err(e) => warn!("skipping dispatch notification: {e}"),
            }
        }

        Ok(Self {
            status,
            outbound,
            notifications,
        })
    }

    fn parse_notification(template: &Tlv) -> Result<DispatchNotification> {
        let children = template.children()?;
        if let Some(format) = children.get_first(NOTIFICATION_FORMAT_TAG)
            && format.value != [0x00]
        {
            bail!("unsupported notification format {:02X?}", format.value);
        }
        let id = children.require(NOTIFICATION_ID_TAG)?;
        ensure!(id.value.len() == 1, "notification id must be one byte");
        let data = children
            .get_first(NOTIFICATION_DATA_TAG)
            .map(|t| t.value.as_slice())
            .unwrap_or_default();

        Ok(match id.value[0] {
            NOTIFICATION_ID_ADF_SELECTED => DispatchNotification::AdfSelected {
                oid: Oid::new(data.to_vec()),
            },
            NOTIFICATION_ID_SECURE_CHANNEL_ESTABLISHED => {
                DispatchNotification::SecureChannelEstablished {
                    default_session_id: parse_default_session_id(data),
                }
            },
            NOTIFICATION_ID_SECURE_SESSION_ABORTED => {
                DispatchNotification::SecureSessionAborted
            },
            NOTIFICATION_ID_CONTROLEE_INFO_AVAILABLE => {
                DispatchNotification::ControleeInfoAvailable {
                    controlee_info: data.to_vec(),
                }
            },
            NOTIFICATION_ID_RDS_AVAILABLE => parse_rds_available(data)?,
            other => bail!("unknown notification id 0x{other:02X}"),
        })
    }
}

/// Default-session-id payload: `1-byte length || N-byte big-endian id`.
/// Applets in the field also emit a zero-length payload (no default id)
/// and bare id bytes without the length prefix; accept all three.
fn parse_default_session_id(data: &[u8]) -> Option<u32> {
    if data.is_empty() {
        return None;
    }
    let id_bytes = match data[0] as usize {
        n if n == data.len() - 1 && n > 0 => &data[1..],
        _ => data,
    };
    if id_bytes.is_empty() || id_bytes.len() > 4 {
        warn!("malformed default session id payload: {}", hex::encode(data));
        return None;
    }
    let mut id = 0u32;
    for b in id_bytes {
        id = (id << 8) | *b as u32;
    }
    Some(id)
}

fn parse_rds_available(data: &[u8]) -> Result<DispatchNotification> {
    let map = Tlv::parse_all(data)?;
    let id_do = map.require(RDS_SESSION_ID_TAG)?;
    ensure!(
        !id_do.value.is_empty() && id_do.value.len() <= 4,
        "RDS session id must be 1..=4 bytes"
    );
    let mut session_id = 0u32;
    for b in &id_do.value {
        session_id = (session_id << 8) | *b as u32;
    }
    Ok(DispatchNotification::RdsAvailable {
        session_id,
        arbitrary_data: map
            .get_first(RDS_ARBITRARY_DATA_TAG)
            .map(|t| t.value.clone()),
    })
}

/// Encoders for the notification payloads, used by the in-process SE
/// applet in the integration tests and kept next to the parsers so the
/// two cannot drift.
pub mod encode {
    use super::*;

    pub fn response(
        status: TransactionStatus,
        outbound: Option<&[u8]>,
        notifications: &[Vec<u8>],
    ) -> ResponseApdu {
        let status_byte = match status {
            TransactionStatus::Undefined => 0x00,
            TransactionStatus::Complete => 0x01,
            TransactionStatus::ForwardToHost => 0x02,
            TransactionStatus::ForwardToRemote => 0x03,
            TransactionStatus::WithError => 0xFF,
        };
        let mut b = TlvBuilder::new().put_u8(STATUS_TAG, status_byte);
        if let Some(data) = outbound {
            b = b.put(DATA_TAG, data.to_vec());
        }
        for ntf in notifications {
            b = b.put(NOTIFICATION_TEMPLATE_TAG, ntf.clone());
        }
        ResponseApdu::new(
            b.build(),
            crate::models::apdu::response::StatusWord::NO_ERROR,
        )
    }

    fn notification(id: u8, data: Option<Vec<u8>>) -> Vec<u8> {
        TlvBuilder::new()
            .put_u8(NOTIFICATION_FORMAT_TAG, 0x00)
            .put_u8(NOTIFICATION_ID_TAG, id)
            .put_opt(NOTIFICATION_DATA_TAG, data)
            .build()
    }

    pub fn adf_selected(oid: &Oid) -> Vec<u8> {
        notification(NOTIFICATION_ID_ADF_SELECTED, Some(oid.0.clone()))
    }

    pub fn secure_channel_established(default_session_id: Option<u32>) -> Vec<u8> {
        let data = default_session_id.map(|id| {
            let mut out = vec![4u8];
            out.extend_from_slice(&id.to_be_bytes());
            out
        });
        notification(NOTIFICATION_ID_SECURE_CHANNEL_ESTABLISHED, data)
    }

    pub fn secure_session_aborted() -> Vec<u8> {
        notification(NOTIFICATION_ID_SECURE_SESSION_ABORTED, None)
    }

    pub fn controlee_info_available(controlee_info: &[u8]) -> Vec<u8> {
        notification(
            NOTIFICATION_ID_CONTROLEE_INFO_AVAILABLE,
            Some(controlee_info.to_vec()),
        )
    }

    pub fn rds_available(session_id: u32, arbitrary_data: Option<&[u8]>) -> Vec<u8> {
        let payload = TlvBuilder::new()
            .put_u32(RDS_SESSION_ID_TAG, session_id)
            .put_opt(RDS_ARBITRARY_DATA_TAG, arbitrary_data.map(|d| d.to_vec()))
            .build();
        notification(NOTIFICATION_ID_RDS_AVAILABLE, Some(payload))
    }
}
