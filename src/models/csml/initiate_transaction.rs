// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::models::{
    apdu::response::ResponseApdu,
    csml::common::{FiRaCommand, INS_INITIATE_TRANSACTION, OID_TAG, Oid, success_data},
    tlv::{Tag, Tlv, TlvBuilder},
};

const SESSION_ID_TAG: Tag = Tag::new(0x80);
const OUTBOUND_DATA_TAG: Tag = Tag::new(0x81);

/// INITIATE TRANSACTION: the initiator hands the applet the peer's
/// selectable OIDs (and, for multicast, the shared primary session id);
/// the applet answers with the first payload to push over OOB.
#[derive(Debug, Clone)]
pub struct InitiateTransactionCommand {
    pub peer_oids: Vec<Oid>,
    /// Shared primary session id, multicast only.
    pub session_id: Option<u32>,
}

impl InitiateTransactionCommand {
    pub fn unicast(peer_oids: Vec<Oid>) -> Self {
        Self {
            peer_oids,
            session_id: None,
        }
    }

    pub fn multicast(peer_oids: Vec<Oid>, session_id: u32) -> Self {
        Self {
            peer_oids,
            session_id: Some(session_id),
        }
    }
}

impl FiRaCommand for InitiateTransactionCommand {
    fn ins(&self) -> u8 {
        INS_INITIATE_TRANSACTION
    }

    fn command_data(&self) -> Vec<u8> {
        let mut b = TlvBuilder::new();
        for oid in &self.peer_oids {
            b = b.put(OID_TAG, oid.0.clone());
        }
        if let Some(id) = self.session_id {
            b = b.put_u32(SESSION_ID_TAG, id);
        }
        b.build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateTransactionResponse {
    /// First secure-channel payload destined for the remote device.
    pub outbound_data: Option<Vec<u8>>,
}

impl InitiateTransactionResponse {
    pub fn parse(response: &ResponseApdu) -> Result<Self> {
        let data = success_data(response, "INITIATE TRANSACTION")?;
        if data.is_empty() {
            return Ok(Self {
                outbound_data: None,
            });
        }
        let map = Tlv::parse_all(&data)?;
        Ok(Self {
            outbound_data: map
                .get_first(OUTBOUND_DATA_TAG)
                .map(|t| t.value.clone()),
        })
    }
}
