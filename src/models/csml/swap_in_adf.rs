// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::models::{
    apdu::response::ResponseApdu,
    csml::common::{
        CONTROLEE_INFO_DO, FiRaCommand, INS_SWAP_ADF, OID_TAG, Oid, success_data,
    },
    tlv::{Tag, Tlv, TlvBuilder},
};

const SECURE_BLOB_TAG: Tag = Tag::new(0x80);
const SLOT_ID_TAG: Tag = Tag::new(0x80);

const P1_SWAP_IN: u8 = 0x00;
const P1_SWAP_OUT: u8 = 0x01;

/// SWAP ADF, P1=00: load a dynamic-slot ADF from its secure BLOB. The
/// applet answers with the slot identifier that must be swapped out
/// again during cleanup.
#[derive(Debug, Clone)]
pub struct SwapInAdfCommand {
    swap_out_slot: Option<Vec<u8>>,
    secure_blob: Vec<u8>,
    oid: Oid,
    controlee_info: Vec<u8>,
}

impl SwapInAdfCommand {
    pub fn swap_in(secure_blob: Vec<u8>, oid: Oid, controlee_info: Vec<u8>) -> Self {
        Self {
            swap_out_slot: None,
            secure_blob,
            oid,
            controlee_info,
        }
    }

    /// SWAP ADF, P1=01: release a previously acquired slot.
    pub fn swap_out(slot_id: Vec<u8>) -> Self {
        Self {
            swap_out_slot: Some(slot_id),
            secure_blob: Vec::new(),
            oid: Oid::new(Vec::new()),
            controlee_info: Vec::new(),
        }
    }
}

impl FiRaCommand for SwapInAdfCommand {
    fn ins(&self) -> u8 {
        INS_SWAP_ADF
    }

    fn p1(&self) -> u8 {
        if self.swap_out_slot.is_some() { P1_SWAP_OUT } else { P1_SWAP_IN }
    }

    fn command_data(&self) -> Vec<u8> {
        match &self.swap_out_slot {
            Some(slot) => TlvBuilder::new().put(SLOT_ID_TAG, slot.clone()).build(),
            None => TlvBuilder::new()
                .put(SECURE_BLOB_TAG, self.secure_blob.clone())
                .put(OID_TAG, self.oid.0.clone())
                .put(CONTROLEE_INFO_DO, self.controlee_info.clone())
                .build(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapInAdfResponse {
    /// Identifier of the dynamic slot now holding the ADF.
    pub slot_id: Vec<u8>,
}

impl SwapInAdfResponse {
    pub fn parse(response: &ResponseApdu) -> Result<Self> {
        let data = success_data(response, "SWAP IN ADF")?;
        let map = Tlv::parse_all(&data)?;
        let slot = map.require(SLOT_ID_TAG)?;
        anyhow::ensure!(!slot.value.is_empty(), "SWAP IN ADF returned empty slot id");
        Ok(Self {
            slot_id: slot.value.clone(),
        })
    }
}
