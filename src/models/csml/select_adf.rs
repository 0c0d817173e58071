// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::models::{
    apdu::response::ResponseApdu,
    csml::common::{FiRaCommand, INS_SELECT_ADF, OID_TAG, Oid, success_data},
    tlv::{Tlv, TlvBuilder},
};

/// SELECT ADF: offer the applet the list of provisioned ADF OIDs; the
/// applet picks one and anchors the secure-channel dialog on it.
#[derive(Debug, Clone)]
pub struct SelectAdfCommand {
    pub oids: Vec<Oid>,
}

impl SelectAdfCommand {
    pub fn new(oids: Vec<Oid>) -> Self {
        Self { oids }
    }
}

impl FiRaCommand for SelectAdfCommand {
    fn ins(&self) -> u8 {
        INS_SELECT_ADF
    }

    fn p1(&self) -> u8 {
        0x04
    }

    fn command_data(&self) -> Vec<u8> {
        let mut b = TlvBuilder::new();
        for oid in &self.oids {
            b = b.put(OID_TAG, oid.0.clone());
        }
        b.build()
    }
}

/// Applet answer: the OID it selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectAdfResponse {
    pub selected_oid: Option<Oid>,
}

impl SelectAdfResponse {
    pub fn parse(response: &ResponseApdu) -> Result<Self> {
        let data = success_data(response, "SELECT ADF")?;
        if data.is_empty() {
            return Ok(Self { selected_oid: None });
        }
        let map = Tlv::parse_all(&data)?;
        Ok(Self {
            selected_oid: map
                .get_first(OID_TAG)
                .map(|t| Oid::new(t.value.clone())),
        })
    }
}
