// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    csml::common::{FiRaCommand, INS_GET_DO},
    tlv::{ExtendedHeader, Tag, encode_extended_header_list},
};

const EXTENDED_HEADER_LIST_TAG: Tag = Tag::new(0x4D);

/// GET DATA (DO): read data objects from the selected ADF, addressed by
/// an ISO 7816-4 extended header list.
#[derive(Debug, Clone)]
pub struct GetDoCommand {
    pub headers: Vec<ExtendedHeader>,
}

impl GetDoCommand {
    pub fn new(headers: Vec<ExtendedHeader>) -> Self {
        Self { headers }
    }

    /// Read one DO in full.
    pub fn whole(tag: impl Into<Tag>) -> Self {
        Self::new(vec![ExtendedHeader::whole(tag)])
    }
}

impl FiRaCommand for GetDoCommand {
    fn ins(&self) -> u8 {
        INS_GET_DO
    }

    fn p1(&self) -> u8 {
        0x3F
    }

    fn p2(&self) -> u8 {
        0xFF
    }

    fn command_data(&self) -> Vec<u8> {
        let list = encode_extended_header_list(&self.headers);
        crate::models::tlv::TlvBuilder::new()
            .put(EXTENDED_HEADER_LIST_TAG, list)
            .build()
    }
}
