// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::csml::common::{FiRaCommand, INS_PUT_DO};

/// PUT DATA (DO): write an already TLV-encoded data object (session
/// data, terminate-session DO, ...) into the selected ADF.
#[derive(Debug, Clone)]
pub struct PutDoCommand {
    pub data_object: Vec<u8>,
}

impl PutDoCommand {
    pub fn new(data_object: Vec<u8>) -> Self {
        Self { data_object }
    }
}

impl FiRaCommand for PutDoCommand {
    fn ins(&self) -> u8 {
        INS_PUT_DO
    }

    fn p1(&self) -> u8 {
        0x3F
    }

    fn p2(&self) -> u8 {
        0xFF
    }

    fn command_data(&self) -> Vec<u8> {
        self.data_object.clone()
    }
}
