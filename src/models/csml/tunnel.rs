// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::{
    csml::common::{FiRaCommand, INS_TUNNEL},
    tlv::{Tag, TlvBuilder},
};

const PAYLOAD_TAG: Tag = Tag::new(0x81);

/// TUNNEL: wrap an APDU for the remote device; the applet encrypts it
/// into a secure-channel payload to ship over OOB. The response uses
/// the same template as DISPATCH (status, outbound data,
/// notifications) and is parsed by
/// [`crate::models::csml::dispatch::DispatchResponse`].
#[derive(Debug, Clone)]
pub struct TunnelCommand {
    pub payload: Vec<u8>,
}

impl TunnelCommand {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

impl FiRaCommand for TunnelCommand {
    fn ins(&self) -> u8 {
        INS_TUNNEL
    }

    fn command_data(&self) -> Vec<u8> {
        TlvBuilder::new().put(PAYLOAD_TAG, self.payload.clone()).build()
    }
}
