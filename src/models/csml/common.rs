// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::Result;
use enum_dispatch::enum_dispatch;

use crate::models::{
    apdu::command::CommandApdu,
    csml::{
        dispatch::DispatchCommand, get_do::GetDoCommand,
        initiate_transaction::InitiateTransactionCommand, put_do::PutDoCommand,
        select_adf::SelectAdfCommand, swap_in_adf::SwapInAdfCommand,
        tunnel::TunnelCommand,
    },
    tlv::Tag,
};

/// Proprietary class byte used by every FiRa applet command.
pub const CLA_PROPRIETARY: u8 = 0x80;

/// Inter-industry SELECT (by AID) header bytes, also used to recognize
/// the inbound applet SELECT on the responder side.
pub const CLA_ISO: u8 = 0x00;
pub const INS_SELECT: u8 = 0xA4;
pub const P1_SELECT_BY_AID: u8 = 0x04;

pub const INS_SELECT_ADF: u8 = 0xA5;
pub const INS_INITIATE_TRANSACTION: u8 = 0x12;
pub const INS_TUNNEL: u8 = 0x14;
pub const INS_DISPATCH: u8 = 0xC2;
pub const INS_SWAP_ADF: u8 = 0x40;
pub const INS_GET_DO: u8 = 0xCB;
pub const INS_PUT_DO: u8 = 0xDB;

/// Top-level CSML data objects.
pub const CONTROLEE_INFO_DO: Tag = Tag::new(0xBF70);
pub const SESSION_DATA_DO: Tag = Tag::new(0xBF78);
pub const TERMINATE_SESSION_DO: Tag = Tag::new(0xBF79);
/// Nested inside [`TERMINATE_SESSION_DO`].
pub const TERMINATE_SESSION_PAYLOAD: Tag = Tag::new(0x80);

/// DER object-identifier tag used for ADF OIDs inside command payloads.
pub const OID_TAG: Tag = Tag::new(0x06);

/// An ADF object identifier, kept as its raw DER value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(pub Vec<u8>);

impl Oid {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", hex::encode(&self.0))
    }
}

/// The terminate-session DO tunneled (initiator) or applied locally on
/// teardown: `BF79` nesting an empty `80`.
///
/// The exact nested layout is not pinned down by the published CSML
/// revisions we target; an empty payload is what deployed applets
/// accept.
pub fn terminate_session_do() -> Vec<u8> {
    crate::models::tlv::TlvBuilder::new()
        .put_children(
            TERMINATE_SESSION_DO,
            crate::models::tlv::TlvBuilder::new()
                .put(TERMINATE_SESSION_PAYLOAD, Vec::new()),
        )
        .build()
}

/// Inter-industry SELECT of the FiRa applet by AID.
pub fn select_applet_apdu(aid: &[u8]) -> CommandApdu {
    CommandApdu::new(CLA_ISO, INS_SELECT, P1_SELECT_BY_AID, 0x00)
        .data(aid.to_vec())
        .le(0)
}

/// True when `apdu` is an applet SELECT arriving from the remote peer,
/// which tells a responder to bring its own channel up.
pub fn is_applet_select(apdu: &CommandApdu) -> bool {
    apdu.cla == CLA_ISO && apdu.ins == INS_SELECT && apdu.p1 == P1_SELECT_BY_AID
}

/// Common surface of every proprietary FiRa applet command: header
/// bytes plus the TLV-encoded command data, with a uniform conversion
/// into a case-4 extended-capable [`CommandApdu`].
#[enum_dispatch]
pub trait FiRaCommand {
    fn ins(&self) -> u8;

    fn p1(&self) -> u8 {
        0x00
    }

    fn p2(&self) -> u8 {
        0x00
    }

    fn command_data(&self) -> Vec<u8>;

    fn to_apdu(&self) -> CommandApdu {
        CommandApdu::new(CLA_PROPRIETARY, self.ins(), self.p1(), self.p2())
            .data(self.command_data())
            .le(0)
    }
}

/// Every command the secure channel can put on an SE logical channel.
#[enum_dispatch(FiRaCommand)]
#[derive(Debug, Clone)]
pub enum CsmlCommand {
    SelectAdfCommand,
    SwapInAdfCommand,
    InitiateTransactionCommand,
    DispatchCommand,
    TunnelCommand,
    GetDoCommand,
    PutDoCommand,
}

/// Helper shared by the response parsers: fail early on a non-9000
/// status word, then hand back the data bytes.
pub fn success_data(
    response: &crate::models::apdu::response::ResponseApdu,
    what: &str,
) -> Result<Vec<u8>> {
    anyhow::ensure!(
        response.is_success(),
        "{what} failed with {}",
        response.sw()
    );
    Ok(response.data().to_vec())
}
