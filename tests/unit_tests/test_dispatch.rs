// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use uwb_ranging_rs::models::{
    apdu::response::{ResponseApdu, StatusWord},
    csml::{
        common::Oid,
        dispatch::{
            DispatchNotification, DispatchResponse, OutboundTarget,
            TransactionStatus, encode,
        },
    },
};

use crate::unit_tests::load_fixture;

#[test]
fn test_established_notification_from_fixture() -> Result<()> {
    let bytes = load_fixture(
        "tests/unit_tests/fixtures/csml/dispatch_response_established.hex",
    )?;
    let rsp = DispatchResponse::parse(&ResponseApdu::from_bytes(&bytes)?)?;

    assert_eq!(rsp.status, TransactionStatus::Complete);
    assert!(rsp.outbound.is_none());
    assert_eq!(
        rsp.notifications,
        vec![DispatchNotification::SecureChannelEstablished {
            default_session_id: Some(0x0102_0304),
        }]
    );
    Ok(())
}

#[test]
fn test_default_session_id_leniency() -> Result<()> {
    // Length-prefixed, bare, and empty forms must all be accepted.
    let cases: [(&[u8], Option<u32>); 4] = [
        (&[0x04, 0x01, 0x02, 0x03, 0x04], Some(0x0102_0304)),
        (&[0x02, 0xAA, 0xBB], Some(0xAABB)),
        (&[0xAA, 0xBB], Some(0xAABB)),
        (&[], None),
    ];
    for (payload, expected) in cases {
        let ntf = encode_notification_with_established(payload);
        let rsp = DispatchResponse::parse(&ntf)?;
        match &rsp.notifications[..] {
            [DispatchNotification::SecureChannelEstablished { default_session_id }] => {
                assert_eq!(*default_session_id, expected, "payload {payload:02X?}");
            },
            other => panic!("unexpected notifications: {other:?}"),
        }
    }
    Ok(())
}

fn encode_notification_with_established(id_payload: &[u8]) -> ResponseApdu {
    use uwb_ranging_rs::models::tlv::TlvBuilder;
    let ntf = TlvBuilder::new()
        .put_u8(0x80u16, 0x00)
        .put_u8(0x81u16, 0x01)
        .put(0x82u16, id_payload.to_vec())
        .build();
    encode::response(TransactionStatus::Complete, None, &[ntf])
}

#[test]
fn test_outbound_target_follows_status() -> Result<()> {
    let to_remote = encode::response(
        TransactionStatus::ForwardToRemote,
        Some([0xDE, 0xAD].as_slice()),
        &[],
    );
    let rsp = DispatchResponse::parse(&to_remote)?;
    let outbound = rsp.outbound.expect("outbound data");
    assert_eq!(outbound.target, OutboundTarget::Remote);
    assert_eq!(outbound.data, vec![0xDE, 0xAD]);

    let to_host =
        encode::response(TransactionStatus::ForwardToHost, Some([0x01].as_slice()), &[]);
    let rsp = DispatchResponse::parse(&to_host)?;
    assert_eq!(rsp.outbound.expect("outbound data").target, OutboundTarget::Host);
    Ok(())
}

#[test]
fn test_rds_available_roundtrip() -> Result<()> {
    let ntf = encode::rds_available(0x11223344, Some([0xBF, 0x78, 0x00].as_slice()));
    let rsp = DispatchResponse::parse(&encode::response(
        TransactionStatus::Complete,
        None,
        &[ntf],
    ))?;
    assert_eq!(
        rsp.notifications,
        vec![DispatchNotification::RdsAvailable {
            session_id: 0x11223344,
            arbitrary_data: Some(vec![0xBF, 0x78, 0x00]),
        }]
    );
    Ok(())
}

#[test]
fn test_notification_ordering_preserved() -> Result<()> {
    let oid = Oid::new(vec![0x01]);
    let rsp = DispatchResponse::parse(&encode::response(
        TransactionStatus::Complete,
        None,
        &[
            encode::adf_selected(&oid),
            encode::secure_channel_established(None),
            encode::rds_available(7, None),
        ],
    ))?;
    assert_eq!(rsp.notifications.len(), 3);
    assert!(matches!(
        rsp.notifications[0],
        DispatchNotification::AdfSelected { .. }
    ));
    assert!(matches!(
        rsp.notifications[1],
        DispatchNotification::SecureChannelEstablished {
            default_session_id: None
        }
    ));
    assert!(matches!(
        rsp.notifications[2],
        DispatchNotification::RdsAvailable { session_id: 7, .. }
    ));
    Ok(())
}

#[test]
fn test_unknown_notification_is_skipped() -> Result<()> {
    use uwb_ranging_rs::models::tlv::TlvBuilder;
    let bogus = TlvBuilder::new()
        .put_u8(0x80u16, 0x00)
        .put_u8(0x81u16, 0x7F)
        .build();
    let rsp = DispatchResponse::parse(&encode::response(
        TransactionStatus::Complete,
        None,
        &[bogus, encode::secure_session_aborted()],
    ))?;
    assert_eq!(
        rsp.notifications,
        vec![DispatchNotification::SecureSessionAborted]
    );
    Ok(())
}

#[test]
fn test_failed_status_word_rejected() {
    let rsp = ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED);
    assert!(DispatchResponse::parse(&rsp).is_err());
}
