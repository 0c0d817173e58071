// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use uwb_ranging_rs::{
    cfg::config::Config,
    models::{
        apdu::command::CommandApdu,
        csml::{
            common::{INS_SELECT, Oid, select_applet_apdu},
            controlee_info::ControleeInfo,
            session_data::{ConfigurationParams, SecureRangingInfo, SessionData},
        },
    },
    oob::OobLink,
    secure_channel::fira_channel::{ChannelRole, ChannelStatus, RunningProfile},
    secure_session::{SecureSession, SecureSessionConfig, SessionParty},
};

use crate::integration_tests::common::{
    ESTABLISHED_TOKEN, FAKE_SLOT, FakeApplet, RDS_TOKEN, SecureEvent,
    next_secure_event, recording_secure_callback, spawn_peer_responder,
};

fn test_oid() -> Oid {
    Oid::new(vec![0x01, 0x02])
}

fn profile(aid: Vec<u8>, secure_blob: Option<Vec<u8>>) -> RunningProfile {
    RunningProfile {
        applet_aid: aid,
        local_oids: vec![test_oid()],
        peer_oids: vec![test_oid()],
        secure_blob,
        controlee_info: ControleeInfo::default().to_bytes(),
        shared_primary_session_id: None,
    }
}

fn controller_template() -> SessionData {
    SessionData {
        configuration_params: Some(ConfigurationParams::default()),
        ..SessionData::default()
    }
}

#[tokio::test]
async fn test_controller_initiator_setup_and_teardown() {
    let secure_cfg = Config::default().secure;
    let aid = secure_cfg.applet_aid_bytes().expect("aid");

    let applet = FakeApplet::new(aid.clone(), 0);
    let (local_oob, peer_oob) = OobLink::pair(16);
    spawn_peer_responder(peer_oob, ControleeInfo::default().to_bytes());

    let (callback, mut rx) = recording_secure_callback();
    let handle = SecureSession::spawn(
        secure_cfg,
        SecureSessionConfig {
            role: ChannelRole::Initiator,
            party: SessionParty::Controller,
            profile: profile(aid, Some(b"SECURE-BLOB".to_vec())),
            local_controlee_info: ControleeInfo::default(),
            session_template: controller_template(),
            need_secure_ranging_info: true,
        },
        applet.clone(),
        local_oob,
        callback,
    );

    let session_id = match next_secure_event(&mut rx).await {
        SecureEvent::Ready {
            session_id,
            session_data,
        } => {
            // Controllers mint a positive 31-bit id.
            assert!((1..=i32::MAX as u32).contains(&session_id));
            let data = session_data.expect("session data");
            assert_eq!(data.session_id(), Some(session_id));
            let sri = data.secure_ranging_info.expect("key material");
            assert_eq!(sri.session_key.len(), SecureRangingInfo::KEY_LEN);
            assert!(sri.sub_session_key.is_none());
            session_id
        },
        other => panic!("expected session data, got {other:?}"),
    };
    assert!(session_id != 0);

    // The applet pushed the RDS itself, so no local PUT DO happened.
    assert!(applet.local_put_do.lock().expect("lock").is_empty());
    // The dynamic ADF slot was acquired from the secure BLOB.
    assert_eq!(applet.swapped_in.lock().expect("lock").len(), 1);
    assert_eq!(handle.channel_status(), ChannelStatus::Established);

    handle.terminate().await;
    assert_eq!(next_secure_event(&mut rx).await, SecureEvent::Terminated);

    // Teardown invariant: slot swapped out, SE channel closed.
    assert_eq!(
        applet.swapped_out.lock().expect("lock").clone(),
        vec![FAKE_SLOT.to_vec()]
    );
    assert_eq!(applet.closed_channels.lock().expect("lock").clone(), vec![1]);
    assert_eq!(handle.channel_status(), ChannelStatus::Terminated);
}

#[tokio::test]
async fn test_controlee_responder_inline_rds() {
    let secure_cfg = Config::default().secure;
    let aid = secure_cfg.applet_aid_bytes().expect("aid");

    let inline = SessionData::for_default_session(0x0042).to_bytes();
    let applet = FakeApplet::with_inline_rds(aid.clone(), 0x0042, inline);
    let (local_oob, peer_oob) = OobLink::pair(16);

    let (callback, mut rx) = recording_secure_callback();
    let handle = SecureSession::spawn(
        secure_cfg,
        SecureSessionConfig {
            role: ChannelRole::Responder,
            party: SessionParty::Controlee,
            profile: profile(aid.clone(), None),
            local_controlee_info: ControleeInfo::default(),
            session_template: SessionData::default(),
            need_secure_ranging_info: false,
        },
        applet.clone(),
        local_oob,
        callback,
    );

    // The remote initiator drives the whole dialog over OOB.
    peer_oob
        .send(select_applet_apdu(&aid).encode())
        .await
        .expect("select");
    peer_oob
        .send(Bytes::from_static(ESTABLISHED_TOKEN))
        .await
        .expect("est");
    peer_oob.send(Bytes::from_static(RDS_TOKEN)).await.expect("rds");

    match next_secure_event(&mut rx).await {
        SecureEvent::Ready {
            session_id,
            session_data,
        } => {
            // Controlees read their id from the session data the RDS
            // carried inline.
            assert_eq!(session_id, 0x0042);
            assert_eq!(
                session_data.expect("session data").session_id(),
                Some(0x0042)
            );
        },
        other => panic!("expected session data, got {other:?}"),
    }

    handle.terminate().await;
    assert_eq!(next_secure_event(&mut rx).await, SecureEvent::Terminated);
    assert_eq!(applet.closed_channels.lock().expect("lock").clone(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_tunnel_timeout_aborts_session() {
    let secure_cfg = Config::default().secure;
    let aid = secure_cfg.applet_aid_bytes().expect("aid");

    let applet = FakeApplet::new(aid.clone(), 7);
    let (local_oob, mut peer_oob) = OobLink::pair(16);

    // A peer that establishes the channel and then goes silent.
    tokio::spawn(async move {
        let mut rx = peer_oob.take_receiver().expect("peer receiver");
        while let Some(frame) = rx.recv().await {
            if let Ok(apdu) = CommandApdu::parse(&frame)
                && apdu.ins == INS_SELECT
                && peer_oob
                    .send(Bytes::from_static(ESTABLISHED_TOKEN))
                    .await
                    .is_err()
            {
                break;
            }
        }
    });

    let (callback, mut rx) = recording_secure_callback();
    let _handle = SecureSession::spawn(
        secure_cfg,
        SecureSessionConfig {
            role: ChannelRole::Initiator,
            party: SessionParty::Controller,
            profile: profile(aid, None),
            local_controlee_info: ControleeInfo::default(),
            session_template: controller_template(),
            need_secure_ranging_info: false,
        },
        applet,
        local_oob,
        callback,
    );

    // GET CONTROLEE INFO never gets an answer; the 2 s pending-request
    // deadline fires and the dialog aborts.
    assert_eq!(next_secure_event(&mut rx).await, SecureEvent::Aborted);
}
