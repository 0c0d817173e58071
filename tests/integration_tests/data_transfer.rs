// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use uwb_ranging_rs::{
    session::{
        callbacks::{ApiReason, SendDataParams},
        uwb_session::SessionHandle,
    },
    uci::hal::UciStatus,
};

use crate::integration_tests::common::{
    CbEvent, fira_params, next_event, open_session, privileged_attribution,
    recording_callbacks, setup_manager, start_session,
};

const REMOTE: u64 = 0x0002;

#[tokio::test]
async fn test_send_requires_active_session() {
    let (manager, device) = setup_manager();
    let (callbacks, mut rx) = recording_callbacks();
    let handle = SessionHandle(1);

    open_session(
        &manager,
        handle,
        1,
        fira_params(),
        privileged_attribution(),
        callbacks,
        &mut rx,
    )
    .await;

    // Still IDLE: rejected without touching the device.
    manager
        .send_data(handle, REMOTE, SendDataParams::default(), Bytes::from_static(b"x"))
        .await
        .expect("post");
    assert_eq!(
        next_event(&mut rx).await,
        CbEvent::DataSendFailed(REMOTE, UciStatus::Rejected)
    );
    assert!(device.sent_data.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn test_sequence_numbers_advance_on_success_only() {
    let (manager, device) = setup_manager();
    let (callbacks, mut rx) = recording_callbacks();
    let handle = SessionHandle(1);

    open_session(
        &manager,
        handle,
        1,
        fira_params(),
        privileged_attribution(),
        callbacks,
        &mut rx,
    )
    .await;
    start_session(&manager, handle, &mut rx).await;

    for payload in [b"one".as_slice(), b"two".as_slice()] {
        manager
            .send_data(
                handle,
                REMOTE,
                SendDataParams { dst_endpoint: 1 },
                Bytes::copy_from_slice(payload),
            )
            .await
            .expect("post");
        assert_eq!(next_event(&mut rx).await, CbEvent::DataSent(REMOTE));
    }

    let sent = device.sent_data.lock().expect("lock").clone();
    assert_eq!(sent.len(), 2);
    // Host-assigned sequence numbers are monotonic per session.
    assert_eq!(sent[0].2, 0);
    assert_eq!(sent[1].2, 1);
    // The remote address always goes out in the 8-byte extended form.
    assert_eq!(sent[0].1, [0, 0, 0, 0, 0, 0, 0x00, 0x02]);
    assert_eq!(sent[0].3, b"one".to_vec());

    // A failed send (stopped session) must not advance the counter.
    manager.stop_ranging(handle).await.expect("stop");
    assert_eq!(next_event(&mut rx).await, CbEvent::Stopped(ApiReason::LocalApi));
    manager
        .send_data(handle, REMOTE, SendDataParams::default(), Bytes::from_static(b"z"))
        .await
        .expect("post");
    assert_eq!(
        next_event(&mut rx).await,
        CbEvent::DataSendFailed(REMOTE, UciStatus::Rejected)
    );
    assert_eq!(device.sent_data.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn test_query_data_size_passthrough() {
    let (manager, _device) = setup_manager();
    let (callbacks, mut rx) = recording_callbacks();
    let handle = SessionHandle(1);

    open_session(
        &manager,
        handle,
        1,
        fira_params(),
        privileged_attribution(),
        callbacks,
        &mut rx,
    )
    .await;
    assert_eq!(manager.query_max_data_size(handle).await.expect("query"), 1024);
}

#[tokio::test]
async fn test_dt_tag_ranging_rounds_update() {
    let (manager, device) = setup_manager();
    let (callbacks, mut rx) = recording_callbacks();
    let handle = SessionHandle(1);

    open_session(
        &manager,
        handle,
        1,
        fira_params(),
        privileged_attribution(),
        callbacks,
        &mut rx,
    )
    .await;

    device.script_failed_rounds(vec![3]);
    manager
        .ranging_rounds_update_dt_tag(handle, vec![1, 2, 3])
        .await
        .expect("post");
    assert_eq!(next_event(&mut rx).await, CbEvent::RoundsUpdate(vec![3]));
}
