// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, time::timeout};
use uwb_ranging_rs::{
    cfg::config::Config,
    models::{
        apdu::{
            command::CommandApdu,
            response::{ResponseApdu, StatusWord},
        },
        csml::{
            common::{
                self, INS_DISPATCH, INS_GET_DO, INS_INITIATE_TRANSACTION, INS_PUT_DO,
                INS_SELECT, INS_SELECT_ADF, INS_SWAP_ADF, INS_TUNNEL,
            },
            dispatch::{TransactionStatus, encode},
            session_data::SessionData,
        },
        tlv::Tlv,
    },
    oob::OobLink,
    secure_element::SeTransport,
    secure_session::SecureSessionCallback,
    session::{
        callbacks::{ApiReason, RangingCallbacks, SendDataParams},
        manager::SessionManager,
        uwb_session::{AppIdentity, AppIdentityChain, SessionHandle},
    },
    uci::{
        hal::{UciHal, UciStatus},
        notification::{
            ControleeStatus, MulticastListUpdateNtf, MulticastUpdateStatus,
            RangeDataNtf, ReasonCode, SessionState, SessionStatusNtf, UciNotification,
        },
        params::{
            AppConfigTlv, Controlee, DEVICE_ROLE_OBSERVER, FiraAppConfig,
            MacAddressMode, MulticastAction, Protocol, ProtocolParams,
            RANGING_ROUND_USAGE_OWR_AOA, SessionType, app_config,
        },
    },
};

pub const CHIP_ID: &str = "default0";

// ---------------------------------------------------------------------------
// Fake UWB device behind the UCI HAL surface
// ---------------------------------------------------------------------------

/// Scripted in-process device: every command answers synchronously and
/// pushes the matching state notification before returning, like a
/// well-behaved UWBS.
pub struct FakeUwbDevice {
    ntf_tx: Mutex<Option<mpsc::Sender<UciNotification>>>,
    states: Mutex<HashMap<u32, SessionState>>,
    pub configs: Mutex<Vec<(u32, Vec<AppConfigTlv>)>>,
    pub sent_data: Mutex<Vec<(u32, [u8; 8], u16, Vec<u8>)>>,
    pub deinit_calls: Mutex<Vec<u32>>,
    multicast_script: Mutex<Vec<MulticastUpdateStatus>>,
    pub failed_rounds: Mutex<Vec<u8>>,
}

impl FakeUwbDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ntf_tx: Mutex::new(None),
            states: Mutex::new(HashMap::new()),
            configs: Mutex::new(Vec::new()),
            sent_data: Mutex::new(Vec::new()),
            deinit_calls: Mutex::new(Vec::new()),
            multicast_script: Mutex::new(Vec::new()),
            failed_rounds: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, tx: mpsc::Sender<UciNotification>) {
        *self.ntf_tx.lock().expect("ntf lock") = Some(tx);
    }

    pub fn script_multicast(&self, statuses: Vec<MulticastUpdateStatus>) {
        *self.multicast_script.lock().expect("script lock") = statuses;
    }

    pub fn script_failed_rounds(&self, indices: Vec<u8>) {
        *self.failed_rounds.lock().expect("rounds lock") = indices;
    }

    fn notify(&self, ntf: UciNotification) {
        if let Some(tx) = self.ntf_tx.lock().expect("ntf lock").as_ref() {
            tx.try_send(ntf).expect("notification queue full");
        }
    }

    fn move_to(&self, session_id: u32, state: SessionState, reason: ReasonCode) {
        self.states.lock().expect("state lock").insert(session_id, state);
        self.notify(UciNotification::SessionStatus(SessionStatusNtf {
            session_id,
            state,
            reason,
        }));
    }

    fn state_of(&self, session_id: u32) -> Option<SessionState> {
        self.states.lock().expect("state lock").get(&session_id).copied()
    }

    /// Last value set for an app-config tag on a session.
    pub fn last_config(&self, session_id: u32, tag: u8) -> Option<Vec<u8>> {
        self.configs
            .lock()
            .expect("config lock")
            .iter()
            .rev()
            .find_map(|(id, tlvs)| {
                (*id == session_id)
                    .then(|| tlvs.iter().find(|t| t.tag == tag))
                    .flatten()
                    .map(|t| t.value.clone())
            })
    }
}

impl UciHal for FakeUwbDevice {
    fn init_session(
        &self,
        session_id: u32,
        _session_type: SessionType,
        _chip_id: &str,
    ) -> UciStatus {
        self.move_to(session_id, SessionState::Init, ReasonCode::ManagementCommand);
        UciStatus::Ok
    }

    fn deinit_session(&self, session_id: u32, _chip_id: &str) -> UciStatus {
        self.deinit_calls.lock().expect("deinit lock").push(session_id);
        self.move_to(session_id, SessionState::Deinit, ReasonCode::ManagementCommand);
        UciStatus::Ok
    }

    fn start_ranging(&self, session_id: u32, _chip_id: &str) -> UciStatus {
        self.move_to(session_id, SessionState::Active, ReasonCode::ManagementCommand);
        UciStatus::Ok
    }

    fn stop_ranging(&self, session_id: u32, _chip_id: &str) -> UciStatus {
        self.move_to(session_id, SessionState::Idle, ReasonCode::ManagementCommand);
        UciStatus::Ok
    }

    fn set_app_configurations(
        &self,
        session_id: u32,
        configs: &[AppConfigTlv],
        _chip_id: &str,
    ) -> UciStatus {
        self.configs
            .lock()
            .expect("config lock")
            .push((session_id, configs.to_vec()));
        // The first configuration after SESSION_INIT moves the device
        // to IDLE.
        if self.state_of(session_id) == Some(SessionState::Init) {
            self.move_to(session_id, SessionState::Idle, ReasonCode::ManagementCommand);
        }
        UciStatus::Ok
    }

    fn get_app_configurations(
        &self,
        _session_id: u32,
        tags: &[u8],
        _chip_id: &str,
    ) -> (UciStatus, Vec<AppConfigTlv>) {
        let tlvs = tags
            .iter()
            .filter(|t| **t == app_config::RANGING_DURATION)
            .map(|t| AppConfigTlv::new(*t, 200u32.to_be_bytes().to_vec()))
            .collect();
        (UciStatus::Ok, tlvs)
    }

    fn send_data(
        &self,
        session_id: u32,
        remote_addr: [u8; 8],
        _dst_endpoint: u8,
        sequence_num: u16,
        data: &[u8],
        _chip_id: &str,
    ) -> UciStatus {
        self.sent_data.lock().expect("sent lock").push((
            session_id,
            remote_addr,
            sequence_num,
            data.to_vec(),
        ));
        UciStatus::Ok
    }

    fn query_data_size(&self, _session_id: u32, _chip_id: &str) -> (UciStatus, u32) {
        (UciStatus::Ok, 1024)
    }

    fn session_update_dt_tag_ranging_rounds(
        &self,
        _session_id: u32,
        _round_indices: &[u8],
        _chip_id: &str,
    ) -> (UciStatus, Vec<u8>) {
        (UciStatus::Ok, self.failed_rounds.lock().expect("rounds lock").clone())
    }

    fn controller_multicast_list_update(
        &self,
        session_id: u32,
        _action: MulticastAction,
        controlees: &[Controlee],
        _chip_id: &str,
    ) -> UciStatus {
        let script = self.multicast_script.lock().expect("script lock").clone();
        let statuses = controlees
            .iter()
            .enumerate()
            .map(|(i, c)| ControleeStatus {
                mac_address: c.short_address,
                sub_session_id: c.sub_session_id,
                status: script.get(i).copied().unwrap_or(MulticastUpdateStatus::Ok),
            })
            .collect();
        self.notify(UciNotification::MulticastListUpdate(MulticastListUpdateNtf {
            session_id,
            remaining_list_size: 4,
            statuses,
        }));
        UciStatus::Ok
    }

    fn get_max_session_number(&self) -> u32 {
        5
    }
}

// ---------------------------------------------------------------------------
// Recording client callbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CbEvent {
    Opened,
    OpenFailed(ApiReason, UciStatus),
    Started,
    StartFailed(ApiReason, UciStatus),
    Stopped(ApiReason),
    StopFailed(ApiReason, UciStatus),
    Reconfigured,
    ReconfigureFailed(ApiReason, UciStatus),
    Closed(ApiReason),
    ControleeAdded(u16),
    ControleeAddFailed(u16),
    ControleeRemoved(u16),
    ControleeRemoveFailed(u16),
    RangingResult,
    DataReceived(u64, Vec<u8>),
    DataSent(u64),
    DataSendFailed(u64, UciStatus),
    RoundsUpdate(Vec<u8>),
}

pub struct RecordingCallbacks {
    tx: mpsc::UnboundedSender<CbEvent>,
}

pub fn recording_callbacks() -> (Arc<RecordingCallbacks>, mpsc::UnboundedReceiver<CbEvent>)
{
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingCallbacks { tx }), rx)
}

impl RecordingCallbacks {
    fn push(&self, event: CbEvent) {
        let _ = self.tx.send(event);
    }
}

impl RangingCallbacks for RecordingCallbacks {
    fn on_ranging_opened(&self, _handle: SessionHandle) {
        self.push(CbEvent::Opened);
    }

    fn on_ranging_open_failed(
        &self,
        _handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    ) {
        self.push(CbEvent::OpenFailed(reason, status));
    }

    fn on_ranging_started(&self, _handle: SessionHandle) {
        self.push(CbEvent::Started);
    }

    fn on_ranging_start_failed(
        &self,
        _handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    ) {
        self.push(CbEvent::StartFailed(reason, status));
    }

    fn on_ranging_stopped(&self, _handle: SessionHandle, reason: ApiReason) {
        self.push(CbEvent::Stopped(reason));
    }

    fn on_ranging_stop_failed(
        &self,
        _handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    ) {
        self.push(CbEvent::StopFailed(reason, status));
    }

    fn on_ranging_reconfigured(&self, _handle: SessionHandle) {
        self.push(CbEvent::Reconfigured);
    }

    fn on_ranging_reconfigure_failed(
        &self,
        _handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    ) {
        self.push(CbEvent::ReconfigureFailed(reason, status));
    }

    fn on_ranging_closed(&self, _handle: SessionHandle, reason: ApiReason) {
        self.push(CbEvent::Closed(reason));
    }

    fn on_controlee_added(&self, _handle: SessionHandle, address: u16) {
        self.push(CbEvent::ControleeAdded(address));
    }

    fn on_controlee_add_failed(
        &self,
        _handle: SessionHandle,
        address: u16,
        _status: MulticastUpdateStatus,
    ) {
        self.push(CbEvent::ControleeAddFailed(address));
    }

    fn on_controlee_removed(&self, _handle: SessionHandle, address: u16) {
        self.push(CbEvent::ControleeRemoved(address));
    }

    fn on_controlee_remove_failed(
        &self,
        _handle: SessionHandle,
        address: u16,
        _status: MulticastUpdateStatus,
    ) {
        self.push(CbEvent::ControleeRemoveFailed(address));
    }

    fn on_ranging_result(&self, _handle: SessionHandle, _data: &RangeDataNtf) {
        self.push(CbEvent::RangingResult);
    }

    fn on_data_received(&self, _handle: SessionHandle, address: u64, payload: Bytes) {
        self.push(CbEvent::DataReceived(address, payload.to_vec()));
    }

    fn on_data_sent(
        &self,
        _handle: SessionHandle,
        address: u64,
        _params: SendDataParams,
    ) {
        self.push(CbEvent::DataSent(address));
    }

    fn on_data_send_failed(
        &self,
        _handle: SessionHandle,
        address: u64,
        _params: SendDataParams,
        status: UciStatus,
    ) {
        self.push(CbEvent::DataSendFailed(address, status));
    }

    fn on_ranging_rounds_update_status(
        &self,
        _handle: SessionHandle,
        failed_indices: Vec<u8>,
    ) {
        self.push(CbEvent::RoundsUpdate(failed_indices));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<CbEvent>) -> CbEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("callback channel closed")
}

pub async fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<CbEvent>) {
    if let Ok(event) = timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("expected no callback, got {event:?}");
    }
}

// ---------------------------------------------------------------------------
// Session-manager scaffolding
// ---------------------------------------------------------------------------

pub fn setup_manager() -> (SessionManager, Arc<FakeUwbDevice>) {
    let device = FakeUwbDevice::new();
    let manager = SessionManager::new(Config::default(), device.clone());
    device.attach(manager.uci_notification_sender());
    (manager, device)
}

pub fn privileged_attribution() -> AppIdentityChain {
    vec![AppIdentity {
        uid: 1000,
        package: "com.android.uwb".to_string(),
        privileged: true,
    }]
}

pub fn app_attribution(uid: i32) -> AppIdentityChain {
    vec![AppIdentity {
        uid,
        package: format!("com.example.app{uid}"),
        privileged: false,
    }]
}

pub fn fira_params() -> ProtocolParams {
    ProtocolParams::Fira(FiraAppConfig::default())
}

pub fn owr_aoa_observer_params() -> ProtocolParams {
    ProtocolParams::Fira(FiraAppConfig {
        ranging_round_usage: RANGING_ROUND_USAGE_OWR_AOA,
        device_role: DEVICE_ROLE_OBSERVER,
        mac_address_mode: MacAddressMode::Short,
        ..FiraAppConfig::default()
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn open_session(
    manager: &SessionManager,
    handle: SessionHandle,
    session_id: u32,
    params: ProtocolParams,
    attribution: AppIdentityChain,
    callbacks: Arc<RecordingCallbacks>,
    rx: &mut mpsc::UnboundedReceiver<CbEvent>,
) {
    manager
        .init_session(
            handle,
            session_id,
            SessionType::Ranging,
            Protocol::Fira,
            params,
            attribution,
            callbacks,
            CHIP_ID,
        )
        .await
        .expect("init_session");
    assert_eq!(next_event(rx).await, CbEvent::Opened);
}

pub async fn start_session(
    manager: &SessionManager,
    handle: SessionHandle,
    rx: &mut mpsc::UnboundedReceiver<CbEvent>,
) {
    manager.start_ranging(handle, None).await.expect("start_ranging");
    assert_eq!(next_event(rx).await, CbEvent::Started);
}

// ---------------------------------------------------------------------------
// Fake FiRa applet + OOB peer for the dynamic-STS scenarios
// ---------------------------------------------------------------------------

/// Dispatch payload the peer sends to mark the channel as established.
pub const ESTABLISHED_TOKEN: &[u8] = b"EST";
/// Dispatch payload triggering an RDS-available notification.
pub const RDS_TOKEN: &[u8] = b"RDS";

pub const FAKE_SLOT: &[u8] = &[0xAB];

/// In-process FiRa applet standing behind the SE transport. Commands
/// are answered from a small script so both channel ends of the dialog
/// can be driven deterministically.
pub struct FakeApplet {
    aid: Vec<u8>,
    /// Session id this applet attaches to RDS notifications.
    pub rds_session_id: u32,
    /// Inline session data for RDS triggered via [`RDS_TOKEN`].
    pub rds_inline_session_data: Mutex<Option<Vec<u8>>>,
    /// Emit the RDS notification directly on a tunneled PUT SESSION
    /// DATA (the applet pushed the RDS to SUS itself).
    pub rds_on_put_session_data: bool,

    pub open_channels: Mutex<Vec<u8>>,
    pub closed_channels: Mutex<Vec<u8>>,
    pub local_put_do: Mutex<Vec<Vec<u8>>>,
    pub swapped_in: Mutex<Vec<Vec<u8>>>,
    pub swapped_out: Mutex<Vec<Vec<u8>>>,
    next_channel: Mutex<u8>,
}

impl FakeApplet {
    pub fn new(aid: Vec<u8>, rds_session_id: u32) -> Arc<Self> {
        Arc::new(Self {
            aid,
            rds_session_id,
            rds_inline_session_data: Mutex::new(None),
            rds_on_put_session_data: true,
            open_channels: Mutex::new(Vec::new()),
            closed_channels: Mutex::new(Vec::new()),
            local_put_do: Mutex::new(Vec::new()),
            swapped_in: Mutex::new(Vec::new()),
            swapped_out: Mutex::new(Vec::new()),
            next_channel: Mutex::new(1),
        })
    }

    pub fn with_inline_rds(aid: Vec<u8>, session_id: u32, data: Vec<u8>) -> Arc<Self> {
        let applet = Self::new(aid, session_id);
        *applet.rds_inline_session_data.lock().expect("rds lock") = Some(data);
        applet
    }

    fn payload_of(apdu: &CommandApdu) -> Vec<u8> {
        Tlv::parse_all(apdu.payload())
            .ok()
            .and_then(|map| map.get_first(0x81u16).map(|t| t.value.clone()))
            .unwrap_or_default()
    }

    fn handle_dispatch(&self, payload: &[u8]) -> ResponseApdu {
        if payload == ESTABLISHED_TOKEN {
            return encode::response(
                TransactionStatus::Complete,
                None,
                &[encode::secure_channel_established(None)],
            );
        }
        if payload == RDS_TOKEN {
            let inline = self.rds_inline_session_data.lock().expect("rds lock").clone();
            return encode::response(
                TransactionStatus::Complete,
                None,
                &[encode::rds_available(self.rds_session_id, inline.as_deref())],
            );
        }
        if let Ok(apdu) = CommandApdu::parse(payload)
            && apdu.ins == INS_SELECT
        {
            // Peer's applet SELECT on the responder side.
            return encode::response(TransactionStatus::Complete, None, &[]);
        }
        // Anything else is the peer's answer to a tunneled request.
        encode::response(TransactionStatus::ForwardToHost, Some(payload), &[])
    }

    fn handle_tunnel(&self, payload: Vec<u8>) -> ResponseApdu {
        let mut notifications = Vec::new();
        if self.rds_on_put_session_data
            && let Ok(inner) = CommandApdu::parse(&payload)
            && inner.ins == INS_PUT_DO
            && let Ok(data) = SessionData::from_bytes(inner.payload())
        {
            let id = data.session_id().unwrap_or(self.rds_session_id);
            notifications.push(encode::rds_available(id, None));
        }
        encode::response(
            TransactionStatus::ForwardToRemote,
            Some(payload.as_slice()),
            &notifications,
        )
    }

    fn handle_get_do(&self, apdu: &CommandApdu) -> ResponseApdu {
        let request = apdu.payload();
        let wants = |tag: [u8; 2]| request.windows(2).any(|w| w == tag.as_slice());
        if wants([0xBF, 0x79]) {
            return ResponseApdu::status_only(StatusWord::NO_ERROR);
        }
        if wants([0xBF, 0x78]) {
            if let Some(data) =
                self.rds_inline_session_data.lock().expect("rds lock").clone()
            {
                return ResponseApdu::new(data, StatusWord::NO_ERROR);
            }
            return ResponseApdu::status_only(StatusWord::FILE_NOT_FOUND);
        }
        ResponseApdu::status_only(StatusWord::FILE_NOT_FOUND)
    }
}

impl SeTransport for FakeApplet {
    fn open_logical_channel(&self, aid: &[u8]) -> anyhow::Result<(u8, Vec<u8>)> {
        assert_eq!(aid, self.aid, "unexpected applet AID");
        let mut next = self.next_channel.lock().expect("channel lock");
        let channel = *next;
        *next += 1;
        self.open_channels.lock().expect("open lock").push(channel);
        Ok((channel, StatusWord::NO_ERROR.to_bytes().to_vec()))
    }

    fn transmit(&self, apdu: &[u8]) -> anyhow::Result<Vec<u8>> {
        let apdu = CommandApdu::parse(apdu)?;
        let rsp = match apdu.ins {
            INS_SELECT_ADF => {
                let selected = Tlv::parse_all(apdu.payload())?
                    .get_first(0x06u16)
                    .map(|t| t.value.clone())
                    .unwrap_or_default();
                ResponseApdu::new(
                    Tlv::new(0x06u16, selected).to_bytes(),
                    StatusWord::NO_ERROR,
                )
            },
            INS_SWAP_ADF if apdu.p1 == 0x00 => {
                self.swapped_in
                    .lock()
                    .expect("swap lock")
                    .push(apdu.payload().to_vec());
                ResponseApdu::new(
                    Tlv::new(0x80u16, FAKE_SLOT.to_vec()).to_bytes(),
                    StatusWord::NO_ERROR,
                )
            },
            INS_SWAP_ADF => {
                let slot = Tlv::parse_all(apdu.payload())?
                    .get_first(0x80u16)
                    .map(|t| t.value.clone())
                    .unwrap_or_default();
                self.swapped_out.lock().expect("swap lock").push(slot);
                ResponseApdu::status_only(StatusWord::NO_ERROR)
            },
            INS_INITIATE_TRANSACTION => {
                let select = common::select_applet_apdu(&self.aid).encode();
                ResponseApdu::new(
                    Tlv::new(0x81u16, select).to_bytes(),
                    StatusWord::NO_ERROR,
                )
            },
            INS_DISPATCH => self.handle_dispatch(&Self::payload_of(&apdu)),
            INS_TUNNEL => self.handle_tunnel(Self::payload_of(&apdu)),
            INS_GET_DO => self.handle_get_do(&apdu),
            INS_PUT_DO => {
                self.local_put_do
                    .lock()
                    .expect("put lock")
                    .push(apdu.payload().to_vec());
                ResponseApdu::status_only(StatusWord::NO_ERROR)
            },
            _ => ResponseApdu::status_only(StatusWord::FUNCTION_NOT_SUPPORTED),
        };
        Ok(rsp.to_bytes())
    }

    fn close_logical_channel(&self, channel: u8) -> anyhow::Result<()> {
        self.closed_channels.lock().expect("close lock").push(channel);
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Remote device stub for initiator-side tests: answers the applet
/// SELECT with the establishment token and replies to tunneled GET/PUT
/// DOs like a provisioned peer would.
pub fn spawn_peer_responder(mut oob: OobLink, controlee_info: Vec<u8>) {
    tokio::spawn(async move {
        let mut rx = oob.take_receiver().expect("peer oob receiver");
        while let Some(frame) = rx.recv().await {
            let Ok(apdu) = CommandApdu::parse(&frame) else {
                continue;
            };
            let reply = match apdu.ins {
                INS_SELECT => Bytes::from_static(ESTABLISHED_TOKEN),
                INS_GET_DO => Bytes::from(
                    ResponseApdu::new(controlee_info.clone(), StatusWord::NO_ERROR)
                        .to_bytes(),
                ),
                INS_PUT_DO => {
                    Bytes::from(ResponseApdu::status_only(StatusWord::NO_ERROR).to_bytes())
                },
                _ => continue,
            };
            if oob.send(reply).await.is_err() {
                break;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Recording secure-session callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SecureEvent {
    Ready {
        session_id: u32,
        session_data: Option<SessionData>,
    },
    Aborted,
    Terminated,
}

pub struct RecordingSecureCallback {
    tx: mpsc::UnboundedSender<SecureEvent>,
}

pub fn recording_secure_callback()
-> (Box<RecordingSecureCallback>, mpsc::UnboundedReceiver<SecureEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(RecordingSecureCallback { tx }), rx)
}

impl SecureSessionCallback for RecordingSecureCallback {
    fn on_session_data_ready(
        &mut self,
        session_id: u32,
        session_data: Option<SessionData>,
        _is_terminated: bool,
    ) {
        let _ = self.tx.send(SecureEvent::Ready {
            session_id,
            session_data,
        });
    }

    fn on_session_aborted(&mut self) {
        let _ = self.tx.send(SecureEvent::Aborted);
    }

    fn on_session_terminated(&mut self) {
        let _ = self.tx.send(SecureEvent::Terminated);
    }
}

pub async fn next_secure_event(
    rx: &mut mpsc::UnboundedReceiver<SecureEvent>,
) -> SecureEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a secure-session event")
        .expect("secure event channel closed")
}
