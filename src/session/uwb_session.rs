// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tracing::debug;

use crate::{
    session::callbacks::RangingCallbacks,
    uci::{
        notification::{
            MulticastListUpdateNtf, OwrAoaMeasurement, ReasonCode, SessionState,
        },
        params::{Protocol, ProtocolParams, RangeDataNtfConfig, SessionType},
    },
};

/// Opaque client-scoped key for a session; the 32-bit UCI session id is
/// a separate, device-scoped index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Last command issued for a session; at most one may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Idle,
    OpenRanging,
    StartRanging,
    StopRanging,
    Reconfigure,
    SendData,
    DeInit,
}

/// One link of the caller provenance chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub uid: i32,
    pub package: String,
    pub privileged: bool,
}

pub type AppIdentityChain = Vec<AppIdentity>;

/// One buffered inbound application-data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDataInfo {
    pub session_id: u32,
    pub status: u8,
    pub sequence_num: u16,
    pub address: u64,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub payload: Bytes,
}

/// Closed-session residue kept in the diagnostics LRU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSessionSnapshot {
    pub session_id: u32,
    pub session_type: SessionType,
    pub last_state: SessionState,
}

#[derive(Default)]
struct SessionAlarms {
    background: Option<JoinHandle<()>>,
    error_streak: Option<JoinHandle<()>>,
}

/// Per-session state owned by the session manager. Controlee list,
/// receive buffer and timers belong exclusively to this struct; state
/// transitions come in from the notification pump only.
pub struct UwbSession {
    pub handle: SessionHandle,
    pub session_id: u32,
    pub session_type: SessionType,
    pub protocol: Protocol,
    pub chip_id: String,
    pub attribution: AppIdentityChain,
    pub callbacks: Arc<dyn RangingCallbacks>,

    params: Mutex<ProtocolParams>,
    state_tx: watch::Sender<(SessionState, ReasonCode)>,
    operation: Mutex<OperationType>,
    controlees: Mutex<Vec<u16>>,

    received_data: Mutex<BTreeMap<u64, BTreeMap<u16, ReceivedDataInfo>>>,
    advertisers: Mutex<HashMap<u64, OwrAoaMeasurement>>,
    data_send_seq: AtomicU8,

    multicast_ntf: Mutex<Option<MulticastListUpdateNtf>>,
    multicast_notify: Notify,

    pub ranging_error_streak_timeout: Duration,
    has_non_privileged_fg_app: AtomicBool,
    orig_range_data_ntf_config: Mutex<Option<RangeDataNtfConfig>>,
    current_ranging_interval_ms: AtomicU32,

    alarms: Mutex<SessionAlarms>,
}

impl fmt::Debug for UwbSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UwbSession")
            .field("handle", &self.handle)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl UwbSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: SessionHandle,
        session_id: u32,
        session_type: SessionType,
        protocol: Protocol,
        params: ProtocolParams,
        attribution: AppIdentityChain,
        callbacks: Arc<dyn RangingCallbacks>,
        chip_id: String,
        error_streak_timeout: Duration,
        ranging_interval_ms: u32,
    ) -> Self {
        let (state_tx, _) =
            watch::channel((SessionState::Deinit, ReasonCode::ManagementCommand));
        Self {
            handle,
            session_id,
            session_type,
            protocol,
            chip_id,
            attribution,
            callbacks,
            params: Mutex::new(params),
            state_tx,
            operation: Mutex::new(OperationType::Idle),
            controlees: Mutex::new(Vec::new()),
            received_data: Mutex::new(BTreeMap::new()),
            advertisers: Mutex::new(HashMap::new()),
            data_send_seq: AtomicU8::new(0),
            multicast_ntf: Mutex::new(None),
            multicast_notify: Notify::new(),
            ranging_error_streak_timeout: error_streak_timeout,
            has_non_privileged_fg_app: AtomicBool::new(true),
            orig_range_data_ntf_config: Mutex::new(None),
            current_ranging_interval_ms: AtomicU32::new(ranging_interval_ms),
            alarms: Mutex::new(SessionAlarms::default()),
        }
    }

    // ---- state machine plumbing ----

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().0
    }

    /// Called from the notification pump only; host commands never set
    /// state directly.
    pub fn set_state(&self, state: SessionState, reason: ReasonCode) {
        debug!(session_id = self.session_id, ?state, ?reason, "session state");
        let _ = self.state_tx.send((state, reason));
    }

    /// Park until the device reports `target`, bounded by `wait`.
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        wait: Duration,
    ) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        timeout(wait, rx.wait_for(|(s, _)| *s == target))
            .await
            .map_err(|_| anyhow!("timed out waiting for {target:?}"))?
            .map_err(|_| anyhow!("session dropped while waiting for {target:?}"))?;
        Ok(())
    }

    pub fn operation(&self) -> OperationType {
        *self.operation.lock().expect("operation lock poisoned")
    }

    pub fn set_operation(&self, op: OperationType) {
        *self.operation.lock().expect("operation lock poisoned") = op;
    }

    // ---- parameters ----

    pub fn params(&self) -> ProtocolParams {
        self.params.lock().expect("params lock poisoned").clone()
    }

    pub fn update_params(&self, params: ProtocolParams) {
        *self.params.lock().expect("params lock poisoned") = params;
    }

    pub fn current_ranging_interval_ms(&self) -> u32 {
        self.current_ranging_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_current_ranging_interval_ms(&self, ms: u32) {
        self.current_ranging_interval_ms.store(ms, Ordering::Relaxed);
    }

    // ---- controlee list ----

    pub fn controlee_list(&self) -> Vec<u16> {
        self.controlees.lock().expect("controlees lock poisoned").clone()
    }

    pub fn add_controlee(&self, address: u16) {
        let mut list = self.controlees.lock().expect("controlees lock poisoned");
        if !list.contains(&address) {
            list.push(address);
        }
    }

    pub fn remove_controlee(&self, address: u16) {
        self.controlees
            .lock()
            .expect("controlees lock poisoned")
            .retain(|a| *a != address);
    }

    // ---- received-data buffer ----

    /// Buffer a packet under `(remote, seq)`; duplicates by sequence
    /// number are dropped.
    pub fn insert_received(&self, info: ReceivedDataInfo) {
        let mut map = self.received_data.lock().expect("recv buffer lock poisoned");
        map.entry(info.address)
            .or_default()
            .entry(info.sequence_num)
            .or_insert(info);
    }

    /// Remove and return everything buffered for `remote`, in strictly
    /// increasing sequence order.
    pub fn drain_received(&self, remote: u64) -> Vec<ReceivedDataInfo> {
        let mut map = self.received_data.lock().expect("recv buffer lock poisoned");
        map.remove(&remote)
            .map(|per_seq| per_seq.into_values().collect())
            .unwrap_or_default()
    }

    pub fn received_backlog(&self, remote: u64) -> usize {
        self.received_data
            .lock()
            .expect("recv buffer lock poisoned")
            .get(&remote)
            .map_or(0, BTreeMap::len)
    }

    pub fn purge_received(&self) {
        self.received_data
            .lock()
            .expect("recv buffer lock poisoned")
            .clear();
    }

    // ---- OWR-AoA advertiser bookkeeping ----

    pub fn update_advertiser(&self, remote: u64, measurement: OwrAoaMeasurement) {
        self.advertisers
            .lock()
            .expect("advertiser lock poisoned")
            .insert(remote, measurement);
    }

    pub fn forget_advertiser(&self, remote: u64) {
        self.advertisers
            .lock()
            .expect("advertiser lock poisoned")
            .remove(&remote);
    }

    pub fn purge_advertisers(&self) {
        self.advertisers.lock().expect("advertiser lock poisoned").clear();
    }

    // ---- data-send sequencing ----

    pub fn data_send_seq(&self) -> u8 {
        self.data_send_seq.load(Ordering::Relaxed)
    }

    /// Advance only after the device accepted the packet.
    pub fn advance_data_send_seq(&self) {
        self.data_send_seq.fetch_add(1, Ordering::Relaxed);
    }

    // ---- multicast-update rendezvous ----

    pub fn offer_multicast_ntf(&self, ntf: MulticastListUpdateNtf) {
        *self
            .multicast_ntf
            .lock()
            .expect("multicast slot lock poisoned") = Some(ntf);
        self.multicast_notify.notify_one();
    }

    pub async fn wait_for_multicast_ntf(
        &self,
        wait: Duration,
    ) -> Result<MulticastListUpdateNtf> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(ntf) = self
                .multicast_ntf
                .lock()
                .expect("multicast slot lock poisoned")
                .take()
            {
                return Ok(ntf);
            }
            timeout_at(deadline, self.multicast_notify.notified())
                .await
                .map_err(|_| anyhow!("timed out waiting for multicast update"))?;
        }
    }

    // ---- policy bookkeeping ----

    pub fn is_non_privileged(&self) -> bool {
        self.attribution.iter().any(|a| !a.privileged)
    }

    pub fn non_privileged_uids(&self) -> Vec<i32> {
        self.attribution
            .iter()
            .filter(|a| !a.privileged)
            .map(|a| a.uid)
            .collect()
    }

    pub fn has_non_privileged_fg_app(&self) -> bool {
        self.has_non_privileged_fg_app.load(Ordering::Relaxed)
    }

    pub fn set_has_non_privileged_fg_app(&self, fg: bool) {
        self.has_non_privileged_fg_app.store(fg, Ordering::Relaxed);
    }

    pub fn save_orig_ntf_config(&self, config: RangeDataNtfConfig) {
        let mut slot = self
            .orig_range_data_ntf_config
            .lock()
            .expect("ntf config lock poisoned");
        if slot.is_none() {
            *slot = Some(config);
        }
    }

    pub fn take_orig_ntf_config(&self) -> Option<RangeDataNtfConfig> {
        self.orig_range_data_ntf_config
            .lock()
            .expect("ntf config lock poisoned")
            .take()
    }

    // ---- alarms ----

    pub fn arm_background_alarm(&self, task: JoinHandle<()>) {
        let mut alarms = self.alarms.lock().expect("alarms lock poisoned");
        if let Some(old) = alarms.background.replace(task) {
            old.abort();
        }
    }

    pub fn cancel_background_alarm(&self) {
        if let Some(task) = self
            .alarms
            .lock()
            .expect("alarms lock poisoned")
            .background
            .take()
        {
            task.abort();
        }
    }

    pub fn arm_error_streak_alarm(&self, task: JoinHandle<()>) {
        let mut alarms = self.alarms.lock().expect("alarms lock poisoned");
        if alarms.error_streak.is_none() {
            alarms.error_streak = Some(task);
        } else {
            // Watchdog already running; the fresh task is redundant.
            task.abort();
        }
    }

    pub fn error_streak_alarm_armed(&self) -> bool {
        self.alarms
            .lock()
            .expect("alarms lock poisoned")
            .error_streak
            .is_some()
    }

    pub fn cancel_error_streak_alarm(&self) {
        if let Some(task) = self
            .alarms
            .lock()
            .expect("alarms lock poisoned")
            .error_streak
            .take()
        {
            task.abort();
        }
    }

    pub fn cancel_all_alarms(&self) {
        self.cancel_background_alarm();
        self.cancel_error_streak_alarm();
    }

    pub fn snapshot(&self) -> ClosedSessionSnapshot {
        ClosedSessionSnapshot {
            session_id: self.session_id,
            session_type: self.session_type,
            last_state: self.state(),
        }
    }
}
