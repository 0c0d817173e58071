// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    sync::{mpsc, oneshot},
    task,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    models::csml::session_data::SessionData,
    secure_session::{SecureSessionCallback, SecureSessionHandle},
    session::{
        SessionError,
        callbacks::{ApiReason, RangingCallbacks, SendDataParams},
        ranging::{derive_owr_remote_address, is_pointed_target},
        uwb_session::{
            AppIdentityChain, ClosedSessionSnapshot, OperationType, ReceivedDataInfo,
            SessionHandle, UwbSession,
        },
    },
    uci::{
        hal::{UciHal, UciStatus},
        notification::{
            MEASUREMENT_STATUS_OK, OwrAoaMeasurement, RangeDataNtf,
            RangingMeasurementType, ReasonCode, SessionState, UciNotification,
        },
        packets::DataRcvPacket,
        params::{
            AppConfigTlv, Protocol, ProtocolParams, RangeDataNtfConfig,
            ReconfigureParams, SessionType, app_config,
        },
    },
    utils::extended_address_bytes,
};

/// Platform extension hook second-guessing the pointed-target verdict.
pub type PointedTargetOverride =
    dyn Fn(&OwrAoaMeasurement) -> Option<bool> + Send + Sync;

/// Work items of the single-threaded session event loop.
enum SessionEvent {
    Open {
        handle: SessionHandle,
    },
    Start {
        handle: SessionHandle,
        params: Option<ProtocolParams>,
    },
    Stop {
        handle: SessionHandle,
        reason: ApiReason,
    },
    Reconfigure {
        handle: SessionHandle,
        params: ReconfigureParams,
    },
    DeInit {
        handle: SessionHandle,
        reason: ApiReason,
    },
    SendData {
        handle: SessionHandle,
        remote: u64,
        params: SendDataParams,
        data: Bytes,
    },
    RangingRoundsUpdate {
        handle: SessionHandle,
        round_indices: Vec<u8>,
    },
    QueryMaxDataSize {
        handle: SessionHandle,
        reply: oneshot::Sender<Result<u32>>,
    },
    SessionStatusRouted {
        session_id: u32,
        prev: SessionState,
        state: SessionState,
        reason: ReasonCode,
    },
    RangeData(RangeDataNtf),
    DataReceived(Bytes),
    AppImportance {
        uid: i32,
        foreground: bool,
    },
    BackgroundAlarmFired {
        handle: SessionHandle,
    },
    ErrorStreakFired {
        handle: SessionHandle,
    },
    InstallSessionData {
        handle: SessionHandle,
        secure_session_id: u32,
        data: Option<SessionData>,
    },
}

struct Inner {
    config: Config,
    hal: Arc<dyn UciHal>,
    sessions: DashMap<SessionHandle, Arc<UwbSession>>,
    by_id: DashMap<u32, SessionHandle>,
    by_uid: DashMap<i32, Vec<SessionHandle>>,
    foreground_uids: DashMap<i32, bool>,
    secure_sessions: DashMap<SessionHandle, SecureSessionHandle>,
    recently_closed: Mutex<VecDeque<ClosedSessionSnapshot>>,
    pointed_target_override: OnceCell<Box<PointedTargetOverride>>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

/// Owner of the session table and the event queue. One UCI command per
/// session is in flight at any time; every client request is serialized
/// through the event loop and completed via the session's callbacks.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
    uci_tx: mpsc::Sender<UciNotification>,
}

impl SessionManager {
    pub fn new(config: Config, hal: Arc<dyn UciHal>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (uci_tx, uci_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            config,
            hal,
            sessions: DashMap::new(),
            by_id: DashMap::new(),
            by_uid: DashMap::new(),
            foreground_uids: DashMap::new(),
            secure_sessions: DashMap::new(),
            recently_closed: Mutex::new(VecDeque::new()),
            pointed_target_override: OnceCell::new(),
            event_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(Inner::event_loop(inner.clone(), event_rx, cancel.clone()));
        tokio::spawn(Inner::notification_pump(inner.clone(), uci_rx, cancel));

        Self { inner, uci_tx }
    }

    /// Channel the native layer pushes its notifications into.
    pub fn uci_notification_sender(&self) -> mpsc::Sender<UciNotification> {
        self.uci_tx.clone()
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    // ---- public operations (validated here, executed on the loop) ----

    #[allow(clippy::too_many_arguments)]
    pub async fn init_session(
        &self,
        handle: SessionHandle,
        session_id: u32,
        session_type: SessionType,
        protocol: Protocol,
        params: ProtocolParams,
        attribution: AppIdentityChain,
        callbacks: Arc<dyn RangingCallbacks>,
        chip_id: &str,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.by_id.contains_key(&session_id) || inner.sessions.contains_key(&handle)
        {
            callbacks.on_ranging_open_failed(
                handle,
                ApiReason::BadParameters,
                UciStatus::SessionDuplicate,
            );
            return Err(SessionError::Duplicate(session_id));
        }
        if inner.sessions.len() as u32 >= inner.max_sessions() {
            callbacks.on_ranging_open_failed(
                handle,
                ApiReason::MaxSessionsReached,
                UciStatus::MaxSessionsExceeded,
            );
            return Err(SessionError::MaxSessions);
        }

        let non_privileged_uids: Vec<i32> = attribution
            .iter()
            .filter(|a| !a.privileged)
            .map(|a| a.uid)
            .collect();
        let any_foreground = non_privileged_uids.is_empty()
            || non_privileged_uids
                .iter()
                .any(|uid| inner.foreground_uids.get(uid).map(|e| *e).unwrap_or(true));
        if !any_foreground {
            callbacks.on_ranging_open_failed(
                handle,
                ApiReason::SystemPolicy,
                UciStatus::Rejected,
            );
            return Err(SessionError::SystemPolicy);
        }

        let ranging_interval = params
            .fira()
            .map(|f| f.ranging_duration_ms)
            .unwrap_or(200);
        let session = Arc::new(UwbSession::new(
            handle,
            session_id,
            session_type,
            protocol,
            params,
            attribution,
            callbacks,
            chip_id.to_string(),
            inner.config.service.ranging_error_streak_timeout,
            ranging_interval,
        ));

        inner.sessions.insert(handle, session.clone());
        inner.by_id.insert(session_id, handle);
        for uid in session.non_privileged_uids() {
            inner.by_uid.entry(uid).or_default().push(handle);
        }

        self.post(SessionEvent::Open { handle }).await
    }

    pub async fn deinit_session(&self, handle: SessionHandle) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::DeInit {
            handle,
            reason: ApiReason::LocalApi,
        })
        .await
    }

    /// Client binder death is an implicit de-init.
    pub async fn on_client_gone(&self, handle: SessionHandle) {
        let _ = self
            .post(SessionEvent::DeInit {
                handle,
                reason: ApiReason::Unknown,
            })
            .await;
    }

    pub async fn start_ranging(
        &self,
        handle: SessionHandle,
        params: Option<ProtocolParams>,
    ) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::Start { handle, params }).await
    }

    pub async fn stop_ranging(&self, handle: SessionHandle) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::Stop {
            handle,
            reason: ApiReason::LocalApi,
        })
        .await
    }

    pub async fn reconfigure(
        &self,
        handle: SessionHandle,
        params: ReconfigureParams,
    ) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::Reconfigure { handle, params }).await
    }

    pub async fn send_data(
        &self,
        handle: SessionHandle,
        remote: u64,
        params: SendDataParams,
        data: Bytes,
    ) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::SendData {
            handle,
            remote,
            params,
            data,
        })
        .await
    }

    pub async fn ranging_rounds_update_dt_tag(
        &self,
        handle: SessionHandle,
        round_indices: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.ensure_known(handle)?;
        self.post(SessionEvent::RangingRoundsUpdate {
            handle,
            round_indices,
        })
        .await
    }

    pub async fn query_max_data_size(&self, handle: SessionHandle) -> Result<u32> {
        self.ensure_known(handle).map_err(|e| anyhow!(e))?;
        let (reply, rx) = oneshot::channel();
        self.post(SessionEvent::QueryMaxDataSize { handle, reply })
            .await
            .map_err(|e| anyhow!(e))?;
        rx.await.map_err(|_| anyhow!("query dropped"))?
    }

    pub async fn on_app_importance_change(&self, uid: i32, foreground: bool) {
        let _ = self.post(SessionEvent::AppImportance { uid, foreground }).await;
    }

    // ---- introspection ----

    pub fn get_session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_existed_session(&self, session_id: u32) -> bool {
        self.inner.by_id.contains_key(&session_id)
    }

    pub fn get_session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.inner.sessions.get(&handle).map(|s| s.state())
    }

    pub fn get_controlee_list(&self, handle: SessionHandle) -> Vec<u16> {
        self.inner
            .sessions
            .get(&handle)
            .map(|s| s.controlee_list())
            .unwrap_or_default()
    }

    /// Packets buffered for `remote` and not yet delivered.
    pub fn received_backlog(&self, handle: SessionHandle, remote: u64) -> usize {
        self.inner
            .sessions
            .get(&handle)
            .map(|s| s.received_backlog(remote))
            .unwrap_or(0)
    }

    pub fn recently_closed(&self) -> Vec<ClosedSessionSnapshot> {
        self.inner
            .recently_closed
            .lock()
            .expect("recently-closed lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Install the platform pointed-target extension; first caller
    /// wins.
    pub fn set_pointed_target_override(&self, f: Box<PointedTargetOverride>) {
        let _ = self.inner.pointed_target_override.set(f);
    }

    // ---- dynamic STS wiring ----

    /// Completion bridge handed to a [`crate::secure_session::SecureSession`]
    /// provisioning keys for `handle`.
    pub fn secure_session_bridge(
        &self,
        handle: SessionHandle,
    ) -> Box<dyn SecureSessionCallback> {
        Box::new(SecureSessionBridge {
            handle,
            event_tx: self.inner.event_tx.clone(),
        })
    }

    /// Tie a running secure session to the UWB session so teardown can
    /// reach it.
    pub fn attach_secure_session(
        &self,
        handle: SessionHandle,
        secure: SecureSessionHandle,
    ) {
        self.inner.secure_sessions.insert(handle, secure);
    }

    // ---- internals ----

    fn ensure_known(&self, handle: SessionHandle) -> Result<(), SessionError> {
        if self.inner.sessions.contains_key(&handle) {
            Ok(())
        } else {
            Err(SessionError::UnknownHandle)
        }
    }

    async fn post(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.inner
            .event_tx
            .send(event)
            .await
            .map_err(|_| SessionError::ServiceStopped)
    }
}

struct SecureSessionBridge {
    handle: SessionHandle,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SecureSessionCallback for SecureSessionBridge {
    fn on_session_data_ready(
        &mut self,
        session_id: u32,
        session_data: Option<SessionData>,
        _is_terminated: bool,
    ) {
        let _ = self.event_tx.try_send(SessionEvent::InstallSessionData {
            handle: self.handle,
            secure_session_id: session_id,
            data: session_data,
        });
    }

    fn on_session_aborted(&mut self) {
        warn!(handle = %self.handle, "dynamic STS provisioning aborted");
    }

    fn on_session_terminated(&mut self) {
        debug!(handle = %self.handle, "secure session terminated");
    }
}

impl Inner {
    fn max_sessions(&self) -> u32 {
        match self.hal.get_max_session_number() {
            0 => self.config.service.max_sessions_fallback,
            n => n,
        }
    }

    fn session(&self, handle: SessionHandle) -> Option<Arc<UwbSession>> {
        self.sessions.get(&handle).map(|s| s.clone())
    }

    fn session_by_id(&self, session_id: u32) -> Option<Arc<UwbSession>> {
        let handle = self.by_id.get(&session_id).map(|h| *h)?;
        self.session(handle)
    }

    /// Run one native call on the blocking pool. The command itself is
    /// assumed to return promptly; the bounded wait is on the follow-up
    /// notification.
    async fn exec_native<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        task::spawn_blocking(f)
            .await
            .map_err(|e| anyhow!("native task failed: {e}"))
    }

    async fn notification_pump(
        inner: Arc<Inner>,
        mut rx: mpsc::Receiver<UciNotification>,
        cancel: CancellationToken,
    ) {
        loop {
            let ntf = tokio::select! {
                _ = cancel.cancelled() => break,
                ntf = rx.recv() => match ntf {
                    Some(n) => n,
                    None => break,
                },
            };
            match ntf {
                UciNotification::SessionStatus(n) => {
                    let Some(session) = inner.session_by_id(n.session_id) else {
                        debug!(session_id = n.session_id, "status for unknown session");
                        continue;
                    };
                    let prev = session.state();
                    // Wake the blocked waiter first, then let the loop
                    // route the side effects.
                    session.set_state(n.state, n.reason);
                    let _ = inner
                        .event_tx
                        .send(SessionEvent::SessionStatusRouted {
                            session_id: n.session_id,
                            prev,
                            state: n.state,
                            reason: n.reason,
                        })
                        .await;
                },
                UciNotification::MulticastListUpdate(n) => {
                    if let Some(session) = inner.session_by_id(n.session_id) {
                        session.offer_multicast_ntf(n);
                    }
                },
                UciNotification::RangeData(n) => {
                    let _ = inner.event_tx.send(SessionEvent::RangeData(n)).await;
                },
                UciNotification::DataReceived(bytes) => {
                    let _ =
                        inner.event_tx.send(SessionEvent::DataReceived(bytes)).await;
                },
            }
        }
    }

    async fn event_loop(
        inner: Arc<Inner>,
        mut rx: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };
            inner.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Open { handle } => self.handle_open(handle).await,
            SessionEvent::Start { handle, params } => {
                self.handle_start(handle, params).await
            },
            SessionEvent::Stop { handle, reason } => {
                self.handle_stop(handle, reason).await
            },
            SessionEvent::Reconfigure { handle, params } => {
                self.handle_reconfigure(handle, params).await
            },
            SessionEvent::DeInit { handle, reason } => {
                self.handle_deinit(handle, reason).await
            },
            SessionEvent::SendData {
                handle,
                remote,
                params,
                data,
            } => self.handle_send_data(handle, remote, params, data).await,
            SessionEvent::RangingRoundsUpdate {
                handle,
                round_indices,
            } => self.handle_ranging_rounds_update(handle, round_indices).await,
            SessionEvent::QueryMaxDataSize { handle, reply } => {
                let _ = reply.send(self.handle_query_data_size(handle).await);
            },
            SessionEvent::SessionStatusRouted {
                session_id,
                prev,
                state,
                reason,
            } => self.route_session_status(session_id, prev, state, reason).await,
            SessionEvent::RangeData(ntf) => self.handle_range_data(ntf),
            SessionEvent::DataReceived(bytes) => self.handle_data_received(bytes),
            SessionEvent::AppImportance { uid, foreground } => {
                self.handle_app_importance(uid, foreground).await
            },
            SessionEvent::BackgroundAlarmFired { handle } => {
                info!(%handle, "background app kept ranging too long");
                self.handle_stop(handle, ApiReason::SystemPolicy).await;
            },
            SessionEvent::ErrorStreakFired { handle } => {
                info!(%handle, "continuous ranging errors, stopping session");
                self.handle_stop(handle, ApiReason::SystemPolicy).await;
            },
            SessionEvent::InstallSessionData {
                handle,
                secure_session_id,
                data,
            } => self.handle_install_session_data(handle, secure_session_id, data).await,
        }
    }

    // ---- lifecycle handlers ----

    async fn handle_open(&self, handle: SessionHandle) {
        let Some(session) = self.session(handle) else {
            return;
        };
        session.set_operation(OperationType::OpenRanging);
        let wait = self.config.service.open_threshold;

        let hal = self.hal.clone();
        let (id, st, chip) =
            (session.session_id, session.session_type, session.chip_id.clone());
        let status = match self
            .exec_native(move || hal.init_session(id, st, &chip))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(%handle, "SESSION_INIT dispatch failed: {e:#}");
                UciStatus::Failed
            },
        };
        if !status.is_ok() {
            self.fail_open(&session, status).await;
            return;
        }
        if let Err(e) = session.wait_for_state(SessionState::Init, wait).await {
            warn!(%handle, "open: {e:#}");
            self.fail_open(&session, UciStatus::Failed).await;
            return;
        }

        let hal = self.hal.clone();
        let tlvs = session.params().to_tlvs();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = match self
            .exec_native(move || hal.set_app_configurations(id, &tlvs, &chip))
            .await
        {
            Ok(status) => status,
            Err(_) => UciStatus::Failed,
        };
        if !status.is_ok() {
            self.fail_open(&session, status).await;
            return;
        }
        if let Err(e) = session.wait_for_state(SessionState::Idle, wait).await {
            warn!(%handle, "open config: {e:#}");
            self.fail_open(&session, UciStatus::Failed).await;
            return;
        }

        session.set_operation(OperationType::Idle);
        session.callbacks.on_ranging_opened(handle);
    }

    /// Open failed or timed out: push the device back to DEINIT, drop
    /// the session and report.
    async fn fail_open(&self, session: &Arc<UwbSession>, status: UciStatus) {
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let _ = self
            .exec_native(move || {
                hal.deinit_session(id, &chip)
            })
            .await;
        self.remove_session(session.handle);
        session.callbacks.on_ranging_open_failed(
            session.handle,
            api_reason_from_status(status),
            status,
        );
    }

    async fn handle_start(
        &self,
        handle: SessionHandle,
        params: Option<ProtocolParams>,
    ) {
        let Some(session) = self.session(handle) else {
            return;
        };
        if session.state() != SessionState::Idle {
            session.callbacks.on_ranging_start_failed(
                handle,
                ApiReason::BadParameters,
                UciStatus::Rejected,
            );
            return;
        }
        let wait = self.config.service.start_threshold;

        if let Some(params) = params {
            let hal = self.hal.clone();
            let tlvs = params.to_tlvs();
            let (id, chip) = (session.session_id, session.chip_id.clone());
            let status = match self
                .exec_native(move || hal.set_app_configurations(id, &tlvs, &chip))
                .await
            {
                Ok(status) => status,
                Err(_) => UciStatus::Failed,
            };
            if !status.is_ok() {
                session.callbacks.on_ranging_start_failed(
                    handle,
                    api_reason_from_status(status),
                    status,
                );
                return;
            }
            if let Some(fira) = params.fira() {
                session.set_current_ranging_interval_ms(fira.ranging_duration_ms);
            }
            session.update_params(params);
        }

        session.set_operation(OperationType::StartRanging);
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = match self
            .exec_native(move || hal.start_ranging(id, &chip))
            .await
        {
            Ok(status) => status,
            Err(_) => UciStatus::Failed,
        };
        if !status.is_ok() {
            session.callbacks.on_ranging_start_failed(
                handle,
                api_reason_from_status(status),
                status,
            );
            return;
        }
        match session.wait_for_state(SessionState::Active, wait).await {
            Ok(()) => session.callbacks.on_ranging_started(handle),
            Err(e) => {
                warn!(%handle, "start: {e:#}");
                session.callbacks.on_ranging_start_failed(
                    handle,
                    ApiReason::Unknown,
                    UciStatus::Failed,
                );
            },
        }
        session.set_operation(OperationType::Idle);
    }

    async fn handle_stop(&self, handle: SessionHandle, reason: ApiReason) {
        let Some(session) = self.session(handle) else {
            return;
        };
        match session.state() {
            SessionState::Active => {},
            SessionState::Idle => {
                // Already stopped underneath us; report and move on.
                session.callbacks.on_ranging_stopped(handle, reason);
                return;
            },
            _ => {
                session.callbacks.on_ranging_stop_failed(
                    handle,
                    ApiReason::BadParameters,
                    UciStatus::Rejected,
                );
                return;
            },
        }

        session.set_operation(OperationType::StopRanging);
        let base = self.config.service.stop_threshold;
        // Long beacon periods delay the Idle notification; scale the
        // wait to the ranging interval.
        let wait = base.max(Duration::from_millis(
            2 * session.current_ranging_interval_ms() as u64,
        ));

        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = match self
            .exec_native(move || hal.stop_ranging(id, &chip))
            .await
        {
            Ok(status) => status,
            Err(_) => UciStatus::Failed,
        };
        if !status.is_ok() {
            session.callbacks.on_ranging_stop_failed(
                handle,
                api_reason_from_status(status),
                status,
            );
            session.set_operation(OperationType::Idle);
            return;
        }
        match session.wait_for_state(SessionState::Idle, wait).await {
            Ok(()) => session.callbacks.on_ranging_stopped(handle, reason),
            Err(e) => {
                warn!(%handle, "stop: {e:#}");
                session.callbacks.on_ranging_stop_failed(
                    handle,
                    ApiReason::Unknown,
                    UciStatus::Failed,
                );
            },
        }
        session.set_operation(OperationType::Idle);
    }

    async fn handle_reconfigure(
        &self,
        handle: SessionHandle,
        params: ReconfigureParams,
    ) {
        let Some(session) = self.session(handle) else {
            return;
        };
        if let Err(e) = params.validate() {
            warn!(%handle, "reconfigure rejected: {e:#}");
            session.callbacks.on_ranging_reconfigure_failed(
                handle,
                ApiReason::BadParameters,
                UciStatus::Rejected,
            );
            return;
        }
        session.set_operation(OperationType::Reconfigure);

        let outcome = match params.action {
            Some(action) => self.reconfigure_multicast(&session, action, &params).await,
            None => self.reconfigure_app_config(&session, &params).await,
        };
        session.set_operation(OperationType::Idle);
        match outcome {
            Ok(()) => session.callbacks.on_ranging_reconfigured(handle),
            Err(status) => session.callbacks.on_ranging_reconfigure_failed(
                handle,
                api_reason_from_status(status),
                status,
            ),
        }
    }

    async fn reconfigure_multicast(
        &self,
        session: &Arc<UwbSession>,
        action: crate::uci::params::MulticastAction,
        params: &ReconfigureParams,
    ) -> Result<(), UciStatus> {
        let wait = self.config.service.start_threshold;
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let controlees = params.controlees.clone();
        let status = self
            .exec_native(move || {
                hal.controller_multicast_list_update(id, action, &controlees, &chip)
            })
            .await
            .unwrap_or(UciStatus::Failed);
        if !status.is_ok() {
            return Err(status);
        }

        let ntf = session
            .wait_for_multicast_ntf(wait)
            .await
            .map_err(|_| UciStatus::Failed)?;

        let mut all_ok = true;
        for entry in &ntf.statuses {
            let callbacks = &session.callbacks;
            if entry.status.is_ok() {
                if action.is_add() {
                    session.add_controlee(entry.mac_address);
                    callbacks.on_controlee_added(session.handle, entry.mac_address);
                } else {
                    session.remove_controlee(entry.mac_address);
                    callbacks.on_controlee_removed(session.handle, entry.mac_address);
                }
            } else {
                all_ok = false;
                if action.is_add() {
                    callbacks.on_controlee_add_failed(
                        session.handle,
                        entry.mac_address,
                        entry.status,
                    );
                } else {
                    callbacks.on_controlee_remove_failed(
                        session.handle,
                        entry.mac_address,
                        entry.status,
                    );
                }
            }
        }
        if all_ok { Ok(()) } else { Err(UciStatus::Failed) }
    }

    async fn reconfigure_app_config(
        &self,
        session: &Arc<UwbSession>,
        params: &ReconfigureParams,
    ) -> Result<(), UciStatus> {
        let wait = self.config.service.start_threshold;
        let tlvs = params.to_delta_tlvs();
        if tlvs.is_empty() {
            return Ok(());
        }
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = self
            .exec_native(move || hal.set_app_configurations(id, &tlvs, &chip))
            .await
            .unwrap_or(UciStatus::Failed);
        if !status.is_ok() {
            return Err(status);
        }

        if let (Some(new_cfg), ProtocolParams::Fira(mut fira)) =
            (params.range_data_ntf_config, session.params())
        {
            fira.range_data_ntf_config = new_cfg;
            session.update_params(ProtocolParams::Fira(fira));
        }

        // Refresh the cached ranging interval; the stop timeout scales
        // off it.
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        if let Ok((status, tlvs)) = self
            .exec_native(move || {
                hal.get_app_configurations(id, &[app_config::RANGING_DURATION], &chip)
            })
            .await
            && status.is_ok()
            && let Some(tlv) = tlvs.iter().find(|t| t.tag == app_config::RANGING_DURATION)
            && tlv.value.len() == 4
        {
            let ms = u32::from_be_bytes([
                tlv.value[0],
                tlv.value[1],
                tlv.value[2],
                tlv.value[3],
            ]);
            session.set_current_ranging_interval_ms(ms);
        }
        Ok(())
    }

    async fn handle_deinit(&self, handle: SessionHandle, reason: ApiReason) {
        let Some(session) = self.session(handle) else {
            return;
        };
        session.set_operation(OperationType::DeInit);
        let wait = self.config.service.close_threshold;

        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = self
            .exec_native(move || hal.deinit_session(id, &chip))
            .await
            .unwrap_or(UciStatus::Failed);

        let reason = if status.is_ok() {
            if let Err(e) = session.wait_for_state(SessionState::Deinit, wait).await {
                warn!(%handle, "deinit: {e:#}");
            }
            reason
        } else {
            warn!(%handle, "SESSION_DEINIT failed: {status}");
            ApiReason::Unknown
        };

        self.remove_session(handle);
        session.callbacks.on_ranging_closed(handle, reason);
    }

    async fn handle_send_data(
        &self,
        handle: SessionHandle,
        remote: u64,
        params: SendDataParams,
        data: Bytes,
    ) {
        let Some(session) = self.session(handle) else {
            return;
        };
        if session.state() != SessionState::Active {
            session.callbacks.on_data_send_failed(
                handle,
                remote,
                params,
                UciStatus::Rejected,
            );
            return;
        }
        session.set_operation(OperationType::SendData);
        let seq = session.data_send_seq() as u16;
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let addr = extended_address_bytes(remote);
        let payload = data.clone();
        let status = self
            .exec_native(move || {
                hal.send_data(id, addr, params.dst_endpoint, seq, &payload, &chip)
            })
            .await
            .unwrap_or(UciStatus::Failed);
        session.set_operation(OperationType::Idle);

        if status.is_ok() {
            session.advance_data_send_seq();
            session.callbacks.on_data_sent(handle, remote, params);
        } else {
            session
                .callbacks
                .on_data_send_failed(handle, remote, params, status);
        }
    }

    async fn handle_ranging_rounds_update(
        &self,
        handle: SessionHandle,
        round_indices: Vec<u8>,
    ) {
        let Some(session) = self.session(handle) else {
            return;
        };
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let outcome = self
            .exec_native(move || {
                hal.session_update_dt_tag_ranging_rounds(id, &round_indices, &chip)
            })
            .await;
        match outcome {
            Ok((status, failed)) => {
                if !status.is_ok() {
                    warn!(%handle, "ranging rounds update: {status}");
                }
                session
                    .callbacks
                    .on_ranging_rounds_update_status(handle, failed);
            },
            Err(e) => warn!(%handle, "ranging rounds update failed: {e:#}"),
        }
    }

    async fn handle_query_data_size(&self, handle: SessionHandle) -> Result<u32> {
        let session = self.session(handle).ok_or_else(|| anyhow!("unknown session"))?;
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let (status, size) = self
            .exec_native(move || {
                hal.query_data_size(id, &chip)
            })
            .await?;
        anyhow::ensure!(status.is_ok(), "QUERY_DATA_SIZE failed: {status}");
        Ok(size)
    }

    // ---- notification routing ----

    async fn route_session_status(
        &self,
        session_id: u32,
        prev: SessionState,
        state: SessionState,
        reason: ReasonCode,
    ) {
        let Some(session) = self.session_by_id(session_id) else {
            return;
        };
        match state {
            SessionState::Idle
                if prev == SessionState::Active
                    && reason != ReasonCode::ManagementCommand =>
            {
                // The device stopped ranging on its own.
                info!(session_id, ?reason, "unsolicited ranging stop");
                session
                    .callbacks
                    .on_ranging_stopped(session.handle, api_reason_from_code(reason));
            },
            SessionState::Deinit if session.operation() != OperationType::DeInit => {
                info!(session_id, ?reason, "device-initiated session teardown");
                self.remove_session(session.handle);
                session
                    .callbacks
                    .on_ranging_closed(session.handle, api_reason_from_code(reason));
            },
            _ => {},
        }
    }

    fn handle_range_data(&self, ntf: RangeDataNtf) {
        let Some(session) = self.session_by_id(ntf.session_id) else {
            return;
        };
        session.set_current_ranging_interval_ms(ntf.current_ranging_interval_ms);

        // Error-streak watchdog: an all-error notification arms it, any
        // success cancels it.
        if ntf.is_all_errors() {
            if !session.error_streak_alarm_armed() {
                let event_tx = self.event_tx.clone();
                let handle = session.handle;
                let delay = session.ranging_error_streak_timeout;
                session.arm_error_streak_alarm(tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = event_tx
                        .send(SessionEvent::ErrorStreakFired { handle })
                        .await;
                }));
            }
        } else {
            session.cancel_error_streak_alarm();
        }

        session.callbacks.on_ranging_result(session.handle, &ntf);

        if ntf.measurement_type == RangingMeasurementType::OwrAoa {
            self.process_owr_aoa(&session, &ntf);
        }
    }

    fn process_owr_aoa(&self, session: &Arc<UwbSession>, ntf: &RangeDataNtf) {
        let Some(measurement) = &ntf.owr_aoa_measurement else {
            return;
        };
        if measurement.status != MEASUREMENT_STATUS_OK {
            return;
        }
        let remote = derive_owr_remote_address(measurement, ntf.mac_address_mode);
        session.update_advertiser(remote, measurement.clone());

        let pointed = self
            .pointed_target_override
            .get()
            .and_then(|f| f(measurement))
            .unwrap_or_else(|| {
                is_pointed_target(&self.config.advertise, measurement)
            });
        if !pointed {
            return;
        }

        for info in session.drain_received(remote) {
            session
                .callbacks
                .on_data_received(session.handle, remote, info.payload);
        }
        session.forget_advertiser(remote);
    }

    fn handle_data_received(&self, bytes: Bytes) {
        let packet = match DataRcvPacket::parse(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed data packet: {e:#}");
                return;
            },
        };
        let Some(session) = self.session_by_id(packet.session_id) else {
            warn!(session_id = packet.session_id, "data for unknown session");
            return;
        };
        if packet.status != 0 {
            warn!(
                session_id = packet.session_id,
                status = packet.status,
                "dropping data packet with error status"
            );
            return;
        }
        session.insert_received(ReceivedDataInfo {
            session_id: packet.session_id,
            status: packet.status,
            sequence_num: packet.sequence_num,
            address: packet.address,
            src_endpoint: packet.src_endpoint,
            dst_endpoint: packet.dst_endpoint,
            payload: packet.payload,
        });
    }

    // ---- foreground/background policy ----

    async fn handle_app_importance(&self, uid: i32, foreground: bool) {
        self.foreground_uids.insert(uid, foreground);
        if !self
            .config
            .service
            .supports_range_data_ntf_config
            .as_bool()
        {
            return;
        }
        let handles: Vec<SessionHandle> = self
            .by_uid
            .get(&uid)
            .map(|v| v.clone())
            .unwrap_or_default();
        for handle in handles {
            let Some(session) = self.session(handle) else {
                continue;
            };
            if foreground {
                self.restore_foreground(&session).await;
            } else {
                self.enter_background(&session).await;
            }
        }
    }

    async fn restore_foreground(&self, session: &Arc<UwbSession>) {
        session.set_has_non_privileged_fg_app(true);
        session.cancel_background_alarm();
        if let Some(orig) = session.take_orig_ntf_config() {
            self.apply_ntf_config(session, orig).await;
        }
    }

    async fn enter_background(&self, session: &Arc<UwbSession>) {
        session.set_has_non_privileged_fg_app(false);
        let current = session
            .params()
            .fira()
            .map(|f| f.range_data_ntf_config)
            .unwrap_or(RangeDataNtfConfig::Enable);
        session.save_orig_ntf_config(current);
        self.apply_ntf_config(session, RangeDataNtfConfig::Disable).await;

        let event_tx = self.event_tx.clone();
        let handle = session.handle;
        let delay = self.config.service.background_timeout;
        session.arm_background_alarm(tokio::spawn(async move {
            sleep(delay).await;
            let _ = event_tx
                .send(SessionEvent::BackgroundAlarmFired { handle })
                .await;
        }));
    }

    async fn apply_ntf_config(
        &self,
        session: &Arc<UwbSession>,
        config: RangeDataNtfConfig,
    ) {
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let tlvs = vec![AppConfigTlv::new(
            app_config::RNG_DATA_NTF,
            vec![config.to_raw()],
        )];
        let status = self
            .exec_native(move || {
                hal.set_app_configurations(id, &tlvs, &chip)
            })
            .await
            .unwrap_or(UciStatus::Failed);
        if !status.is_ok() {
            warn!(
                session_id = session.session_id,
                "failed to apply notification policy: {status}"
            );
        }
    }

    // ---- dynamic STS ----

    async fn handle_install_session_data(
        &self,
        handle: SessionHandle,
        secure_session_id: u32,
        data: Option<SessionData>,
    ) {
        let Some(session) = self.session(handle) else {
            warn!(%handle, "session data ready for a dead session");
            return;
        };
        let Some(data) = data else {
            info!(%handle, secure_session_id, "no session data to install");
            return;
        };
        let mut tlvs = Vec::new();
        if let Some(sri) = &data.secure_ranging_info {
            tlvs.push(AppConfigTlv::new(
                app_config::SESSION_KEY,
                sri.session_key.clone(),
            ));
            if let Some(key) = &sri.sub_session_key {
                tlvs.push(AppConfigTlv::new(app_config::SUB_SESSION_KEY, key.clone()));
            }
        }
        if tlvs.is_empty() {
            debug!(%handle, "session data carries no key material");
            return;
        }
        let hal = self.hal.clone();
        let (id, chip) = (session.session_id, session.chip_id.clone());
        let status = self
            .exec_native(move || {
                hal.set_app_configurations(id, &tlvs, &chip)
            })
            .await
            .unwrap_or(UciStatus::Failed);
        if status.is_ok() {
            info!(%handle, secure_session_id, "dynamic STS keys installed");
        } else {
            warn!(%handle, "failed to install STS keys: {status}");
        }
    }

    // ---- teardown ----

    fn remove_session(&self, handle: SessionHandle) {
        let Some((_, session)) = self.sessions.remove(&handle) else {
            return;
        };
        session.cancel_all_alarms();
        session.purge_received();
        session.purge_advertisers();
        self.by_id.remove(&session.session_id);
        for uid in session.non_privileged_uids() {
            if let Some(mut entry) = self.by_uid.get_mut(&uid) {
                entry.retain(|h| *h != handle);
            }
        }
        if let Some((_, secure)) = self.secure_sessions.remove(&handle) {
            secure.abort_hard();
        }

        let mut lru = self
            .recently_closed
            .lock()
            .expect("recently-closed lock poisoned");
        lru.push_back(session.snapshot());
        while lru.len() > self.config.service.recently_closed_capacity {
            lru.pop_front();
        }
    }
}

fn api_reason_from_status(status: UciStatus) -> ApiReason {
    match status {
        UciStatus::Rejected | UciStatus::SessionDuplicate => ApiReason::BadParameters,
        UciStatus::MaxSessionsExceeded => ApiReason::MaxSessionsReached,
        _ => ApiReason::Unknown,
    }
}

fn api_reason_from_code(reason: ReasonCode) -> ApiReason {
    match reason {
        ReasonCode::ManagementCommand => ApiReason::LocalApi,
        ReasonCode::MaxRangingRoundRetryCountReached => ApiReason::MaxRrRetryReached,
        ReasonCode::MaxNumberOfMeasurementsReached => ApiReason::ProtocolSpecific,
        ReasonCode::Other(_) => ApiReason::Unknown,
    }
}
