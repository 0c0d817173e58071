// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::SecureConfig,
    models::{
        apdu::{command::CommandApdu, response::ResponseApdu},
        csml::{
            common::{
                CONTROLEE_INFO_DO, SESSION_DATA_DO, terminate_session_do,
            },
            controlee_info::ControleeInfo,
            dispatch::{DispatchNotification, DispatchResponse, OutboundTarget},
            get_do::GetDoCommand,
            put_do::PutDoCommand,
            session_data::{SecureRangingInfo, SessionData},
        },
        tlv::{Tag, Tlv},
    },
    oob::OobLink,
    secure_channel::fira_channel::{
        ChannelCommand, ChannelEvent, ChannelRole, ChannelStatus, FiRaSecureChannel,
        RunningProfile, SecureChannelHandle,
    },
    secure_element::SeTransport,
    state_machine::sts_initiator::{run_initiator, start_controlee, start_controller},
    utils::generate_unique_session_id,
};

/// Which party of the ranging session this device is provisioning for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionParty {
    Controller,
    Controlee,
}

/// Monotonic ids of the tunneled initiator pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    GetControleeInfo = 0,
    PutControleeInfo = 1,
    GetSessionData = 2,
    PutSessionData = 3,
}

/// Completion surface towards the session manager. Invoked from the
/// secure session work loop; implementations must not block.
pub trait SecureSessionCallback: Send + 'static {
    fn on_session_data_ready(
        &mut self,
        session_id: u32,
        session_data: Option<SessionData>,
        is_terminated: bool,
    );

    fn on_session_aborted(&mut self);

    fn on_session_terminated(&mut self);
}

/// Everything needed to run one dynamic-STS dialog.
#[derive(Debug, Clone)]
pub struct SecureSessionConfig {
    pub role: ChannelRole,
    pub party: SessionParty,
    pub profile: RunningProfile,
    pub local_controlee_info: ControleeInfo,
    /// Controller-side template the generated session data starts from.
    pub session_template: SessionData,
    pub need_secure_ranging_info: bool,
}

#[derive(Debug)]
pub enum SessionCommand {
    Terminate,
}

/// Owner-facing handle; the session itself lives on its work loop.
#[derive(Debug, Clone)]
pub struct SecureSessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    status: watch::Receiver<ChannelStatus>,
}

impl SecureSessionHandle {
    pub async fn terminate(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Terminate).await;
    }

    /// Drop everything without the terminate dialog; used when the
    /// surrounding session dies.
    pub fn abort_hard(&self) {
        self.cancel.cancel();
    }

    pub fn channel_status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdsInfo {
    pub session_id: u32,
    pub arbitrary_data: Option<Vec<u8>>,
}

struct PendingRequest {
    msg_id: MessageId,
    deadline: Instant,
}

/// Either the peer's tunneled reply or an RDS that short-circuits the
/// wait.
pub(crate) enum ReplyOrRds {
    Reply(ResponseApdu),
    Rds(RdsInfo),
}

enum Ingested {
    Nothing,
    HostData(Vec<u8>),
    TunnelFailed,
    Aborted,
    Terminated,
}

/// DO signalling "session data not generated yet, ask again": tag `80`
/// with a single zero byte.
const SESSION_DATA_PENDING_TAG: Tag = Tag::new(0x80);

pub fn session_data_not_available() -> Vec<u8> {
    crate::models::tlv::TlvBuilder::new()
        .put_u8(SESSION_DATA_PENDING_TAG, 0x00)
        .build()
}

fn is_session_data_not_available(data: &[u8]) -> bool {
    matches!(
        Tlv::parse_one(data),
        Ok((tlv, _)) if tlv.tag == SESSION_DATA_PENDING_TAG && tlv.value == [0x00]
    )
}

/// One dynamic-STS provisioning dialog over a FiRa secure channel.
///
/// The four concrete behaviors (role × party) share this context; the
/// initiator pipeline runs through
/// [`crate::state_machine::sts_initiator`], responders react to applet
/// notifications only.
pub struct SecureSession {
    role: ChannelRole,
    party: SessionParty,
    secure_cfg: SecureConfig,
    channel: SecureChannelHandle,
    events: mpsc::Receiver<ChannelEvent>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    callback: Box<dyn SecureSessionCallback>,

    pub(crate) unique_session_id: Option<u32>,
    pub(crate) is_default_unique_session_id: bool,
    pub(crate) session_data: Option<SessionData>,

    session_template: SessionData,
    need_secure_ranging_info: bool,
    local_controlee_info: ControleeInfo,

    pending: VecDeque<PendingRequest>,
    rds_seen: VecDeque<RdsInfo>,
    controlee_info_seen: VecDeque<Vec<u8>>,
}

impl SecureSession {
    /// Bring up the secure channel and run the dialog on a dedicated
    /// work loop. Completion is reported through `callback`.
    pub fn spawn(
        secure_cfg: SecureConfig,
        config: SecureSessionConfig,
        transport: Arc<dyn SeTransport>,
        oob: OobLink,
        callback: Box<dyn SecureSessionCallback>,
    ) -> SecureSessionHandle {
        let cancel = CancellationToken::new();
        let (ev_tx, ev_rx) = mpsc::channel(32);
        let channel = FiRaSecureChannel::spawn(
            config.role,
            config.profile,
            transport,
            oob,
            ev_tx,
            cancel.clone(),
        );
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let session = SecureSession {
            role: config.role,
            party: config.party,
            secure_cfg,
            channel: channel.clone(),
            events: ev_rx,
            cmd_rx,
            callback,
            unique_session_id: None,
            is_default_unique_session_id: false,
            session_data: None,
            session_template: config.session_template,
            need_secure_ranging_info: config.need_secure_ranging_info,
            local_controlee_info: config.local_controlee_info,
            pending: VecDeque::new(),
            rds_seen: VecDeque::new(),
            controlee_info_seen: VecDeque::new(),
        };

        let handle = SecureSessionHandle {
            cmd_tx,
            cancel: cancel.clone(),
            status: channel.status_receiver(),
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = session.run() => {},
            }
        });

        handle
    }

    async fn run(mut self) {
        // Phase 1: secure channel establishment.
        let established = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Terminate) | None => break false,
                },
                event = self.events.recv() => match event {
                    Some(ChannelEvent::Established { default_session_id }) => {
                        if let Some(id) = default_session_id {
                            self.unique_session_id = Some(id);
                            self.is_default_unique_session_id = true;
                        }
                        break true;
                    },
                    Some(ChannelEvent::SetupFailed { error }) => {
                        warn!("secure channel setup failed: {error}");
                        self.callback.on_session_aborted();
                        return;
                    },
                    Some(ChannelEvent::Aborted) => {
                        self.callback.on_session_aborted();
                        return;
                    },
                    Some(ChannelEvent::Terminated) | None => return,
                    Some(_) => {},
                },
            }
        };
        if !established {
            let _ = self.channel.post(ChannelCommand::Terminate).await;
            return;
        }

        // Phase 2: the STS dialog itself.
        let dialog = match (self.role, self.party) {
            (ChannelRole::Initiator, SessionParty::Controller) => {
                run_initiator(start_controller(), &mut self).await
            },
            (ChannelRole::Initiator, SessionParty::Controlee) => {
                run_initiator(start_controlee(), &mut self).await
            },
            (ChannelRole::Responder, _) => self.run_responder().await,
        };

        match dialog {
            Ok(session_id) => {
                info!(session_id, "session data ready");
                let data = self.session_data.clone();
                self.callback.on_session_data_ready(session_id, data, false);
                self.run_monitor().await;
            },
            Err(e) => {
                warn!("dynamic STS dialog failed: {e:#}");
                let _ = self.channel.post(ChannelCommand::Terminate).await;
                self.callback.on_session_aborted();
            },
        }
    }

    /// Phase 3: session data delivered; watch for aborts and serve the
    /// terminate command.
    async fn run_monitor(&mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Terminate) | None => {
                        self.terminate_dialog().await;
                        return;
                    },
                },
                event = self.events.recv() => match event.map(|e| self.ingest(e)) {
                    Some(Ingested::Aborted) => {
                        self.callback.on_session_aborted();
                        return;
                    },
                    Some(Ingested::Terminated) | None => {
                        self.callback.on_session_terminated();
                        return;
                    },
                    Some(_) => {},
                },
            }
        }
    }

    /// Initiators tunnel the terminate DO to the peer first; both sides
    /// then terminate locally through the channel.
    async fn terminate_dialog(&mut self) {
        if self.role == ChannelRole::Initiator {
            let apdu = PutDoCommand::new(terminate_session_do());
            use crate::models::csml::common::FiRaCommand;
            let _ = self
                .channel
                .post(ChannelCommand::TunnelToRemote {
                    payload: apdu.to_apdu().encode(),
                })
                .await;
        }
        let _ = self.channel.post(ChannelCommand::Terminate).await;
        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Terminated) | None => break,
                Some(_) => {},
            }
        }
        self.callback.on_session_terminated();
    }

    // ---- responder dialogs ----

    async fn run_responder(&mut self) -> Result<u32> {
        let mut generated = false;
        loop {
            if self.party == SessionParty::Controlee
                && let Some(rds) = self.take_rds()
            {
                return self.finish_controlee_responder(rds).await;
            }
            if self.party == SessionParty::Controller {
                if !generated && let Some(inline) = self.take_controlee_info() {
                    self.controller_responder_generate(inline).await?;
                    generated = true;
                }
                if generated && let Some(rds) = self.take_rds() {
                    let id = self.resolve_rds_session_id(rds.session_id);
                    return Ok(id);
                }
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Terminate) | None => {
                        bail!("terminated before session data was ready");
                    },
                },
                event = self.events.recv() => match event {
                    Some(event) => match self.ingest(event) {
                        Ingested::Aborted => bail!("secure session aborted by peer"),
                        Ingested::Terminated => bail!("secure channel terminated"),
                        Ingested::TunnelFailed => {
                            // Responders never tunnel; nothing pending.
                        },
                        Ingested::HostData(_) | Ingested::Nothing => {},
                    },
                    None => bail!("secure channel work loop is gone"),
                },
            }
        }
    }

    /// Controlee-responder: session data is whatever the RDS carries,
    /// or fetched from the local applet when it came bare.
    async fn finish_controlee_responder(&mut self, rds: RdsInfo) -> Result<u32> {
        let data = match &rds.arbitrary_data {
            Some(bytes) => SessionData::from_bytes(bytes)
                .context("RDS carried malformed session data")?,
            None => {
                let bytes = self.local_get_do(SESSION_DATA_DO).await?;
                SessionData::from_bytes(&bytes)
                    .context("applet returned malformed session data")?
            },
        };
        let id = self.resolve_rds_session_id(rds.session_id);
        self.session_data = Some(data);
        Ok(id)
    }

    /// Controller-responder: peer's controlee info arrived; generate
    /// session data and hand it to the local applet, then wait for the
    /// RDS confirmation.
    async fn controller_responder_generate(&mut self, inline: Vec<u8>) -> Result<()> {
        let bytes = if inline.is_empty() {
            self.local_get_do(CONTROLEE_INFO_DO).await?
        } else {
            inline
        };
        ControleeInfo::from_bytes(&bytes).context("peer controlee info is invalid")?;

        self.adopt_controller_session_id();
        let data = self.generate_session_data()?;
        self.session_data = Some(data.clone());
        self.local_put_do(data.to_bytes()).await?;
        Ok(())
    }

    // ---- shared helpers (also used by the initiator states) ----

    fn ingest(&mut self, event: ChannelEvent) -> Ingested {
        match event {
            ChannelEvent::TunnelResponseReceived(rsp) => {
                self.collect_notifications(&rsp);
                Ingested::Nothing
            },
            ChannelEvent::DispatchResponseReceived(rsp) => {
                self.collect_notifications(&rsp);
                match rsp.outbound {
                    Some(out) if out.target == OutboundTarget::Host => {
                        Ingested::HostData(out.data)
                    },
                    _ => Ingested::Nothing,
                }
            },
            ChannelEvent::TunnelFailed => Ingested::TunnelFailed,
            ChannelEvent::Aborted | ChannelEvent::SetupFailed { .. } => {
                Ingested::Aborted
            },
            ChannelEvent::Terminated => Ingested::Terminated,
            ChannelEvent::Established { .. } => Ingested::Nothing,
        }
    }

    fn collect_notifications(&mut self, rsp: &DispatchResponse) {
        for n in &rsp.notifications {
            match n {
                DispatchNotification::RdsAvailable {
                    session_id,
                    arbitrary_data,
                } => self.rds_seen.push_back(RdsInfo {
                    session_id: *session_id,
                    arbitrary_data: arbitrary_data.clone(),
                }),
                DispatchNotification::ControleeInfoAvailable { controlee_info } => {
                    self.controlee_info_seen.push_back(controlee_info.clone());
                },
                _ => {},
            }
        }
    }

    pub(crate) fn take_rds(&mut self) -> Option<RdsInfo> {
        self.rds_seen.pop_front()
    }

    fn take_controlee_info(&mut self) -> Option<Vec<u8>> {
        self.controlee_info_seen.pop_front()
    }

    /// Tunnel one pipeline message; the pending entry carries the
    /// per-request deadline the reply wait honours.
    pub(crate) async fn send_tunneled(
        &mut self,
        msg_id: MessageId,
        apdu: CommandApdu,
    ) -> Result<()> {
        debug!(?msg_id, "tunneling request");
        self.channel
            .post(ChannelCommand::TunnelToRemote {
                payload: apdu.encode(),
            })
            .await?;
        self.pending.push_back(PendingRequest {
            msg_id,
            deadline: Instant::now() + self.secure_cfg.tunnel_timeout,
        });
        Ok(())
    }

    /// Consume the peer's reply for the head-of-queue request.
    pub(crate) async fn await_reply(
        &mut self,
        expect: MessageId,
    ) -> Result<ResponseApdu> {
        match self.await_reply_inner(expect, false).await? {
            ReplyOrRds::Reply(rsp) => Ok(rsp),
            ReplyOrRds::Rds(_) => bail!("unexpected RDS short-circuit"),
        }
    }

    /// Like [`SecureSession::await_reply`] but completes early when an
    /// RDS notification shows up, which is how PUT SESSION DATA usually
    /// resolves.
    pub(crate) async fn await_reply_or_rds(
        &mut self,
        expect: MessageId,
    ) -> Result<ReplyOrRds> {
        self.await_reply_inner(expect, true).await
    }

    async fn await_reply_inner(
        &mut self,
        expect: MessageId,
        rds_completes: bool,
    ) -> Result<ReplyOrRds> {
        let head = self
            .pending
            .pop_front()
            .context("no pending tunneled request")?;
        ensure!(
            head.msg_id == expect,
            "pipeline out of order: waiting for {:?}, head is {:?}",
            expect,
            head.msg_id
        );

        loop {
            if rds_completes && let Some(rds) = self.take_rds() {
                return Ok(ReplyOrRds::Rds(rds));
            }
            tokio::select! {
                _ = sleep_until(head.deadline) => {
                    bail!("tunneled {:?} timed out", expect);
                },
                event = self.events.recv() => match event {
                    Some(event) => match self.ingest(event) {
                        Ingested::HostData(data) => {
                            return Ok(ReplyOrRds::Reply(ResponseApdu::from_bytes(&data)?));
                        },
                        Ingested::TunnelFailed => {
                            bail!("tunneling {:?} failed locally", expect);
                        },
                        Ingested::Aborted => bail!("secure session aborted"),
                        Ingested::Terminated => bail!("secure channel terminated"),
                        Ingested::Nothing => {},
                    },
                    None => bail!("secure channel work loop is gone"),
                },
            }
        }
    }

    pub(crate) async fn local_command(
        &mut self,
        apdu: CommandApdu,
    ) -> Result<ResponseApdu> {
        self.channel.send_local_command(apdu).await
    }

    pub(crate) async fn local_get_do(&mut self, tag: Tag) -> Result<Vec<u8>> {
        use crate::models::csml::common::FiRaCommand;
        let rsp = self.local_command(GetDoCommand::whole(tag).to_apdu()).await?;
        rsp.into_data()
    }

    pub(crate) async fn local_put_do(&mut self, data_object: Vec<u8>) -> Result<()> {
        use crate::models::csml::common::FiRaCommand;
        let rsp = self
            .local_command(PutDoCommand::new(data_object).to_apdu())
            .await?;
        ensure!(rsp.is_success(), "local PUT DO failed: {}", rsp.sw());
        Ok(())
    }

    /// Controllers without an applet-provided default id mint a random
    /// positive 31-bit one.
    pub(crate) fn adopt_controller_session_id(&mut self) {
        if self.unique_session_id.is_none() {
            self.unique_session_id = Some(generate_unique_session_id());
            self.is_default_unique_session_id = false;
        }
    }

    /// Adopt the id carried by an RDS notification. Mismatches against
    /// an already-adopted id are logged; unless the adopted id was the
    /// applet's default, the RDS id wins.
    pub(crate) fn resolve_rds_session_id(&mut self, rds_id: u32) -> u32 {
        match self.unique_session_id {
            Some(id) if id == rds_id => id,
            Some(id) => {
                warn!(
                    adopted = id,
                    rds = rds_id,
                    "RDS session id does not match the adopted one"
                );
                if self.is_default_unique_session_id {
                    id
                } else {
                    self.unique_session_id = Some(rds_id);
                    rds_id
                }
            },
            None => {
                self.unique_session_id = Some(rds_id);
                rds_id
            },
        }
    }

    pub(crate) fn generate_session_data(&mut self) -> Result<SessionData> {
        let mut data = self.session_template.clone();
        data.session_id = Some(
            self.unique_session_id
                .context("session id must be adopted before generating data")?,
        );
        if self.need_secure_ranging_info && data.secure_ranging_info.is_none() {
            let multicast = data.sub_session_id.is_some();
            data.secure_ranging_info = Some(SecureRangingInfo::random(multicast));
        }
        Ok(data)
    }

    pub(crate) async fn push_session_data_locally(&mut self) -> Result<()> {
        let bytes = self
            .session_data
            .as_ref()
            .context("no session data to push")?
            .to_bytes();
        self.local_put_do(bytes).await
    }

    pub(crate) fn controlee_info_bytes(&self) -> Vec<u8> {
        self.local_controlee_info.to_bytes()
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        self.secure_cfg.session_data_retry_delay
    }

    pub(crate) fn is_reply_session_data_pending(data: &[u8]) -> bool {
        is_session_data_not_available(data)
    }
}
