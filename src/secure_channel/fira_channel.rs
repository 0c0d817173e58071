// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    models::{
        apdu::{
            command::CommandApdu,
            response::{ResponseApdu, StatusWord},
        },
        csml::{
            common::{CsmlCommand, FiRaCommand, Oid, is_applet_select},
            dispatch::{
                DispatchCommand, DispatchNotification, DispatchResponse,
                OutboundTarget,
            },
            initiate_transaction::{
                InitiateTransactionCommand, InitiateTransactionResponse,
            },
            select_adf::{SelectAdfCommand, SelectAdfResponse},
            swap_in_adf::{SwapInAdfCommand, SwapInAdfResponse},
            tunnel::TunnelCommand,
        },
    },
    oob::OobLink,
    secure_element::{SeTransport, SecureElementChannel},
};

/// Which end of the OOB link this channel plays during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Responder,
}

/// Externally observable progress of the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialized,
    Initialized,
    ChannelOpened,
    AdfSelected,
    Established,
    Terminated,
    Abnormal,
}

/// Which setup step went wrong; pushed to the upper layer so the
/// session can unwind with a typed reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("secure element init failed")]
    Init,
    #[error("SELECT ADF failed")]
    SelectAdf,
    #[error("SWAP IN ADF failed")]
    SwapInAdf,
    #[error("INITIATE TRANSACTION failed")]
    InitiateTransaction,
    #[error("failed to open SE logical channel")]
    OpenSeChannel,
    #[error("DISPATCH failed")]
    Dispatch,
}

/// What to provision: applet, ADF OIDs on both ends, the optional
/// dynamic-slot BLOB and the multicast primary session id.
#[derive(Debug, Clone)]
pub struct RunningProfile {
    pub applet_aid: Vec<u8>,
    pub local_oids: Vec<Oid>,
    pub peer_oids: Vec<Oid>,
    /// Secure BLOB for a dynamic ADF slot; static-slot profiles leave
    /// this empty.
    pub secure_blob: Option<Vec<u8>>,
    /// `BF70` bytes accompanying a swap-in.
    pub controlee_info: Vec<u8>,
    /// Shared primary session id for multicast provisioning.
    pub shared_primary_session_id: Option<u32>,
}

/// Work-loop inputs. The channel consumes them strictly in order.
#[derive(Debug)]
pub enum ChannelCommand {
    Init,
    OpenChannel,
    SelectAdf,
    InitiateTransaction,
    SendOobData(Bytes),
    ProcessReceivedOobData(Bytes),
    TunnelToRemote {
        payload: Vec<u8>,
    },
    SendLocalCommand {
        apdu: CommandApdu,
        reply: oneshot::Sender<Result<ResponseApdu>>,
    },
    Terminate,
}

/// Events surfaced to the owning secure session.
#[derive(Debug)]
pub enum ChannelEvent {
    Established {
        default_session_id: Option<u32>,
    },
    SetupFailed {
        error: SetupError,
    },
    /// Post-establishment dispatch result, notifications included.
    DispatchResponseReceived(DispatchResponse),
    /// Local applet's answer to a TUNNEL, notifications included.
    TunnelResponseReceived(DispatchResponse),
    TunnelFailed,
    Aborted,
    Terminated,
}

/// Entry points handed to the owning session; the channel itself lives
/// on its work loop until terminated or cancelled.
#[derive(Debug, Clone)]
pub struct SecureChannelHandle {
    tx: mpsc::Sender<ChannelCommand>,
    status: watch::Receiver<ChannelStatus>,
}

impl SecureChannelHandle {
    pub async fn post(&self, cmd: ChannelCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("secure channel work loop is gone"))
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub async fn send_local_command(&self, apdu: CommandApdu) -> Result<ResponseApdu> {
        let (reply, rx) = oneshot::channel();
        self.post(ChannelCommand::SendLocalCommand { apdu, reply }).await?;
        rx.await.context("secure channel dropped local command")?
    }

    /// Issue a proprietary FiRa command on the local SE and report
    /// plain success/failure.
    pub async fn send_local_fira_command(&self, cmd: CsmlCommand) -> Result<ResponseApdu> {
        let rsp = self.send_local_command(cmd.to_apdu()).await?;
        if !rsp.is_success() {
            bail!("local FiRa command failed: {}", rsp.sw());
        }
        Ok(rsp)
    }
}

pub struct FiRaSecureChannel {
    role: ChannelRole,
    profile: RunningProfile,
    se_channel: SecureElementChannel,
    transport_available: bool,
    oob_tx: mpsc::Sender<Bytes>,
    events: mpsc::Sender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
    self_tx: mpsc::Sender<ChannelCommand>,
    adf_slot: Option<Vec<u8>>,
}

impl FiRaSecureChannel {
    /// Spawn the work loop and its OOB pump; `Init` is posted before
    /// returning so callers only have to watch status/events.
    pub fn spawn(
        role: ChannelRole,
        profile: RunningProfile,
        transport: Arc<dyn SeTransport>,
        mut oob: OobLink,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    ) -> SecureChannelHandle {
        let (tx, rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Uninitialized);

        if let Some(mut oob_rx) = oob.take_receiver() {
            let pump_tx = tx.clone();
            let pump_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = pump_cancel.cancelled() => break,
                        data = oob_rx.recv() => match data {
                            Some(bytes) => {
                                if pump_tx
                                    .send(ChannelCommand::ProcessReceivedOobData(bytes))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            },
                            None => break,
                        },
                    }
                }
            });
        }

        let transport_available = transport.is_available();
        let channel = FiRaSecureChannel {
            role,
            se_channel: SecureElementChannel::new(
                transport,
                profile.applet_aid.clone(),
            ),
            profile,
            transport_available,
            oob_tx: oob.sender(),
            events,
            status: status_tx,
            self_tx: tx.clone(),
            adf_slot: None,
        };

        let _ = tx.try_send(ChannelCommand::Init);
        tokio::spawn(channel.run(rx, cancel));

        SecureChannelHandle {
            tx,
            status: status_rx,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ChannelCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let done = self.handle(cmd).await;
            if done {
                break;
            }
        }
        self.cleanup();
    }

    /// Returns true once the channel reached a terminal state and the
    /// loop should exit.
    async fn handle(&mut self, cmd: ChannelCommand) -> bool {
        match cmd {
            ChannelCommand::Init => self.handle_init().await,
            ChannelCommand::OpenChannel => self.handle_open_channel().await,
            ChannelCommand::SelectAdf => self.handle_select_adf().await,
            ChannelCommand::InitiateTransaction => {
                self.handle_initiate_transaction().await
            },
            ChannelCommand::SendOobData(bytes) => {
                if let Err(e) = self.oob_tx.send(bytes).await {
                    warn!("OOB send failed: {e}");
                }
                false
            },
            ChannelCommand::ProcessReceivedOobData(bytes) => {
                self.handle_received_oob(bytes).await
            },
            ChannelCommand::TunnelToRemote { payload } => {
                self.handle_tunnel(payload).await
            },
            ChannelCommand::SendLocalCommand { apdu, reply } => {
                let _ = reply.send(self.se_channel.transmit(apdu));
                false
            },
            ChannelCommand::Terminate => self.handle_terminate().await,
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        let _ = self.status.send(status);
    }

    fn status_now(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            debug!("secure session stopped listening to channel events");
        }
    }

    async fn handle_init(&mut self) -> bool {
        if !self.transport_available {
            return self.setup_failed(SetupError::Init).await;
        }
        self.set_status(ChannelStatus::Initialized);
        if self.role == ChannelRole::Initiator {
            let _ = self.self_tx.try_send(ChannelCommand::OpenChannel);
        }
        // Responders stay put until the peer's applet SELECT arrives
        // over OOB.
        false
    }

    fn open_channel_inner(&mut self) -> Result<(), SetupError> {
        self.se_channel.open().map_err(|e| {
            warn!("SE channel open failed: {e:#}");
            SetupError::OpenSeChannel
        })?;
        self.set_status(ChannelStatus::ChannelOpened);

        if let Some(blob) = self.profile.secure_blob.clone() {
            let cmd = SwapInAdfCommand::swap_in(
                blob,
                self.profile
                    .local_oids
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Oid::new(Vec::new())),
                self.profile.controlee_info.clone(),
            );
            let rsp = self.se_channel.transmit(cmd.to_apdu()).map_err(|e| {
                warn!("SWAP IN ADF transmit failed: {e:#}");
                SetupError::SwapInAdf
            })?;
            let parsed = SwapInAdfResponse::parse(&rsp).map_err(|e| {
                warn!("SWAP IN ADF rejected: {e:#}");
                SetupError::SwapInAdf
            })?;
            debug!(slot = %hex::encode(&parsed.slot_id), "dynamic ADF slot acquired");
            self.adf_slot = Some(parsed.slot_id);
        }
        Ok(())
    }

    async fn handle_open_channel(&mut self) -> bool {
        match self.open_channel_inner() {
            Ok(()) => {
                if self.role == ChannelRole::Initiator {
                    let _ = self.self_tx.try_send(ChannelCommand::SelectAdf);
                }
                false
            },
            Err(e) => self.setup_failed(e).await,
        }
    }

    async fn handle_select_adf(&mut self) -> bool {
        let cmd = SelectAdfCommand::new(self.profile.local_oids.clone());
        let outcome = self
            .se_channel
            .transmit(cmd.to_apdu())
            .and_then(|rsp| SelectAdfResponse::parse(&rsp));
        match outcome {
            Ok(rsp) => {
                debug!(oid = ?rsp.selected_oid, "ADF selected");
                self.set_status(ChannelStatus::AdfSelected);
                if self.role == ChannelRole::Initiator {
                    let _ = self.self_tx.try_send(ChannelCommand::InitiateTransaction);
                }
                false
            },
            Err(e) => {
                warn!("SELECT ADF failed: {e:#}");
                self.setup_failed(SetupError::SelectAdf).await
            },
        }
    }

    async fn handle_initiate_transaction(&mut self) -> bool {
        let cmd = match self.profile.shared_primary_session_id {
            Some(id) => {
                InitiateTransactionCommand::multicast(self.profile.peer_oids.clone(), id)
            },
            None => InitiateTransactionCommand::unicast(self.profile.peer_oids.clone()),
        };
        let outcome = self
            .se_channel
            .transmit(cmd.to_apdu())
            .and_then(|rsp| InitiateTransactionResponse::parse(&rsp));
        match outcome {
            Ok(rsp) => {
                if let Some(data) = rsp.outbound_data
                    && let Err(e) = self.oob_tx.send(Bytes::from(data)).await
                {
                    warn!("failed to push INITIATE TRANSACTION payload: {e}");
                }
                false
            },
            Err(e) => {
                warn!("INITIATE TRANSACTION failed: {e:#}");
                self.setup_failed(SetupError::InitiateTransaction).await
            },
        }
    }

    async fn handle_received_oob(&mut self, bytes: Bytes) -> bool {
        if self.role == ChannelRole::Responder
            && self.status_now() == ChannelStatus::Initialized
        {
            // The first inbound frame must be the peer's applet SELECT;
            // it both wakes us up and gets dispatched into the applet.
            match CommandApdu::parse(&bytes) {
                Ok(apdu) if is_applet_select(&apdu) => {
                    if let Err(e) = self.open_channel_inner() {
                        return self.setup_failed(e).await;
                    }
                },
                Ok(_) | Err(_) => {
                    warn!("responder got OOB data before applet SELECT");
                    return self.setup_failed(SetupError::Dispatch).await;
                },
            }
        }

        let cmd = DispatchCommand::new(bytes.to_vec());
        let outcome = self
            .se_channel
            .transmit(cmd.to_apdu())
            .and_then(|rsp| DispatchResponse::parse(&rsp));
        match outcome {
            Ok(rsp) => self.handle_dispatch_response(rsp).await,
            Err(e) => {
                warn!("DISPATCH failed: {e:#}");
                if self.status_now() == ChannelStatus::Established {
                    self.emit(ChannelEvent::Aborted).await;
                    self.abnormal_teardown();
                    true
                } else {
                    self.setup_failed(SetupError::Dispatch).await
                }
            },
        }
    }

    async fn handle_dispatch_response(&mut self, rsp: DispatchResponse) -> bool {
        let established_before = self.status_now() == ChannelStatus::Established;

        if let Some(outbound) = &rsp.outbound {
            match outbound.target {
                OutboundTarget::Remote => {
                    if let Err(e) =
                        self.oob_tx.send(Bytes::from(outbound.data.clone())).await
                    {
                        warn!("failed to forward dispatch payload over OOB: {e}");
                    }
                },
                OutboundTarget::Host if !established_before => {
                    // Host-bound data before establishment carries no
                    // meaning for us; the applet dialog continues.
                    debug!("ignoring host data during secure channel setup");
                },
                OutboundTarget::Host => {},
            }
        }

        let mut aborted = false;
        for notification in &rsp.notifications {
            match notification {
                DispatchNotification::AdfSelected { oid } => {
                    debug!(%oid, "peer-driven ADF selection");
                    self.set_status(ChannelStatus::AdfSelected);
                },
                DispatchNotification::SecureChannelEstablished {
                    default_session_id,
                } => {
                    self.set_status(ChannelStatus::Established);
                    self.emit(ChannelEvent::Established {
                        default_session_id: *default_session_id,
                    })
                    .await;
                },
                DispatchNotification::SecureSessionAborted => aborted = true,
                // Session-level notifications ride up with the full
                // response below once the channel is established.
                DispatchNotification::ControleeInfoAvailable { .. }
                | DispatchNotification::RdsAvailable { .. } => {},
            }
        }

        if aborted {
            self.emit(ChannelEvent::Aborted).await;
            self.abnormal_teardown();
            return true;
        }

        if established_before {
            self.emit(ChannelEvent::DispatchResponseReceived(rsp)).await;
        }
        false
    }

    async fn handle_tunnel(&mut self, payload: Vec<u8>) -> bool {
        if self.role == ChannelRole::Responder {
            warn!("tunneling rejected: responder secure channel");
            self.emit(ChannelEvent::TunnelFailed).await;
            return false;
        }
        let cmd = TunnelCommand::new(payload);
        let outcome = self
            .se_channel
            .transmit(cmd.to_apdu())
            .and_then(|rsp| DispatchResponse::parse(&rsp));
        match outcome {
            Ok(rsp) => {
                if let Some(outbound) = &rsp.outbound
                    && outbound.target == OutboundTarget::Remote
                    && let Err(e) =
                        self.oob_tx.send(Bytes::from(outbound.data.clone())).await
                {
                    warn!("failed to forward tunneled payload over OOB: {e}");
                }
                self.emit(ChannelEvent::TunnelResponseReceived(rsp)).await;
                false
            },
            Err(e) => {
                warn!("TUNNEL failed: {e:#}");
                self.emit(ChannelEvent::TunnelFailed).await;
                false
            },
        }
    }

    async fn handle_terminate(&mut self) -> bool {
        if self.status_now() == ChannelStatus::Established {
            use crate::models::{
                csml::{common, get_do::GetDoCommand},
                tlv::ExtendedHeader,
            };
            let get_terminate = GetDoCommand::new(vec![ExtendedHeader::whole(
                common::TERMINATE_SESSION_DO,
            )]);
            match self.se_channel.transmit(get_terminate.to_apdu()) {
                Ok(rsp) if rsp.is_success() => {},
                Ok(rsp) => {
                    warn!("terminate DO rejected: {}", rsp.sw());
                    self.emit(ChannelEvent::Terminated).await;
                    self.abnormal_teardown();
                    return true;
                },
                Err(e) => {
                    warn!("terminate DO failed: {e:#}");
                    self.emit(ChannelEvent::Terminated).await;
                    self.abnormal_teardown();
                    return true;
                },
            }
        }
        self.cleanup();
        self.set_status(ChannelStatus::Terminated);
        self.emit(ChannelEvent::Terminated).await;
        true
    }

    async fn setup_failed(&mut self, error: SetupError) -> bool {
        // Let the peer unwind its own half of the dialog.
        let unwind = ResponseApdu::status_only(StatusWord::APPLET_SELECT_FAILED);
        if let Err(e) = self.oob_tx.send(Bytes::from(unwind.to_bytes())).await {
            debug!("peer unreachable during setup failure: {e}");
        }
        self.emit(ChannelEvent::SetupFailed { error }).await;
        self.abnormal_teardown();
        true
    }

    fn abnormal_teardown(&mut self) {
        self.cleanup();
        self.set_status(ChannelStatus::Abnormal);
    }

    /// Release SE resources on every exit path: swap the dynamic ADF
    /// slot back out, then close the logical channel.
    fn cleanup(&mut self) {
        if let Some(slot) = self.adf_slot.take() {
            if self.se_channel.is_opened() {
                let cmd = SwapInAdfCommand::swap_out(slot);
                match self.se_channel.transmit(cmd.to_apdu()) {
                    Ok(rsp) if rsp.is_success() => {},
                    Ok(rsp) => warn!("SWAP OUT ADF rejected: {}", rsp.sw()),
                    Err(e) => warn!("SWAP OUT ADF failed: {e:#}"),
                }
            } else {
                warn!("ADF slot leaked: SE channel already closed");
            }
        }
        self.se_channel.close();
    }
}
