// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, pin::Pin};

use anyhow::{Context, Result, anyhow};
use tokio::time::sleep;
use tracing::debug;

use crate::{
    models::csml::{
        common::{CONTROLEE_INFO_DO, FiRaCommand, SESSION_DATA_DO},
        controlee_info::ControleeInfo,
        get_do::GetDoCommand,
        put_do::PutDoCommand,
        session_data::SessionData,
    },
    secure_session::{MessageId, ReplyOrRds, SecureSession},
    state_machine::common::{StateMachine, Transition},
};

type StsStepOut = Transition<InitiatorStates, Result<Option<u32>>>;

/// Tunneled pipeline of the initiator-side dynamic-STS dialog. The
/// controller path asks for the peer's capabilities and pushes session
/// data; the controlee path publishes its capabilities and polls for
/// session data.
pub enum InitiatorStates {
    ControllerGetControleeInfo(ControllerGetControleeInfo),
    ControllerPutSessionData(ControllerPutSessionData),
    ControleePutControleeInfo(ControleePutControleeInfo),
    ControleeGetSessionData(ControleeGetSessionData),
}

/* -------------------- Controller -------------------- */

pub struct ControllerGetControleeInfo;

impl StateMachine<SecureSession, StsStepOut> for ControllerGetControleeInfo {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StsStepOut> + Send + 'a>>
    where
        Self: 'a,
        SecureSession: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SecureSession) -> Self::StepResult<'a> {
        Box::pin(async move {
            let apdu = GetDoCommand::whole(CONTROLEE_INFO_DO).to_apdu();
            if let Err(e) = ctx.send_tunneled(MessageId::GetControleeInfo, apdu).await {
                return Transition::Done(Err(e));
            }
            let reply = match ctx.await_reply(MessageId::GetControleeInfo).await {
                Ok(r) => r,
                Err(e) => return Transition::Done(Err(e)),
            };
            let bytes = match reply.into_data() {
                Ok(b) => b,
                Err(e) => return Transition::Done(Err(e)),
            };
            if let Err(e) = ControleeInfo::from_bytes(&bytes)
                .context("peer controlee info is invalid")
            {
                return Transition::Done(Err(e));
            }

            ctx.adopt_controller_session_id();
            match ctx.generate_session_data() {
                Ok(data) => {
                    ctx.session_data = Some(data);
                    Transition::Next(
                        InitiatorStates::ControllerPutSessionData(
                            ControllerPutSessionData,
                        ),
                        Ok(None),
                    )
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

pub struct ControllerPutSessionData;

impl StateMachine<SecureSession, StsStepOut> for ControllerPutSessionData {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StsStepOut> + Send + 'a>>
    where
        Self: 'a,
        SecureSession: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SecureSession) -> Self::StepResult<'a> {
        Box::pin(async move {
            let bytes = match ctx
                .session_data
                .as_ref()
                .context("controller lost its generated session data")
            {
                Ok(data) => data.to_bytes(),
                Err(e) => return Transition::Done(Err(e)),
            };
            let apdu = PutDoCommand::new(bytes).to_apdu();
            if let Err(e) = ctx.send_tunneled(MessageId::PutSessionData, apdu).await {
                return Transition::Done(Err(e));
            }

            match ctx.await_reply_or_rds(MessageId::PutSessionData).await {
                // The applet pushed the RDS to SUS on its own; no local
                // PUT DO needed.
                Ok(ReplyOrRds::Rds(rds)) => {
                    let id = ctx.resolve_rds_session_id(rds.session_id);
                    Transition::Done(Ok(Some(id)))
                },
                Ok(ReplyOrRds::Reply(rsp)) => {
                    if let Err(e) = rsp.into_data() {
                        return Transition::Done(Err(e));
                    }
                    if let Some(rds) = ctx.take_rds() {
                        let id = ctx.resolve_rds_session_id(rds.session_id);
                        return Transition::Done(Ok(Some(id)));
                    }
                    debug!("no RDS from applet; pushing session data locally");
                    if let Err(e) = ctx.push_session_data_locally().await {
                        return Transition::Done(Err(e));
                    }
                    Transition::Done(Ok(ctx.unique_session_id))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

/* -------------------- Controlee -------------------- */

pub struct ControleePutControleeInfo;

impl StateMachine<SecureSession, StsStepOut> for ControleePutControleeInfo {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StsStepOut> + Send + 'a>>
    where
        Self: 'a,
        SecureSession: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SecureSession) -> Self::StepResult<'a> {
        Box::pin(async move {
            let apdu = PutDoCommand::new(ctx.controlee_info_bytes()).to_apdu();
            if let Err(e) = ctx.send_tunneled(MessageId::PutControleeInfo, apdu).await {
                return Transition::Done(Err(e));
            }
            match ctx
                .await_reply(MessageId::PutControleeInfo)
                .await
                .and_then(|rsp| rsp.into_data())
            {
                Ok(_) => Transition::Next(
                    InitiatorStates::ControleeGetSessionData(ControleeGetSessionData),
                    Ok(None),
                ),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

pub struct ControleeGetSessionData;

impl StateMachine<SecureSession, StsStepOut> for ControleeGetSessionData {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = StsStepOut> + Send + 'a>>
    where
        Self: 'a,
        SecureSession: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SecureSession) -> Self::StepResult<'a> {
        Box::pin(async move {
            let apdu = GetDoCommand::whole(SESSION_DATA_DO).to_apdu();
            if let Err(e) = ctx.send_tunneled(MessageId::GetSessionData, apdu).await {
                return Transition::Done(Err(e));
            }
            let bytes = match ctx
                .await_reply(MessageId::GetSessionData)
                .await
                .and_then(|rsp| rsp.into_data())
            {
                Ok(b) => b,
                Err(e) => return Transition::Done(Err(e)),
            };

            // The controller may not have generated session data yet.
            if SecureSession::is_reply_session_data_pending(&bytes) {
                sleep(ctx.retry_delay()).await;
                return Transition::Stay(Ok(None));
            }

            let data = match SessionData::from_bytes(&bytes) {
                Ok(d) => d,
                Err(e) => return Transition::Done(Err(e)),
            };

            let id = if ctx.is_default_unique_session_id {
                match ctx.unique_session_id {
                    Some(id) => id,
                    None => {
                        return Transition::Done(Err(anyhow!(
                            "default session id flag set without an id"
                        )));
                    },
                }
            } else {
                match data.session_id() {
                    Some(id) => {
                        ctx.unique_session_id = Some(id);
                        id
                    },
                    None => {
                        return Transition::Done(Err(anyhow!(
                            "session data carries no session id"
                        )));
                    },
                }
            };
            ctx.session_data = Some(data);

            // Without an accompanying RDS the applet has not seen the
            // keys yet; hand them over before reporting success.
            if ctx.take_rds().is_none()
                && let Err(e) = ctx.push_session_data_locally().await
            {
                return Transition::Done(Err(e));
            }
            Transition::Done(Ok(Some(id)))
        })
    }
}

pub async fn run_initiator(
    mut state: InitiatorStates,
    ctx: &mut SecureSession,
) -> Result<u32> {
    debug!("running initiator STS dialog");
    loop {
        let tr = match &mut state {
            InitiatorStates::ControllerGetControleeInfo(s) => s.step(ctx).await,
            InitiatorStates::ControllerPutSessionData(s) => s.step(ctx).await,
            InitiatorStates::ControleePutControleeInfo(s) => s.step(ctx).await,
            InitiatorStates::ControleeGetSessionData(s) => s.step(ctx).await,
        };

        match tr {
            Transition::Next(next_state, Ok(_)) => {
                state = next_state;
            },
            Transition::Next(_, Err(e)) | Transition::Stay(Err(e)) => return Err(e),
            Transition::Stay(Ok(_)) => {},
            Transition::Done(Ok(Some(id))) => return Ok(id),
            Transition::Done(Ok(None)) => {
                return Err(anyhow!("dialog finished without a session id"));
            },
            Transition::Done(Err(e)) => return Err(e),
        }
    }
}

pub fn start_controller() -> InitiatorStates {
    InitiatorStates::ControllerGetControleeInfo(ControllerGetControleeInfo)
}

pub fn start_controlee() -> InitiatorStates {
    InitiatorStates::ControleePutControleeInfo(ControleePutControleeInfo)
}
