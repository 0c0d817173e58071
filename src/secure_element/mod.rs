// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use tracing::{debug, warn};

use crate::models::apdu::{command::CommandApdu, response::ResponseApdu};

/// Raw OMAPI-style access to the secure element: open/close logical
/// channels and move APDU bytes. Synchronous, like the platform
/// surface it stands for.
pub trait SeTransport: Send + Sync {
    /// Open a logical channel and SELECT the applet with `aid` on it.
    /// Returns the channel number and the applet's SELECT response.
    fn open_logical_channel(&self, aid: &[u8]) -> Result<(u8, Vec<u8>)>;

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>>;

    fn close_logical_channel(&self, channel: u8) -> Result<()>;

    /// False once the SE service is gone; a channel on a dead transport
    /// is unusable and the surrounding session must be discarded.
    fn is_available(&self) -> bool;
}

/// A scoped logical channel to the FiRa applet. Owned by exactly one
/// secure channel; closing is idempotent and performed on every
/// termination path.
pub struct SecureElementChannel {
    transport: Arc<dyn SeTransport>,
    aid: Vec<u8>,
    channel: Mutex<Option<u8>>,
}

impl std::fmt::Debug for SecureElementChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureElementChannel")
            .field("aid", &hex::encode(&self.aid))
            .field("channel", &self.channel.lock().ok().map(|g| *g))
            .finish()
    }
}

impl SecureElementChannel {
    pub fn new(transport: Arc<dyn SeTransport>, aid: Vec<u8>) -> Self {
        Self {
            transport,
            aid,
            channel: Mutex::new(None),
        }
    }

    pub fn open(&self) -> Result<ResponseApdu> {
        ensure!(self.transport.is_available(), "secure element unavailable");
        let mut guard = self.channel.lock().expect("SE channel lock poisoned");
        ensure!(guard.is_none(), "SE channel already opened");
        let (channel, select_rsp) = self
            .transport
            .open_logical_channel(&self.aid)
            .context("openLogicalChannel failed")?;
        let rsp = ResponseApdu::from_bytes(&select_rsp)?;
        if !rsp.is_success() {
            let _ = self.transport.close_logical_channel(channel);
            anyhow::bail!("applet SELECT failed: {}", rsp.sw());
        }
        debug!(channel, "SE logical channel opened");
        *guard = Some(channel);
        Ok(rsp)
    }

    pub fn is_opened(&self) -> bool {
        self.channel.lock().expect("SE channel lock poisoned").is_some()
    }

    /// Transmit a command on the opened channel; the channel number is
    /// stamped into CLA here so callers build channel-agnostic APDUs.
    pub fn transmit(&self, apdu: CommandApdu) -> Result<ResponseApdu> {
        let channel = {
            let guard = self.channel.lock().expect("SE channel lock poisoned");
            (*guard).context("SE channel not opened")?
        };
        let bytes = apdu.on_channel(channel)?.encode();
        let rsp = self.transport.transmit(&bytes).context("SE transmit failed")?;
        ResponseApdu::from_bytes(&rsp)
    }

    pub fn close(&self) {
        let mut guard = self.channel.lock().expect("SE channel lock poisoned");
        if let Some(channel) = guard.take()
            && let Err(e) = self.transport.close_logical_channel(channel)
        {
            warn!(channel, "failed to close SE logical channel: {e}");
        }
    }
}

impl Drop for SecureElementChannel {
    fn drop(&mut self) {
        self.close();
    }
}
