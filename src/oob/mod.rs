// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio::sync::mpsc;

/// One direction-agnostic endpoint of the out-of-band byte channel
/// (typically BLE in production). Frames are opaque payloads carrying
/// ISO 7816 APDUs; ordering is preserved, content is not interpreted
/// here.
#[derive(Debug)]
pub struct OobLink {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl OobLink {
    pub fn new(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self { tx, rx: Some(rx) }
    }

    /// In-memory link between two endpoints, used by tests and local
    /// loopback provisioning.
    pub fn pair(capacity: usize) -> (OobLink, OobLink) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (OobLink::new(a_tx, b_rx), OobLink::new(b_tx, a_rx))
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(data.into())
            .await
            .map_err(|_| anyhow!("OOB peer closed"))
    }

    /// Hand the inbound half to whoever pumps received frames; callable
    /// once.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.rx.take()
    }

    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }
}
