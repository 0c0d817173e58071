// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::{
    session::uwb_session::SessionHandle,
    uci::{
        hal::UciStatus,
        notification::{MulticastUpdateStatus, RangeDataNtf},
    },
};

/// API-level reason codes reported alongside lifecycle callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiReason {
    Unknown,
    LocalApi,
    RemoteRequest,
    BadParameters,
    MaxSessionsReached,
    SystemPolicy,
    MaxRrRetryReached,
    ProtocolSpecific,
}

/// Opaque per-transfer parameters echoed back on data callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendDataParams {
    pub dst_endpoint: u8,
}

/// Client-facing callback surface. Invoked from the manager event
/// loop; implementations must be non-blocking.
#[allow(unused_variables)]
pub trait RangingCallbacks: Send + Sync + 'static {
    fn on_ranging_opened(&self, handle: SessionHandle);

    fn on_ranging_open_failed(
        &self,
        handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    );

    fn on_ranging_started(&self, handle: SessionHandle);

    fn on_ranging_start_failed(
        &self,
        handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    );

    fn on_ranging_stopped(&self, handle: SessionHandle, reason: ApiReason);

    fn on_ranging_stop_failed(
        &self,
        handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    );

    fn on_ranging_reconfigured(&self, handle: SessionHandle);

    fn on_ranging_reconfigure_failed(
        &self,
        handle: SessionHandle,
        reason: ApiReason,
        status: UciStatus,
    );

    fn on_ranging_closed(&self, handle: SessionHandle, reason: ApiReason);

    fn on_controlee_added(&self, handle: SessionHandle, address: u16);

    fn on_controlee_add_failed(
        &self,
        handle: SessionHandle,
        address: u16,
        status: MulticastUpdateStatus,
    );

    fn on_controlee_removed(&self, handle: SessionHandle, address: u16);

    fn on_controlee_remove_failed(
        &self,
        handle: SessionHandle,
        address: u16,
        status: MulticastUpdateStatus,
    );

    fn on_ranging_result(&self, handle: SessionHandle, data: &RangeDataNtf) {}

    fn on_data_received(&self, handle: SessionHandle, address: u64, payload: Bytes);

    fn on_data_sent(&self, handle: SessionHandle, address: u64, params: SendDataParams);

    fn on_data_send_failed(
        &self,
        handle: SessionHandle,
        address: u64,
        params: SendDataParams,
        status: UciStatus,
    );

    fn on_ranging_rounds_update_status(
        &self,
        handle: SessionHandle,
        failed_indices: Vec<u8>,
    ) {
    }
}
