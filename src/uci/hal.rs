// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use crate::uci::params::{AppConfigTlv, Controlee, MulticastAction, SessionType};

/// Status byte returned by every UCI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UciStatus {
    Ok,
    Rejected,
    Failed,
    SessionNotExist,
    SessionDuplicate,
    SessionActive,
    MaxSessionsExceeded,
    Other(u8),
}

impl UciStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, UciStatus::Ok)
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Ok,
            0x01 => Self::Rejected,
            0x02 => Self::Failed,
            0x11 => Self::SessionNotExist,
            0x12 => Self::SessionDuplicate,
            0x13 => Self::SessionActive,
            0x14 => Self::MaxSessionsExceeded,
            other => Self::Other(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Rejected => 0x01,
            Self::Failed => 0x02,
            Self::SessionNotExist => 0x11,
            Self::SessionDuplicate => 0x12,
            Self::SessionActive => 0x13,
            Self::MaxSessionsExceeded => 0x14,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for UciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "UCI_STATUS(0x{raw:02X})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// The native UCI transport binding. Commands are synchronous and
/// answer with a status; everything asynchronous (state changes, range
/// data, received data, multicast results) flows back through the
/// notification channel the service owns.
///
/// Implementations must be cheap to call from the event loop; the
/// service wraps each call in its own timeout and never issues two
/// commands for one session concurrently.
pub trait UciHal: Send + Sync {
    fn init_session(
        &self,
        session_id: u32,
        session_type: SessionType,
        chip_id: &str,
    ) -> UciStatus;

    fn deinit_session(&self, session_id: u32, chip_id: &str) -> UciStatus;

    fn start_ranging(&self, session_id: u32, chip_id: &str) -> UciStatus;

    fn stop_ranging(&self, session_id: u32, chip_id: &str) -> UciStatus;

    fn set_app_configurations(
        &self,
        session_id: u32,
        configs: &[AppConfigTlv],
        chip_id: &str,
    ) -> UciStatus;

    fn get_app_configurations(
        &self,
        session_id: u32,
        tags: &[u8],
        chip_id: &str,
    ) -> (UciStatus, Vec<AppConfigTlv>);

    /// `remote_addr` is always the 8-byte extended form; short
    /// addresses are left-padded by the caller.
    fn send_data(
        &self,
        session_id: u32,
        remote_addr: [u8; 8],
        dst_endpoint: u8,
        sequence_num: u16,
        data: &[u8],
        chip_id: &str,
    ) -> UciStatus;

    fn query_data_size(&self, session_id: u32, chip_id: &str) -> (UciStatus, u32);

    /// Returns the indices the device refused alongside the status.
    fn session_update_dt_tag_ranging_rounds(
        &self,
        session_id: u32,
        round_indices: &[u8],
        chip_id: &str,
    ) -> (UciStatus, Vec<u8>);

    fn controller_multicast_list_update(
        &self,
        session_id: u32,
        action: MulticastAction,
        controlees: &[Controlee],
        chip_id: &str,
    ) -> UciStatus;

    fn get_max_session_number(&self) -> u32;
}
