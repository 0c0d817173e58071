// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::uci::params::MacAddressMode;

/// UCI-defined session states. Transitions are observed exclusively
/// through [`SessionStatusNtf`]; the host never mutates state on its
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Deinit,
    Active,
    Idle,
    Error,
}

impl SessionState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Init,
            0x01 => Self::Deinit,
            0x02 => Self::Active,
            0x03 => Self::Idle,
            _ => Self::Error,
        }
    }
}

/// Why the device moved a session to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// The transition answers a host command.
    ManagementCommand,
    MaxRangingRoundRetryCountReached,
    MaxNumberOfMeasurementsReached,
    Other(u8),
}

impl ReasonCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::ManagementCommand,
            0x01 => Self::MaxRangingRoundRetryCountReached,
            0x02 => Self::MaxNumberOfMeasurementsReached,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatusNtf {
    pub session_id: u32,
    pub state: SessionState,
    pub reason: ReasonCode,
}

/// How the measurements in a range-data notification were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingMeasurementType {
    TwoWay,
    OwrAoa,
}

pub const MEASUREMENT_STATUS_OK: u8 = 0x00;

/// One two-way-ranging measurement against a single remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoWayMeasurement {
    pub mac_address: u64,
    pub status: u8,
    pub nlos: u8,
    pub distance_cm: u16,
    pub aoa_azimuth_q9_7: i16,
    pub aoa_elevation_q9_7: i16,
}

/// One OWR-AoA measurement (observer side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwrAoaMeasurement {
    pub mac_address: u64,
    pub status: u8,
    pub block_index: u16,
    pub frame_sequence_number: u8,
    pub aoa_azimuth_q9_7: i16,
    pub aoa_elevation_q9_7: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDataNtf {
    pub session_id: u32,
    pub current_ranging_interval_ms: u32,
    pub measurement_type: RangingMeasurementType,
    pub mac_address_mode: MacAddressMode,
    pub two_way_measurements: Vec<TwoWayMeasurement>,
    pub owr_aoa_measurement: Option<OwrAoaMeasurement>,
}

impl RangeDataNtf {
    /// True when the notification carries measurements and every one of
    /// them failed. Feeds the ranging-error-streak watchdog.
    pub fn is_all_errors(&self) -> bool {
        match self.measurement_type {
            RangingMeasurementType::TwoWay => {
                !self.two_way_measurements.is_empty()
                    && self
                        .two_way_measurements
                        .iter()
                        .all(|m| m.status != MEASUREMENT_STATUS_OK)
            },
            RangingMeasurementType::OwrAoa => self
                .owr_aoa_measurement
                .as_ref()
                .is_some_and(|m| m.status != MEASUREMENT_STATUS_OK),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastUpdateStatus {
    Ok,
    MulticastListFull,
    KeyFetchFail,
    SubSessionIdNotFound,
    Other(u8),
}

impl MulticastUpdateStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Ok,
            0x01 => Self::MulticastListFull,
            0x02 => Self::KeyFetchFail,
            0x03 => Self::SubSessionIdNotFound,
            other => Self::Other(other),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControleeStatus {
    pub mac_address: u16,
    pub sub_session_id: u32,
    pub status: MulticastUpdateStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastListUpdateNtf {
    pub session_id: u32,
    pub remaining_list_size: u8,
    pub statuses: Vec<ControleeStatus>,
}

/// Everything the platform pushes up from the UWB subsystem. The
/// session manager consumes these from a single channel in arrival
/// order.
#[derive(Debug, Clone)]
pub enum UciNotification {
    SessionStatus(SessionStatusNtf),
    RangeData(RangeDataNtf),
    MulticastListUpdate(MulticastListUpdateNtf),
    /// Raw inbound data packet; framing is validated by the manager via
    /// [`crate::uci::packets::DataRcvPacket`].
    DataReceived(Bytes),
}
