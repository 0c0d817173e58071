// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    cfg::config::AdvertiseConfig,
    uci::{notification::OwrAoaMeasurement, params::MacAddressMode},
};

/// AoA values ride in Q9.7 fixed point; one degree is 128 raw units.
const Q9_7_ONE_DEGREE: f32 = 128.0;

pub fn q9_7_to_degrees(raw: i16) -> f32 {
    raw as f32 / Q9_7_ONE_DEGREE
}

/// The remote address inside an OWR-AoA measurement is only as wide as
/// the session's addressing mode; short addresses occupy the low two
/// bytes.
pub fn derive_owr_remote_address(
    measurement: &OwrAoaMeasurement,
    mode: MacAddressMode,
) -> u64 {
    match mode {
        MacAddressMode::Short => measurement.mac_address & 0xFFFF,
        MacAddressMode::Extended => measurement.mac_address,
    }
}

/// Default pointed-target criterion: the remote sits inside the
/// configured azimuth/elevation cone. A platform extension may
/// override the verdict per measurement.
pub fn is_pointed_target(
    criteria: &AdvertiseConfig,
    measurement: &OwrAoaMeasurement,
) -> bool {
    let azimuth = q9_7_to_degrees(measurement.aoa_azimuth_q9_7).abs();
    let elevation = q9_7_to_degrees(measurement.aoa_elevation_q9_7).abs();
    azimuth <= criteria.aoa_azimuth_degrees as f32
        && elevation <= criteria.aoa_elevation_degrees as f32
}
