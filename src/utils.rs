// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::RngExt;

use crate::uci::params::MacAddressMode;

/// Generates a random positive 31-bit unique session id, as adopted by
/// controllers when the applet did not hand out a default one. Zero is
/// excluded so the id can never collide with "unset".
pub fn generate_unique_session_id() -> u32 {
    rand::rng().random_range(1..=i32::MAX as u32)
}

/// Left-pad a remote MAC into the 8-byte extended form used on the UCI
/// data path.
pub fn extended_address_bytes(addr: u64) -> [u8; 8] {
    addr.to_be_bytes()
}

/// Widen a 2-byte short address into the extended u64 form.
pub fn short_to_extended(short: u16) -> u64 {
    short as u64
}

/// Bytes of a remote MAC in its session addressing mode; used when a
/// measurement address must be matched against buffered data packets.
pub fn address_in_mode(addr: u64, mode: MacAddressMode) -> Vec<u8> {
    match mode {
        MacAddressMode::Short => (addr as u16).to_be_bytes().to_vec(),
        MacAddressMode::Extended => addr.to_be_bytes().to_vec(),
    }
}
