// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail, ensure};
use bitflags::bitflags;

bitflags! {
    /// Inter-industry CLA byte bits (ISO 7816-4 table 2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClaBits: u8 {
        /// Proprietary class (FiRa applet commands set this).
        const PROPRIETARY      = 0x80;
        /// Further inter-industry coding: logical channels 4..=19.
        const CHANNEL_EXTENDED = 0x40;
        /// Command chaining, last-or-only command cleared.
        const CHAINING         = 0x10;
    }
}

/// Highest logical channel number expressible in a CLA byte.
pub const MAX_LOGICAL_CHANNEL: u8 = 19;

/// An ISO 7816-4 command APDU.
///
/// The builder keeps header, payload and expected length separate; the
/// encoder picks the short or extended form (cases 1..=4) on its own:
/// any payload longer than 255 bytes or an `Le` above 256 switches the
/// whole command to extended length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    data: Vec<u8>,
    le: Option<u32>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Expected response length; `0` means "up to the maximum" and is
    /// encoded as `0x00` (short) or `0x0000` (extended).
    pub fn le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Stamp a logical channel number into the CLA byte. Channels 0..=3
    /// live in the two low bits, 4..=19 use the 0x40 encoding with four
    /// channel bits.
    pub fn on_channel(mut self, channel: u8) -> Result<Self> {
        ensure!(
            channel <= MAX_LOGICAL_CHANNEL,
            "logical channel {channel} out of range"
        );
        if channel < 4 {
            self.cla = (self.cla & !0x43) | channel;
        } else {
            self.cla =
                (self.cla & !0x4F) | ClaBits::CHANNEL_EXTENDED.bits() | (channel - 4);
        }
        Ok(self)
    }

    fn is_extended(&self) -> bool {
        self.data.len() > 0xFF || self.le.is_some_and(|le| le > 0x100)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);

        let extended = self.is_extended();
        if !self.data.is_empty() {
            if extended {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                out.push(self.data.len() as u8);
            }
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if extended {
                // Zero means the 65536-byte maximum.
                let le16 = if le >= 0x1_0000 { 0u16 } else { le as u16 };
                if self.data.is_empty() {
                    out.push(0x00);
                }
                out.extend_from_slice(&le16.to_be_bytes());
            } else {
                out.push(if le == 0 || le == 0x100 { 0x00 } else { le as u8 });
            }
        }
        out
    }

    /// Decode a command APDU received from a peer. Both short and
    /// extended bodies are accepted; a trailing `Le` is tolerated and
    /// recorded.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= 4, "command APDU shorter than a header");
        let (cla, ins, p1, p2) = (buf[0], buf[1], buf[2], buf[3]);
        let body = &buf[4..];
        let mut cmd = Self::new(cla, ins, p1, p2);

        match body {
            [] => Ok(cmd),
            // case 2 short
            [le] => Ok(cmd.le(*le as u32)),
            // extended body: 00 prefix, then Lc and/or Le
            [0x00, rest @ ..] if !rest.is_empty() => {
                ensure!(rest.len() >= 2, "truncated extended length");
                if rest.len() == 2 {
                    // case 2 extended
                    return Ok(cmd.le(u16::from_be_bytes([rest[0], rest[1]]) as u32));
                }
                let lc = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let rest = &rest[2..];
                ensure!(rest.len() >= lc, "extended body truncated: lc={lc}");
                cmd = cmd.data(rest[..lc].to_vec());
                match rest.len() - lc {
                    0 => Ok(cmd),
                    2 => {
                        let le = u16::from_be_bytes([rest[lc], rest[lc + 1]]);
                        Ok(cmd.le(le as u32))
                    },
                    n => bail!("unexpected {n} bytes after extended data"),
                }
            },
            // case 3/4 short
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                ensure!(rest.len() >= lc, "short body truncated: lc={lc}");
                cmd = cmd.data(rest[..lc].to_vec());
                match rest.len() - lc {
                    0 => Ok(cmd),
                    1 => Ok(cmd.le(rest[lc] as u32)),
                    n => bail!("unexpected {n} bytes after data"),
                }
            },
        }
    }
}
