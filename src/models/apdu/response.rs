// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Result, ensure};

/// Two-byte status word trailing every response APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const APPLET_SELECT_FAILED: StatusWord = StatusWord(0x6999);
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6E00);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const FUNCTION_NOT_SUPPORTED: StatusWord = StatusWord(0x6A81);
    pub const INCORRECT_P1P2: StatusWord = StatusWord(0x6A86);
    pub const NOT_ENOUGH_MEMORY: StatusWord = StatusWord(0x6A84);
    pub const NO_ERROR: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);

    pub const fn is_success(&self) -> bool {
        self.0 == Self::NO_ERROR.0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SW=0x{:04X}", self.0)
    }
}

/// An ISO 7816-4 response APDU: optional data plus the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Vec<u8>,
    sw: StatusWord,
}

impl ResponseApdu {
    pub fn new(data: impl Into<Vec<u8>>, sw: StatusWord) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    /// A bare status word with no data, e.g. the `6999` pushed to the
    /// peer when secure channel setup fails.
    pub fn status_only(sw: StatusWord) -> Self {
        Self::new(Vec::new(), sw)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= 2, "response APDU shorter than a status word");
        let (data, sw) = buf.split_at(buf.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw: StatusWord(u16::from_be_bytes([sw[0], sw[1]])),
        })
    }

    pub fn sw(&self) -> StatusWord {
        self.sw
    }

    pub fn is_success(&self) -> bool {
        self.sw.is_success()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the response, failing unless the applet reported success.
    pub fn into_data(self) -> Result<Vec<u8>> {
        ensure!(self.sw.is_success(), "applet error: {}", self.sw);
        Ok(self.data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.sw.to_bytes());
        out
    }
}
