// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod callbacks;
pub mod manager;
pub mod ranging;
pub mod uwb_session;

use thiserror::Error;

/// Synchronously rejected session-manager requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session id {0} already exists")]
    Duplicate(u32),
    #[error("maximum number of sessions exceeded")]
    MaxSessions,
    #[error("system policy forbids opening a session from the background")]
    SystemPolicy,
    #[error("unknown session handle")]
    UnknownHandle,
    #[error("session service stopped")]
    ServiceStopped,
}
