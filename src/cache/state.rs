// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pool slot state and events

use std::fmt;

use crate::Error;

/// State of a cached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Connecting, no connection available yet.
    #[default]
    Initialized,
    /// Connected and available.
    Idle,
    /// Leased out.
    InUse,
    /// Failed the liveness check.
    Invalid,
}

impl ConnectionState {
    #[must_use]
    pub fn is_available(self) -> bool {
        self == Self::Idle
    }

    /// Whether lease requests are queued in this state.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Initialized | Self::InUse | Self::Invalid)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Idle => "idle",
            Self::InUse => "in use",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Lifecycle events emitted by a cached connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Establishing the connection failed for good.
    Error { key: String, error: Error },
}

impl ConnectionEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Error { key, .. } => key,
        }
    }
}

/// Receives [`ConnectionEvent`]s.
pub(crate) trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent, source: &super::container::ConnectionContainer);
}
