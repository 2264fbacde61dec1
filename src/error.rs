// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use thiserror::Error;

/// Error type for connections, codecs and the connection cache.
///
/// The error is cheap to clone, so that a single failure can be
/// delivered to every client waiting for the same connection.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The underlying transport failed.
    #[error("{context}: {source}")]
    Transport {
        context: Cow<'static, str>,
        #[source]
        source: Arc<io::Error>,
    },

    /// A bounded wait expired.
    #[error("timeout while waiting for {operation} after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// Inbound data could not be decoded or didn't match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A driver refused to establish the connection.
    ///
    /// Displays the driver's message verbatim.
    #[error("{0}")]
    Connect(String),

    /// The connection string could not be parsed.
    #[error("invalid connection string '{input}': {reason}")]
    InvalidConnectionString { input: String, reason: String },

    /// No driver is registered for the protocol code.
    #[error("no driver registered for protocol '{0}'")]
    DriverNotFound(String),

    /// No transport is registered for the transport code.
    #[error("no transport registered for '{0}'")]
    TransportNotFound(String),

    /// A request could not be built or executed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// The operation is not supported by this connection.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The connection cache has been closed.
    #[error("connection cache is closed")]
    CacheClosed,

    /// The other side of an asynchronous operation went away.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Wraps an I/O error with some context.
    pub fn transport(context: impl Into<Cow<'static, str>>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Returns `true` if this is a [`Error::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::transport("transport error", err)
    }
}

/// Specialized [`std::result::Result`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
