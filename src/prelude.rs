// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types and traits

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
pub use crate::{cache, codec, transport};

#[allow(missing_docs)]
#[cfg(feature = "simulated")]
pub mod simulated {
    pub use crate::drivers::simulated::*;
}

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::cache::{CacheConfig, ConnectionCache, ConnectionLease, ReconnectPolicy};
pub use crate::codec::{CodecConfig, MessageCodec};
pub use crate::connection::{default::DefaultConnection, CloseResult, ConnectionMetadata};
pub use crate::connection_string::{ConnectionOptions, ConnectionUrl, TransportUrl};
pub use crate::driver::DriverManager;
pub use crate::trace::{TraceEntry, Tracer};
pub use crate::value::{PlcValue, PlcValueType, ResponseCode};
pub use crate::{Error, Result};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::codec::Framer;
pub use crate::connection::{default::Pinger, Connection};
pub use crate::driver::Driver;
pub use crate::model::{Browser, Reader, Subscriber, Writer};
pub use crate::transport::{Transport, TransportInstance};
