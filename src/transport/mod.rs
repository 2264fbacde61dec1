// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte stream transports

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    connection_string::{ConnectionOptions, TransportUrl},
    Error, Result,
};

#[cfg(feature = "tcp")]
pub mod tcp;

pub mod test;

/// A connected (or connectable) duplex byte stream.
///
/// Reads never consume more than what has been requested. Inbound
/// bytes stay buffered until they are read.
#[async_trait]
pub trait TransportInstance: Send + Debug {
    async fn connect(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Number of bytes that can be read without waiting.
    async fn num_readable_bytes(&mut self) -> Result<usize>;

    /// Returns up to `num_bytes` buffered bytes without consuming them.
    async fn peek_readable_bytes(&mut self, num_bytes: usize) -> Result<Bytes>;

    /// Consumes exactly `num_bytes`, waiting for them if necessary.
    async fn read(&mut self, num_bytes: usize) -> Result<Bytes>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Factory for transport instances.
pub trait Transport: Send + Sync + Debug {
    fn transport_code(&self) -> &str;

    fn transport_name(&self) -> &str;

    fn create_instance(
        &self,
        address: &str,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn TransportInstance>>;
}

/// Transports available to drivers, by transport code.
#[derive(Debug, Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any transport previously registered with the same code.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        let code = transport.transport_code().to_owned();
        log::debug!("Registering transport '{code}'");
        self.transports.insert(code, transport);
    }

    pub fn get(&self, transport_code: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(transport_code)
            .cloned()
            .ok_or_else(|| Error::TransportNotFound(transport_code.to_owned()))
    }

    /// Creates an unconnected instance of the transport named by `transport_url`.
    pub fn create_instance(
        &self,
        transport_url: &TransportUrl,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn TransportInstance>> {
        let transport_code = transport_url
            .transport_code
            .as_deref()
            .ok_or_else(|| Error::TransportNotFound(transport_url.to_string()))?;
        self.get(transport_code)?
            .create_instance(&transport_url.address, options)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.transports.keys().cloned().collect();
        names.sort();
        names
    }
}
