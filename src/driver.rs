// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drivers and the driver manager
//!
//! A [`DriverManager`] is an explicitly constructed registry of drivers
//! and transports. It dispatches connection strings to the driver
//! registered for their protocol code.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    connection::Connection,
    connection_string::{ConnectionOptions, ConnectionUrl, TransportUrl},
    transport::{Transport, TransportRegistry},
    Error, Result,
};

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub protocol_code: String,
    pub transport_url: TransportUrl,
    pub name: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryEvent {
    /// The connection string for connecting to the discovered device.
    #[must_use]
    pub fn connection_string(&self) -> String {
        match &self.transport_url.transport_code {
            Some(transport_code) => format!(
                "{}:{transport_code}://{}",
                self.protocol_code, self.transport_url.address
            ),
            None => format!("{}://{}", self.protocol_code, self.transport_url.address),
        }
    }
}

/// Restricts discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Only query these protocols. Empty means all.
    pub protocol_codes: Vec<String>,
    /// Only use these transports. Empty means all.
    pub transport_codes: Vec<String>,
    /// Driver specific options.
    pub options: ConnectionOptions,
}

pub type DiscoveryCallback<'a> = &'a (dyn Fn(DiscoveryEvent) + Send + Sync);

/// A protocol driver.
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    fn protocol_code(&self) -> &str;

    fn protocol_name(&self) -> &str;

    /// Used when the connection string doesn't name a transport.
    fn default_transport(&self) -> Option<&str> {
        None
    }

    /// Establishes a new connection.
    async fn get_connection(
        &self,
        transport_url: &TransportUrl,
        transports: &TransportRegistry,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Connection>>;

    fn supports_discovery(&self) -> bool {
        false
    }

    async fn discover(
        &self,
        options: &DiscoveryOptions,
        callback: DiscoveryCallback<'_>,
    ) -> Result<()> {
        let _ = (options, callback);
        Err(Error::Unsupported("discover"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverManager {
    drivers: HashMap<String, Arc<dyn Driver>>,
    transports: TransportRegistry,
}

impl DriverManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any driver previously registered with the same protocol code.
    pub fn register_driver(&mut self, driver: Arc<dyn Driver>) {
        let code = driver.protocol_code().to_owned();
        log::debug!("Registering driver '{code}' ({})", driver.protocol_name());
        self.drivers.insert(code, driver);
    }

    pub fn register_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.register(transport);
    }

    pub fn driver(&self, protocol_code: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(protocol_code)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound(protocol_code.to_owned()))
    }

    pub fn transport(&self, transport_code: &str) -> Result<Arc<dyn Transport>> {
        self.transports.get(transport_code)
    }

    #[must_use]
    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    #[must_use]
    pub fn list_driver_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn list_transport_names(&self) -> Vec<String> {
        self.transports.names()
    }

    /// Parses `connection_string` and connects through the matching driver.
    pub async fn get_connection(&self, connection_string: &str) -> Result<Box<dyn Connection>> {
        let url = ConnectionUrl::parse(connection_string)?;
        let driver = self.driver(url.protocol_code())?;
        let transport_url = url.transport_url(driver.default_transport());
        log::debug!(
            "Connecting to {transport_url} using driver '{}'",
            driver.protocol_code()
        );
        driver
            .get_connection(&transport_url, &self.transports, url.options())
            .await
    }

    /// Runs discovery on every selected driver that supports it.
    pub async fn discover(
        &self,
        options: &DiscoveryOptions,
        callback: DiscoveryCallback<'_>,
    ) -> Result<()> {
        let mut codes = self.list_driver_names();
        if !options.protocol_codes.is_empty() {
            codes.retain(|code| options.protocol_codes.contains(code));
        }
        for code in codes {
            let driver = self.driver(&code)?;
            if !driver.supports_discovery() {
                log::debug!("Driver '{code}' doesn't support discovery");
                continue;
            }
            driver.discover(options, callback).await?;
        }
        Ok(())
    }
}
