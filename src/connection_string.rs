// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection strings
//!
//! A connection string has the shape `protocol[:transport]://address[?options]`,
//! e.g. `modbus:tcp://10.0.0.1:502?unit-identifier=1` or
//! `simulated://1.2.3.4:42?traceEnabled=true`.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use url::Url;

use crate::{Error, Result};

/// Query parameters of a connection string.
///
/// A key may occur more than once; single-value accessors return the
/// first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    values: HashMap<String, Vec<String>>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map_or(&[], Vec::as_slice)
    }

    /// Parses `true`/`false` (case insensitive).
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        if value.eq_ignore_ascii_case("true") {
            Ok(Some(true))
        } else if value.eq_ignore_ascii_case("false") {
            Ok(Some(false))
        } else {
            Err(invalid_option(key, value, "expected 'true' or 'false'"))
        }
    }

    /// Parses a duration given in milliseconds.
    pub fn get_millis(&self, key: &str) -> Result<Option<Duration>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .parse::<u64>()
            .map(|millis| Some(Duration::from_millis(millis)))
            .map_err(|_| invalid_option(key, value, "expected a duration in milliseconds"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn invalid_option(key: &str, value: &str, reason: &str) -> Error {
    Error::InvalidConnectionString {
        input: format!("{key}={value}"),
        reason: reason.to_owned(),
    }
}

/// The transport part of a connection string, e.g. `tcp://10.0.0.1:502`.
///
/// Drivers without a transport (like the simulated one) get no transport code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    pub transport_code: Option<String>,
    pub address: String,
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport_code {
            Some(transport_code) => write!(f, "{transport_code}://{}", self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    raw: String,
    protocol_code: String,
    transport_code: Option<String>,
    address: String,
    options: ConnectionOptions,
}

impl ConnectionUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidConnectionString {
            input: input.to_owned(),
            reason: reason.to_owned(),
        };
        let url = Url::parse(input).map_err(|err| invalid(&err.to_string()))?;
        let protocol_code = url.scheme().to_owned();

        let (transport_code, address) = if url.cannot_be_a_base() {
            // `protocol:transport://address`: the transport is hidden in the path.
            let inner = Url::parse(url.path()).map_err(|err| invalid(&err.to_string()))?;
            if inner.cannot_be_a_base() {
                return Err(invalid("missing '://' after the transport code"));
            }
            (Some(inner.scheme().to_owned()), address_of(&inner))
        } else {
            (None, address_of(&url))
        };

        let mut options = ConnectionOptions::new();
        for (key, value) in url.query_pairs() {
            options.insert(key, value);
        }

        Ok(Self {
            raw: input.to_owned(),
            protocol_code,
            transport_code,
            address,
            options,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn protocol_code(&self) -> &str {
        &self.protocol_code
    }

    #[must_use]
    pub fn transport_code(&self) -> Option<&str> {
        self.transport_code.as_deref()
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Resolves the transport, falling back to `default_transport`
    /// if the connection string doesn't name one.
    #[must_use]
    pub fn transport_url(&self, default_transport: Option<&str>) -> TransportUrl {
        TransportUrl {
            transport_code: self
                .transport_code
                .as_deref()
                .or(default_transport)
                .map(ToOwned::to_owned),
            address: self.address.clone(),
        }
    }
}

fn address_of(url: &Url) -> String {
    let mut address = url.host_str().unwrap_or_default().to_owned();
    if let Some(port) = url.port() {
        address.push(':');
        address.push_str(&port.to_string());
    }
    let path = url.path();
    if !path.is_empty() && path != "/" {
        address.push_str(path);
    }
    address
}

impl FromStr for ConnectionUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
