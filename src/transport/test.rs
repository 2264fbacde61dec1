// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory transport
//!
//! Each instance is paired with a [`TestTransportHandle`] that plays the
//! remote side: it feeds inbound bytes and collects what was written.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::{connection_string::ConnectionOptions, Error, Result};

use super::{Transport, TransportInstance};

#[derive(Debug, Default)]
struct State {
    connected: bool,
    inbound: BytesMut,
    outbound: BytesMut,
    connect_error: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    readable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The remote end of a [`TestTransportInstance`].
#[derive(Debug, Clone, Default)]
pub struct TestTransportHandle {
    shared: Arc<Shared>,
}

impl TestTransportHandle {
    /// Makes `data` readable on the transport.
    pub fn feed(&self, data: impl AsRef<[u8]>) {
        self.shared.lock().inbound.extend_from_slice(data.as_ref());
        self.shared.readable.notify_one();
    }

    /// Drains everything written to the transport so far.
    #[must_use]
    pub fn take_written(&self) -> Bytes {
        self.shared.lock().outbound.split().freeze()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Makes subsequent connect attempts fail with `message`.
    pub fn fail_connect(&self, message: impl Into<String>) {
        self.shared.lock().connect_error = Some(message.into());
    }

    /// Simulates a connection loss.
    pub fn disconnect(&self) {
        self.shared.lock().connected = false;
        self.shared.readable.notify_one();
    }
}

#[derive(Debug)]
pub struct TestTransportInstance {
    address: String,
    shared: Arc<Shared>,
}

impl TestTransportInstance {
    #[must_use]
    pub fn new(address: impl Into<String>) -> (Self, TestTransportHandle) {
        let handle = TestTransportHandle::default();
        let instance = Self {
            address: address.into(),
            shared: Arc::clone(&handle.shared),
        };
        (instance, handle)
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.shared.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl TransportInstance for TestTransportInstance {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(message) = &state.connect_error {
            return Err(Error::transport(
                format!("failed to connect to {}", self.address),
                io::Error::new(io::ErrorKind::ConnectionRefused, message.clone()),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.lock().connected = false;
        self.shared.readable.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    async fn num_readable_bytes(&mut self) -> Result<usize> {
        Ok(self.connected_state()?.inbound.len())
    }

    async fn peek_readable_bytes(&mut self, num_bytes: usize) -> Result<Bytes> {
        let state = self.connected_state()?;
        let len = num_bytes.min(state.inbound.len());
        Ok(Bytes::copy_from_slice(&state.inbound[..len]))
    }

    async fn read(&mut self, num_bytes: usize) -> Result<Bytes> {
        loop {
            {
                let mut state = self.connected_state()?;
                if state.inbound.len() >= num_bytes {
                    return Ok(state.inbound.split_to(num_bytes).freeze());
                }
            }
            self.shared.readable.notified().await;
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.connected_state()?.outbound.extend_from_slice(data);
        Ok(())
    }
}

/// Creates [`TestTransportInstance`]s and keeps their handles by address.
#[derive(Debug, Default)]
pub struct TestTransport {
    handles: Mutex<HashMap<String, TestTransportHandle>>,
}

impl TestTransport {
    /// The handle of the most recent instance created for `address`.
    #[must_use]
    pub fn handle(&self, address: &str) -> Option<TestTransportHandle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

impl Transport for TestTransport {
    fn transport_code(&self) -> &str {
        "test"
    }

    fn transport_name(&self) -> &str {
        "Test Transport"
    }

    fn create_instance(
        &self,
        address: &str,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn TransportInstance>> {
        let (instance, handle) = TestTransportInstance::new(address);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_owned(), handle);
        Ok(Box::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_what_the_remote_side_feeds() {
        let (mut instance, handle) = TestTransportInstance::new("x");
        assert!(matches!(
            instance.num_readable_bytes().await,
            Err(Error::NotConnected)
        ));
        instance.connect().await.unwrap();
        assert!(handle.is_connected());

        handle.feed([1, 2, 3]);
        assert_eq!(instance.num_readable_bytes().await.unwrap(), 3);
        assert_eq!(&instance.peek_readable_bytes(2).await.unwrap()[..], [1, 2]);
        assert_eq!(&instance.read(2).await.unwrap()[..], [1, 2]);
        assert_eq!(instance.num_readable_bytes().await.unwrap(), 1);

        instance.write(b"abc").await.unwrap();
        assert_eq!(&handle.take_written()[..], b"abc");
        assert!(handle.take_written().is_empty());
    }

    #[tokio::test]
    async fn read_waits_for_enough_bytes() {
        let (mut instance, handle) = TestTransportInstance::new("x");
        instance.connect().await.unwrap();
        handle.feed([1]);
        let reader = tokio::spawn(async move { instance.read(3).await });
        tokio::task::yield_now().await;
        handle.feed([2, 3]);
        assert_eq!(&reader.await.unwrap().unwrap()[..], [1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_connect_on_request() {
        let transport = TestTransport::default();
        let mut instance = transport
            .create_instance("plc", &ConnectionOptions::new())
            .unwrap();
        transport.handle("plc").unwrap().fail_connect("refused");
        let err = instance.connect().await.unwrap_err();
        assert_eq!(err.to_string(), "failed to connect to plc: refused");
        assert!(!instance.is_connected());
    }
}
