// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP transport

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::{io::AsyncWriteExt as _, net::TcpStream};

use crate::{connection_string::ConnectionOptions, Error, Result};

use super::{Transport, TransportInstance};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Creates [`TcpTransportInstance`]s.
///
/// Recognized options: `connect-timeout` (milliseconds), `keep-alive`
/// (`true`/`false`, enabled by default).
#[derive(Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn transport_code(&self) -> &str {
        "tcp"
    }

    fn transport_name(&self) -> &str {
        "TCP/IP Socket"
    }

    fn create_instance(
        &self,
        address: &str,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn TransportInstance>> {
        if address.is_empty() {
            return Err(Error::InvalidConnectionString {
                input: address.to_owned(),
                reason: "missing host".to_owned(),
            });
        }
        let connect_timeout = options
            .get_millis("connect-timeout")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let keep_alive = options.get_bool("keep-alive")?.unwrap_or(true);
        Ok(Box::new(TcpTransportInstance {
            address: address.to_owned(),
            connect_timeout,
            keep_alive,
            stream: None,
            read_buffer: BytesMut::new(),
        }))
    }
}

#[derive(Debug)]
pub struct TcpTransportInstance {
    address: String,
    connect_timeout: Duration,
    keep_alive: bool,
    stream: Option<TcpStream>,
    read_buffer: BytesMut,
}

impl TcpTransportInstance {
    fn stream(&self) -> Result<&TcpStream> {
        self.stream.as_ref().ok_or(Error::NotConnected)
    }

    /// Moves everything the socket has to offer into the read buffer
    /// without waiting.
    fn fill_read_buffer(&mut self) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Err(Error::NotConnected);
        };
        loop {
            match stream.try_read_buf(&mut self.read_buffer) {
                Ok(0) => {
                    log::debug!("Connection to {} closed by peer", self.address);
                    self.stream = None;
                    if self.read_buffer.is_empty() {
                        return Err(Error::transport(
                            "connection closed by peer",
                            io::ErrorKind::UnexpectedEof.into(),
                        ));
                    }
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(Error::transport("failed to read", err)),
            }
        }
    }
}

#[async_trait]
impl TransportInstance for TcpTransportInstance {
    async fn connect(&mut self) -> Result<()> {
        log::debug!("Connecting to {}", self.address);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Error::Timeout {
                operation: "tcp connect",
                elapsed: self.connect_timeout,
            })?
            .map_err(|err| Error::transport(format!("failed to connect to {}", self.address), err))?;
        stream.set_nodelay(true)?;
        if self.keep_alive {
            SockRef::from(&stream).set_keepalive(true)?;
        }
        self.read_buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            log::debug!("Disconnecting from {}", self.address);
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn num_readable_bytes(&mut self) -> Result<usize> {
        self.fill_read_buffer()?;
        Ok(self.read_buffer.len())
    }

    async fn peek_readable_bytes(&mut self, num_bytes: usize) -> Result<Bytes> {
        self.fill_read_buffer()?;
        let len = num_bytes.min(self.read_buffer.len());
        Ok(Bytes::copy_from_slice(&self.read_buffer[..len]))
    }

    async fn read(&mut self, num_bytes: usize) -> Result<Bytes> {
        while self.read_buffer.len() < num_bytes {
            self.stream()?.readable().await?;
            self.fill_read_buffer()?;
        }
        Ok(self.read_buffer.split_to(num_bytes).freeze())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };
        stream.write_all(data).await?;
        Ok(())
    }
}
