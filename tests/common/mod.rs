// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::{io, sync::Arc, time::Duration};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use tokio_plc::{
    driver::DriverManager, drivers::simulated::SimulatedDriver, transport::test::TestTransportHandle,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn driver_manager() -> Arc<DriverManager> {
    let mut driver_manager = DriverManager::new();
    driver_manager.register_driver(Arc::new(SimulatedDriver::new()));
    Arc::new(driver_manager)
}

/// A message of the test protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u16, payload: &'static [u8]) -> Self {
        Self {
            id,
            payload: Bytes::from_static(payload),
        }
    }
}

/// `[length: u16][id: u16][payload]`, the length covers id and payload.
#[derive(Debug, Default)]
pub struct MessageFramer;

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        if len < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame length {len}"),
            ));
        }
        if buf.len() < 2 + len {
            return Ok(None);
        }
        buf.advance(2);
        let id = buf.get_u16();
        let payload = buf.split_to(len - 2).freeze();
        Ok(Some(Message { id, payload }))
    }
}

impl Encoder<Message> for MessageFramer {
    type Error = io::Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> io::Result<()> {
        let len = u16::try_from(message.payload.len() + 2)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
        buf.reserve(2 + usize::from(len));
        buf.put_u16(len);
        buf.put_u16(message.id);
        buf.put_slice(&message.payload);
        Ok(())
    }
}

pub fn encode(message: Message) -> Bytes {
    let mut buf = BytesMut::new();
    MessageFramer.encode(message, &mut buf).unwrap();
    buf.freeze()
}

/// Plays a remote side that answers every message with itself.
pub fn spawn_echo(handle: TestTransportHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut framer = MessageFramer;
        let mut pending = BytesMut::new();
        loop {
            pending.extend_from_slice(&handle.take_written());
            while let Some(message) = framer.decode(&mut pending).unwrap() {
                handle.feed(encode(message));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}
