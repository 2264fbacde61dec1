// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message codec
//!
//! A [`MessageCodec`] owns a transport instance and runs a background
//! worker that decodes inbound messages and correlates them with the
//! outstanding expectations. Messages that match no expectation are
//! forwarded to a bounded default channel.
//!
//! Framing is delegated to a [`tokio_util::codec`] decoder/encoder pair.

use std::{
    any::Any,
    fmt, io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures_util::FutureExt as _;
use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        oneshot,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::{transport::TransportInstance, Error, Result};

mod expectation;

use self::expectation::{Expectation, Expectations};

pub use self::expectation::{AcceptsMessage, HandleError, HandleMessage};

/// Protocol specific framing of messages.
///
/// Implemented for every [`tokio_util::codec`] type that decodes and
/// encodes the same message type.
pub trait Framer: Send + 'static {
    type Message: Send + fmt::Debug + 'static;

    /// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
    fn decode_message(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Message>>;

    fn encode_message(&mut self, message: Self::Message, buf: &mut BytesMut) -> io::Result<()>;
}

impl<C> Framer for C
where
    C: Decoder<Error = io::Error> + Encoder<<C as Decoder>::Item, Error = io::Error> + Send + 'static,
    <C as Decoder>::Item: Send + fmt::Debug + 'static,
{
    type Message = <C as Decoder>::Item;

    fn decode_message(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Message>> {
        self.decode(buf)
    }

    fn encode_message(&mut self, message: Self::Message, buf: &mut BytesMut) -> io::Result<()> {
        self.encode(message, buf)
    }
}

/// Tuning parameters of the codec worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Pause between polling iterations without progress.
    pub poll_interval: Duration,
    /// How long an unmatched message waits for a consumer before it is dropped.
    pub default_channel_timeout: Duration,
    pub default_channel_capacity: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            default_channel_timeout: Duration::from_millis(40),
            default_channel_capacity: 100,
        }
    }
}

impl CodecConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_default_channel_timeout(mut self, timeout: Duration) -> Self {
        self.default_channel_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_default_channel_capacity(mut self, capacity: usize) -> Self {
        self.default_channel_capacity = capacity.max(1);
        self
    }
}

/// Claims raw messages before they are correlated with expectations.
///
/// Returns `true` if the message has been consumed.
pub type CustomMessageHandler<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

struct Io<F> {
    transport: Box<dyn TransportInstance>,
    framer: F,
    read_buffer: BytesMut,
}

struct Inner<F: Framer> {
    io: tokio::sync::Mutex<Io<F>>,
    expectations: Expectations<F::Message>,
    running: AtomicBool,
    config: CodecConfig,
    default_tx: mpsc::Sender<F::Message>,
    default_rx: Mutex<Option<mpsc::Receiver<F::Message>>>,
    custom_handler: Option<CustomMessageHandler<F::Message>>,
}

impl<F: Framer> Inner<F> {
    fn default_rx(&self) -> MutexGuard<'_, Option<mpsc::Receiver<F::Message>>> {
        self.default_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_default_consumer(&self) -> bool {
        self.default_rx().is_none() && !self.default_tx.is_closed()
    }

    async fn run(self: Arc<Self>) {
        log::debug!("Message codec worker started");
        while self.running.load(Ordering::Acquire) {
            let iteration = AssertUnwindSafe(self.work()).catch_unwind().await;
            if let Err(panic) = iteration {
                log::error!(
                    "Recovered from panic in message codec worker: {}",
                    panic_message(panic.as_ref())
                );
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        log::debug!("Message codec worker stopped");
    }

    async fn work(&self) {
        if self.expectations.is_empty()
            && self.custom_handler.is_none()
            && !self.has_default_consumer()
        {
            tokio::time::sleep(self.config.poll_interval).await;
            return;
        }
        self.expectations.expire(Instant::now());
        match self.receive().await {
            Ok(Some(message)) => self.dispatch(message).await,
            Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
            Err(Error::NotConnected) => {
                log::debug!("Transport disconnected, stopping message codec worker");
                self.running.store(false, Ordering::Release);
            }
            Err(err) => {
                log::warn!("Failed to receive message: {err}");
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    async fn receive(&self) -> Result<Option<F::Message>> {
        let mut io = self.io.lock().await;
        let Io {
            transport,
            framer,
            read_buffer,
        } = &mut *io;
        let readable = transport.num_readable_bytes().await?;
        if readable > 0 {
            let bytes = transport.read(readable).await?;
            read_buffer.extend_from_slice(&bytes);
        }
        framer.decode_message(read_buffer).map_err(|err| {
            let discarded = read_buffer.len();
            read_buffer.clear();
            Error::Protocol(format!("{err} ({discarded} byte(s) discarded)"))
        })
    }

    async fn dispatch(&self, message: F::Message) {
        log::trace!("Received {message:?}");
        if let Some(handler) = &self.custom_handler {
            if handler(&message) {
                return;
            }
        }
        if self.expectations.handle(&message) {
            return;
        }
        match self
            .default_tx
            .send_timeout(message, self.config.default_channel_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(message)) => {
                log::warn!("Dropping unmatched message, no consumer ready: {message:?}");
            }
            Err(SendTimeoutError::Closed(message)) => {
                log::debug!("Dropping unmatched message: {message:?}");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn with_context(err: Error, context: &'static str) -> Error {
    match err {
        Error::Transport { source, .. } => Error::Transport {
            context: context.into(),
            source,
        },
        err => err,
    }
}

/// Sends messages over a transport and correlates responses.
pub struct MessageCodec<F: Framer> {
    inner: Arc<Inner<F>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Framer> MessageCodec<F> {
    #[must_use]
    pub fn new(transport: Box<dyn TransportInstance>, framer: F) -> Self {
        Self::builder(transport, framer).build()
    }

    pub fn builder(transport: Box<dyn TransportInstance>, framer: F) -> MessageCodecBuilder<F> {
        MessageCodecBuilder {
            transport,
            framer,
            config: CodecConfig::default(),
            custom_handler: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.inner.config
    }

    /// Connects the transport and starts the worker.
    ///
    /// Does nothing if the worker is already running.
    pub async fn connect(&self) -> Result<()> {
        let mut io = self.inner.io.lock().await;
        if self.inner.running.load(Ordering::Acquire) {
            log::debug!("Message codec already running");
            return Ok(());
        }
        if !io.transport.is_connected() {
            io.transport.connect().await?;
        }
        io.read_buffer.clear();
        self.inner.running.store(true, Ordering::Release);
        drop(io);

        let worker = tokio::spawn(Arc::clone(&self.inner).run());
        if let Some(stale) = self.worker_handle().replace(worker) {
            // A previous worker that hasn't noticed the disconnect yet.
            stale.abort();
        }
        Ok(())
    }

    /// Stops the worker and closes the transport.
    ///
    /// The worker stops after finishing its current iteration.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        let mut io = self.inner.io.lock().await;
        io.transport.close().await
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.io.lock().await.transport.is_connected()
    }

    pub async fn send(&self, message: F::Message) -> Result<()> {
        log::debug!("Send {message:?}");
        let mut io = self.inner.io.lock().await;
        let Io {
            transport, framer, ..
        } = &mut *io;
        let mut buf = BytesMut::new();
        framer
            .encode_message(message, &mut buf)
            .map_err(|err| Error::transport("failed to encode message", err))?;
        transport
            .write(&buf)
            .await
            .map_err(|err| with_context(err, "failed to send message"))
    }

    /// Registers an expectation that expires after `ttl`.
    pub fn expect(
        &self,
        accepts: impl Fn(&F::Message) -> bool + Send + 'static,
        on_message: impl FnOnce(&F::Message) -> Result<()> + Send + 'static,
        on_error: impl FnOnce(Error) -> Result<()> + Send + 'static,
        ttl: Duration,
    ) {
        self.inner.expectations.register(Expectation::new(
            ttl,
            Box::new(accepts),
            Box::new(on_message),
            Box::new(on_error),
        ));
    }

    /// Sends `message` and registers an expectation for its response.
    ///
    /// Nothing is registered if sending fails.
    pub async fn send_request(
        &self,
        message: F::Message,
        accepts: impl Fn(&F::Message) -> bool + Send + 'static,
        on_message: impl FnOnce(&F::Message) -> Result<()> + Send + 'static,
        on_error: impl FnOnce(Error) -> Result<()> + Send + 'static,
        ttl: Duration,
    ) -> Result<()> {
        self.send(message).await?;
        self.expect(accepts, on_message, on_error, ttl);
        Ok(())
    }

    /// Sends `message` and waits for the first accepted response.
    pub async fn request(
        &self,
        message: F::Message,
        accepts: impl Fn(&F::Message) -> bool + Send + 'static,
        ttl: Duration,
    ) -> Result<F::Message>
    where
        F::Message: Clone,
    {
        let (tx, rx) = oneshot::channel();
        let response_tx = Arc::new(Mutex::new(Some(tx)));
        let error_tx = Arc::clone(&response_tx);
        self.send_request(
            message,
            accepts,
            move |response| {
                complete(&response_tx, Ok(response.clone()));
                Ok(())
            },
            move |err| {
                complete(&error_tx, Err(err));
                Ok(())
            },
            ttl,
        )
        .await?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Times out all expectations that are expired at `now`.
    pub fn timeout_expectations(&self, now: Instant) -> usize {
        self.inner.expectations.expire(now)
    }

    /// Offers `message` to the outstanding expectations.
    ///
    /// Returns `true` if an expectation handled it.
    pub fn handle_message(&self, message: &F::Message) -> bool {
        self.inner.expectations.handle(message)
    }

    #[must_use]
    pub fn expectation_count(&self) -> usize {
        self.inner.expectations.len()
    }

    /// The receiving end of the default channel.
    ///
    /// Returns `None` after the first call.
    pub fn take_default_incoming_messages(&self) -> Option<mpsc::Receiver<F::Message>> {
        self.inner.default_rx().take()
    }

    fn worker_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type ResponseSender<M> = Arc<Mutex<Option<oneshot::Sender<Result<M>>>>>;

fn complete<M>(tx: &ResponseSender<M>, result: Result<M>) {
    let tx = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(tx) = tx {
        // The requester may have given up.
        let _ = tx.send(result);
    }
}

impl<F: Framer> fmt::Debug for MessageCodec<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("running", &self.is_running())
            .field("expectations", &self.expectation_count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<F: Framer> Drop for MessageCodec<F> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker_handle().take() {
            worker.abort();
        }
    }
}

#[must_use]
pub struct MessageCodecBuilder<F: Framer> {
    transport: Box<dyn TransportInstance>,
    framer: F,
    config: CodecConfig,
    custom_handler: Option<CustomMessageHandler<F::Message>>,
}

impl<F: Framer> MessageCodecBuilder<F> {
    pub fn config(mut self, config: CodecConfig) -> Self {
        self.config = config;
        self
    }

    pub fn custom_message_handler(
        mut self,
        handler: impl Fn(&F::Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.custom_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> MessageCodec<F> {
        let Self {
            transport,
            framer,
            config,
            custom_handler,
        } = self;
        let (default_tx, default_rx) = mpsc::channel(config.default_channel_capacity.max(1));
        let inner = Inner {
            io: tokio::sync::Mutex::new(Io {
                transport,
                framer,
                read_buffer: BytesMut::new(),
            }),
            expectations: Expectations::default(),
            running: AtomicBool::new(false),
            config,
            default_tx,
            default_rx: Mutex::new(Some(default_rx)),
            custom_handler,
        };
        MessageCodec {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }
}
