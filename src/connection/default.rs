// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec backed connection shared by protocol drivers

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    codec::{Framer, MessageCodec},
    model::{
        BrowseRequestBuilder, Browser, ReadRequestBuilder, Reader, SubscriptionRequestBuilder,
        Subscriber, UnsubscriptionRequestBuilder, WriteRequestBuilder, Writer,
    },
    trace::Tracer,
    Error, Result,
};

use super::{next_connection_id, CloseResult, Connection, ConnectionMetadata};

/// Protocol specific liveness check.
#[async_trait]
pub trait Pinger<F: Framer>: Send + Sync {
    async fn ping(&self, codec: &MessageCodec<F>) -> Result<()>;
}

/// A [`Connection`] that owns a [`MessageCodec`].
///
/// Without a [`Pinger`] a ping only checks that the codec is running
/// and the transport is connected.
pub struct DefaultConnection<F: Framer> {
    connection_id: String,
    codec: Arc<MessageCodec<F>>,
    tracer: Option<Tracer>,
    attributes: BTreeMap<String, String>,
    pinger: Option<Arc<dyn Pinger<F>>>,
    reader: Option<Arc<dyn Reader>>,
    writer: Option<Arc<dyn Writer>>,
    subscriber: Option<Arc<dyn Subscriber>>,
    browser: Option<Arc<dyn Browser>>,
}

impl<F: Framer> DefaultConnection<F> {
    pub fn builder(codec: Arc<MessageCodec<F>>) -> DefaultConnectionBuilder<F> {
        DefaultConnectionBuilder {
            connection_id: None,
            codec,
            tracing: false,
            attributes: BTreeMap::new(),
            pinger: None,
            reader: None,
            writer: None,
            subscriber: None,
            browser: None,
        }
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<MessageCodec<F>> {
        &self.codec
    }

    fn trace(&self, operation: &str, message: &str) {
        if let Some(tracer) = &self.tracer {
            tracer.add_trace(operation, message);
        }
    }

    fn trace_result(&self, operation: &str, result: &Result<()>) {
        match result {
            Ok(()) => self.trace(operation, "success"),
            Err(err) => self.trace(operation, &format!("error: {err}")),
        }
    }

    fn unsupported(&self, operation: &str) -> ! {
        panic!(
            "{operation} requests are not supported by connection {}",
            self.connection_id
        )
    }
}

#[async_trait]
impl<F: Framer> Connection for DefaultConnection<F> {
    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.trace("connect", "started");
        let result = self.codec.connect().await;
        self.trace_result("connect", &result);
        result
    }

    async fn close(&self) -> Result<CloseResult> {
        self.trace("close", "started");
        let result = self.codec.disconnect().await;
        self.trace_result("close", &result);
        result.map(|()| CloseResult::default())
    }

    fn is_connected(&self) -> bool {
        self.codec.is_running()
    }

    async fn ping(&self) -> Result<()> {
        self.trace("ping", "started");
        let result = if let Some(pinger) = &self.pinger {
            pinger.ping(&self.codec).await
        } else if self.codec.is_running() && self.codec.is_connected().await {
            Ok(())
        } else {
            Err(Error::NotConnected)
        };
        self.trace_result("ping", &result);
        result
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            attributes: self.attributes.clone(),
            can_read: self.reader.is_some(),
            can_write: self.writer.is_some(),
            can_subscribe: self.subscriber.is_some(),
            can_browse: self.browser.is_some(),
        }
    }

    fn tracer(&self) -> Option<Tracer> {
        self.tracer.clone()
    }

    fn read_request_builder(&self) -> ReadRequestBuilder {
        match &self.reader {
            Some(reader) => ReadRequestBuilder::new(Arc::clone(reader)),
            None => self.unsupported("read"),
        }
    }

    fn write_request_builder(&self) -> WriteRequestBuilder {
        match &self.writer {
            Some(writer) => WriteRequestBuilder::new(Arc::clone(writer)),
            None => self.unsupported("write"),
        }
    }

    fn subscription_request_builder(&self) -> SubscriptionRequestBuilder {
        match &self.subscriber {
            Some(subscriber) => SubscriptionRequestBuilder::new(Arc::clone(subscriber)),
            None => self.unsupported("subscription"),
        }
    }

    fn unsubscription_request_builder(&self) -> UnsubscriptionRequestBuilder {
        match &self.subscriber {
            Some(subscriber) => UnsubscriptionRequestBuilder::new(Arc::clone(subscriber)),
            None => self.unsupported("unsubscription"),
        }
    }

    fn browse_request_builder(&self) -> BrowseRequestBuilder {
        match &self.browser {
            Some(browser) => BrowseRequestBuilder::new(Arc::clone(browser)),
            None => self.unsupported("browse"),
        }
    }
}

impl<F: Framer> fmt::Debug for DefaultConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConnection")
            .field("connection_id", &self.connection_id)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

#[must_use]
pub struct DefaultConnectionBuilder<F: Framer> {
    connection_id: Option<String>,
    codec: Arc<MessageCodec<F>>,
    tracing: bool,
    attributes: BTreeMap<String, String>,
    pinger: Option<Arc<dyn Pinger<F>>>,
    reader: Option<Arc<dyn Reader>>,
    writer: Option<Arc<dyn Writer>>,
    subscriber: Option<Arc<dyn Subscriber>>,
    browser: Option<Arc<dyn Browser>>,
}

impl<F: Framer> DefaultConnectionBuilder<F> {
    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), description.into());
        self
    }

    pub fn pinger(mut self, pinger: impl Pinger<F> + 'static) -> Self {
        self.pinger = Some(Arc::new(pinger));
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn browser(mut self, browser: Arc<dyn Browser>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn build(self) -> DefaultConnection<F> {
        let connection_id = self.connection_id.unwrap_or_else(next_connection_id);
        let tracer = self
            .tracing
            .then(|| Tracer::new(connection_id.clone()));
        DefaultConnection {
            connection_id,
            codec: self.codec,
            tracer,
            attributes: self.attributes,
            pinger: self.pinger,
            reader: self.reader,
            writer: self.writer,
            subscriber: self.subscriber,
            browser: self.browser,
        }
    }
}
