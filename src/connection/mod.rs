// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connections

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::{
    model::{
        BrowseRequestBuilder, ReadRequestBuilder, SubscriptionRequestBuilder,
        UnsubscriptionRequestBuilder, WriteRequestBuilder,
    },
    trace::{TraceEntry, Tracer},
    Result,
};

pub mod default;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A process wide unique connection id.
pub(crate) fn next_connection_id() -> String {
    format!("{:08x}", NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Capabilities of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Driver specific, human readable attributes.
    pub attributes: BTreeMap<String, String>,
    pub can_read: bool,
    pub can_write: bool,
    pub can_subscribe: bool,
    pub can_browse: bool,
}

/// Outcome of closing a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseResult {
    /// Traces recorded on the connection while it was in use.
    pub traces: Vec<TraceEntry>,
}

/// Transport and protocol independent connection trait
///
/// The request builders panic if the driver doesn't implement the
/// corresponding operation. Check [`ConnectionMetadata`] first.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    fn connection_id(&self) -> String;

    async fn connect(&self) -> Result<()>;

    /// Closes the connection.
    async fn close(&self) -> Result<CloseResult>;

    fn is_connected(&self) -> bool;

    /// Checks that the remote side is still responsive.
    async fn ping(&self) -> Result<()>;

    fn metadata(&self) -> ConnectionMetadata;

    fn tracer(&self) -> Option<Tracer> {
        None
    }

    fn read_request_builder(&self) -> ReadRequestBuilder;

    fn write_request_builder(&self) -> WriteRequestBuilder;

    fn subscription_request_builder(&self) -> SubscriptionRequestBuilder;

    fn unsubscription_request_builder(&self) -> UnsubscriptionRequestBuilder;

    fn browse_request_builder(&self) -> BrowseRequestBuilder;
}
