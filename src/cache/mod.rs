// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection cache
//!
//! The [`ConnectionCache`] keeps one connection per connection string
//! and hands it out as an exclusive [`ConnectionLease`]. Concurrent
//! requests for the same connection string are queued and served in
//! order. Requests for different connection strings never wait for
//! each other.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tokio_plc::prelude::*;
//!
//! # async fn run(driver_manager: Arc<DriverManager>) -> tokio_plc::Result<()> {
//! let cache = ConnectionCache::new(driver_manager);
//! let connection = cache.get_connection("simulated://1.2.3.4:42").await?;
//! let response = connection
//!     .read_request_builder()
//!     .add_tag_address("counter", "STATE/counter:DINT")
//!     .build()?
//!     .execute()
//!     .await?;
//! println!("{:?}", response.value("counter"));
//! connection.close().await?;
//! cache.close().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::sync::oneshot;

use crate::{connection::Connection as _, driver::DriverManager, trace::Tracer, Error, Result};

pub mod config;
mod container;
mod lease;
pub mod state;

pub use self::{
    config::{BackoffStrategy, CacheConfig, ReconnectPolicy},
    lease::ConnectionLease,
    state::{ConnectionEvent, ConnectionState},
};

use self::{
    container::{ConnectMode, ConnectionContainer, LeaseReceiver},
    state::ConnectionListener,
};

struct CacheInner {
    driver_manager: Arc<DriverManager>,
    config: CacheConfig,
    containers: Mutex<HashMap<String, Arc<ConnectionContainer>>>,
    tracer: Option<Tracer>,
    closed: AtomicBool,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionContainer>>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn trace(&self, transaction_id: Option<&str>, operation: &str, message: &str) {
        let Some(tracer) = &self.tracer else {
            return;
        };
        match transaction_id {
            Some(transaction_id) => tracer.add_transactional_trace(transaction_id, operation, message),
            None => tracer.add_trace(operation, message),
        }
    }
}

impl ConnectionListener for CacheInner {
    fn on_event(&self, event: &ConnectionEvent, source: &ConnectionContainer) {
        match event {
            ConnectionEvent::Error { key, error } => {
                self.trace(None, "destroy-connection", &error.to_string());
                let mut containers = self.lock();
                // A replacement for the same key must survive.
                if containers
                    .get(key)
                    .is_some_and(|container| std::ptr::eq(Arc::as_ptr(container), source))
                {
                    log::debug!("Removing connection {key} from the cache: {error}");
                    containers.remove(key);
                }
            }
        }
    }
}

/// Pool of shared connections, keyed by connection string.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl ConnectionCache {
    #[must_use]
    pub fn new(driver_manager: Arc<DriverManager>) -> Self {
        Self::with_config(driver_manager, CacheConfig::default())
    }

    /// The maximum wait time is derived from `max_lease_time`.
    #[must_use]
    pub fn with_max_lease_time(driver_manager: Arc<DriverManager>, max_lease_time: Duration) -> Self {
        Self::with_config(
            driver_manager,
            CacheConfig::with_max_lease_time(max_lease_time),
        )
    }

    #[must_use]
    pub fn with_config(driver_manager: Arc<DriverManager>, config: CacheConfig) -> Self {
        let tracer = config.tracing.then(|| Tracer::new("cache"));
        Self {
            inner: Arc::new(CacheInner {
                driver_manager,
                config,
                containers: Mutex::new(HashMap::new()),
                tracer,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The cache tracer, if tracing is enabled.
    #[must_use]
    pub fn tracer(&self) -> Option<&Tracer> {
        self.inner.tracer.as_ref()
    }

    /// Number of cached connection strings.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// State of the cached connection for `key`.
    #[must_use]
    pub fn connection_state(&self, key: &str) -> Option<ConnectionState> {
        let container = self.inner.lock().get(key).cloned();
        container.map(|container| container.state())
    }

    /// Requests a lease for the connection identified by `key`.
    ///
    /// The first request for a connection string establishes the
    /// connection in the background. The returned future resolves once
    /// the connection is available, fails if connecting fails, and times
    /// out after [`CacheConfig::max_wait_time`].
    ///
    /// A granted lease is closed again if the returned future is not
    /// polled within [`CacheConfig::grant_timeout`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_connection(&self, key: impl Into<String>) -> PendingConnection {
        let (demand_tx, demand_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let pending = PendingConnection {
            demand: Some(demand_tx),
            result: result_rx,
        };
        if self.inner.closed.load(Ordering::Acquire) {
            let _ = result_tx.send(Err(Error::CacheClosed));
            return pending;
        }
        let key = key.into();
        let container = {
            let mut containers = self.inner.lock();
            if let Some(container) = containers.get(&key) {
                Arc::clone(container)
            } else {
                self.inner
                    .trace(None, "get-connection", "create new cached connection");
                log::debug!("Creating new cached connection for {key}");
                let container = Arc::new(ConnectionContainer::new(
                    key.clone(),
                    Arc::clone(&self.inner.driver_manager),
                    self.inner.config.clone(),
                ));
                let listener: Arc<dyn ConnectionListener> = Arc::clone(&self.inner) as _;
                container.add_listener(Arc::downgrade(&listener));
                containers.insert(key, Arc::clone(&container));
                container.spawn_connect(ConnectMode::Initial);
                container
            }
        };
        let transaction_id = self
            .inner
            .tracer
            .as_ref()
            .map(|tracer| tracer.add_transactional_start_trace("get-connection", "lease"));
        let lease = container.lease();
        tokio::spawn(deliver(
            Arc::clone(&self.inner),
            transaction_id,
            lease,
            demand_rx,
            result_tx,
        ));
        pending
    }

    /// Closes all cached connections.
    ///
    /// Connections that are currently leased are closed once they are
    /// returned, or forcefully after [`CacheConfig::max_wait_time`].
    /// Subsequent requests fail with [`Error::CacheClosed`].
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let containers: Vec<_> = self
            .inner
            .lock()
            .drain()
            .map(|(_, container)| container)
            .collect();
        log::debug!("Closing {} cached connection(s)", containers.len());
        let results = join_all(containers.iter().map(|container| container.shutdown())).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("config", &self.inner.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// Hands a granted lease to the caller.
async fn deliver(
    inner: Arc<CacheInner>,
    transaction_id: Option<String>,
    lease: LeaseReceiver,
    demand: oneshot::Receiver<()>,
    mut result_tx: oneshot::Sender<Result<ConnectionLease>>,
) {
    let trace = |message: &str| inner.trace(transaction_id.as_deref(), "get-connection", message);
    let max_wait_time = inner.config.max_wait_time;
    let outcome = tokio::select! {
        outcome = tokio::time::timeout(max_wait_time, lease) => outcome,
        () = result_tx.closed() => {
            trace("client given up");
            return;
        }
    };
    let lease = match outcome {
        Ok(Ok(Ok(lease))) => lease,
        Ok(Ok(Err(err))) => {
            trace("failed");
            let _ = result_tx.send(Err(err));
            return;
        }
        Ok(Err(_)) => {
            let _ = result_tx.send(Err(Error::Canceled));
            return;
        }
        Err(_) => {
            trace("timeout");
            let _ = result_tx.send(Err(Error::Timeout {
                operation: "connection",
                elapsed: max_wait_time,
            }));
            return;
        }
    };
    let grant_timeout = inner.config.grant_timeout;
    if tokio::time::timeout(grant_timeout, demand).await.is_err() {
        trace("client given up");
        give_back(lease).await;
        let _ = result_tx.send(Err(Error::Timeout {
            operation: "lease pickup",
            elapsed: grant_timeout,
        }));
        return;
    }
    match result_tx.send(Ok(lease)) {
        Ok(()) => trace("success"),
        Err(lease) => {
            trace("client given up");
            if let Ok(lease) = lease {
                give_back(lease).await;
            }
        }
    }
}

async fn give_back(lease: ConnectionLease) {
    if let Err(err) = lease.close().await {
        log::warn!("Returning abandoned lease {} failed: {err}", lease.lease_id());
    }
}

/// A pending lease request, see [`ConnectionCache::get_connection`].
#[must_use = "a granted lease is returned if the request is not awaited"]
#[derive(Debug)]
pub struct PendingConnection {
    demand: Option<oneshot::Sender<()>>,
    result: oneshot::Receiver<Result<ConnectionLease>>,
}

impl Future for PendingConnection {
    type Output = Result<ConnectionLease>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(demand) = self.demand.take() {
            let _ = demand.send(());
        }
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(Error::Canceled)))
    }
}
