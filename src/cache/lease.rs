// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Leased connections

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{runtime::Handle, time::Instant};

use crate::{
    connection::{CloseResult, Connection, ConnectionMetadata},
    model::{
        BrowseRequestBuilder, ReadRequestBuilder, SubscriptionRequestBuilder,
        UnsubscriptionRequestBuilder, WriteRequestBuilder,
    },
    trace::Tracer,
    Error, Result,
};

use super::{container::ConnectionContainer, state::ConnectionState};

/// Exclusive handle to a cached connection.
///
/// All operations are forwarded to the underlying connection until the
/// lease is closed. Closing verifies the connection with a ping and
/// returns it to the cache. Any further use of a closed lease panics.
///
/// A lease that is dropped without being closed is returned in the
/// background.
pub struct ConnectionLease {
    container: Arc<ConnectionContainer>,
    lease_id: u64,
    connection_id: String,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    issued_at: Instant,
    closing: AtomicBool,
}

impl ConnectionLease {
    pub(crate) fn new(
        container: Arc<ConnectionContainer>,
        lease_id: u64,
        connection: Arc<dyn Connection>,
    ) -> Self {
        let connection_id = format!("{}-{lease_id}", connection.connection_id());
        if let Some(tracer) = connection.tracer() {
            tracer.set_connection_id(connection_id.clone());
        }
        Self {
            container,
            lease_id,
            connection_id,
            connection: Mutex::new(Some(connection)),
            issued_at: Instant::now(),
            closing: AtomicBool::new(false),
        }
    }

    /// Sequence number of this lease within its cache entry.
    #[must_use]
    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    /// The connection string this lease was obtained for.
    #[must_use]
    pub fn key(&self) -> &str {
        self.container.key()
    }

    /// Whether the lease has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, operation: &str) -> Arc<dyn Connection> {
        match self.lock().as_ref() {
            Some(connection) => Arc::clone(connection),
            None => panic!("Called '{operation}' on a closed cached connection"),
        }
    }

    /// Clears the connection reference without returning it.
    pub(crate) fn detach(&self) -> Option<Arc<dyn Connection>> {
        self.lock().take()
    }

    /// Closes the lease from synchronous code.
    ///
    /// Must be called from within a multi-threaded Tokio runtime or from
    /// one of its blocking threads.
    #[cfg(feature = "sync")]
    pub fn blocking_close(&self) -> Result<CloseResult> {
        let handle = Handle::try_current()
            .map_err(|_| Error::Unsupported("blocking close outside of a Tokio runtime"))?;
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(Error::Unsupported(
                "blocking close on a current thread runtime",
            ));
        }
        tokio::task::block_in_place(|| handle.block_on(self.close()))
    }
}

/// Decides whether a returned connection can be reused.
async fn verify(connection: &dyn Connection, ping_timeout: Duration) -> ConnectionState {
    match tokio::time::timeout(ping_timeout, connection.ping()).await {
        Ok(Ok(())) => ConnectionState::Idle,
        Ok(Err(err)) => {
            log::warn!(
                "Ping of connection {} failed: {err}",
                connection.connection_id()
            );
            ConnectionState::Invalid
        }
        Err(_) => {
            if let Some(tracer) = connection.tracer() {
                tracer.add_trace("ping", "timeout");
            }
            log::warn!(
                "Ping of connection {} timed out after {ping_timeout:?}",
                connection.connection_id()
            );
            ConnectionState::Invalid
        }
    }
}

/// Removes the recorded traces and unstamps the lease id.
fn take_traces(connection: &dyn Connection) -> Vec<crate::trace::TraceEntry> {
    let Some(tracer) = connection.tracer() else {
        return Vec::new();
    };
    let traces = tracer.take_traces();
    tracer.set_connection_id(connection.connection_id());
    traces
}

#[async_trait]
impl Connection for ConnectionLease {
    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    /// Always fails, connecting is up to the cache.
    async fn connect(&self) -> Result<()> {
        Err(Error::Unsupported("connect on a cached connection"))
    }

    async fn close(&self) -> Result<CloseResult> {
        let connection = self.connection("close");
        if self.closing.swap(true, Ordering::AcqRel) {
            panic!("Called 'close' on a closed cached connection");
        }
        let config = self.container.config();
        let state = verify(connection.as_ref(), config.ping_timeout).await;
        let held = self.issued_at.elapsed();
        if held > config.max_lease_time {
            log::warn!(
                "Connection {} was leased for {held:?} (max. {:?})",
                self.connection_id,
                config.max_lease_time
            );
        }
        let traces = take_traces(connection.as_ref());
        self.container.return_connection(state);
        self.detach();
        Ok(CloseResult { traces })
    }

    fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    async fn ping(&self) -> Result<()> {
        self.connection("ping").ping().await
    }

    fn metadata(&self) -> ConnectionMetadata {
        self.connection("metadata").metadata()
    }

    fn tracer(&self) -> Option<Tracer> {
        self.lock().as_ref().and_then(|connection| connection.tracer())
    }

    fn read_request_builder(&self) -> ReadRequestBuilder {
        self.connection("read_request_builder").read_request_builder()
    }

    fn write_request_builder(&self) -> WriteRequestBuilder {
        self.connection("write_request_builder")
            .write_request_builder()
    }

    fn subscription_request_builder(&self) -> SubscriptionRequestBuilder {
        self.connection("subscription_request_builder")
            .subscription_request_builder()
    }

    fn unsubscription_request_builder(&self) -> UnsubscriptionRequestBuilder {
        self.connection("unsubscription_request_builder")
            .unsubscription_request_builder()
    }

    fn browse_request_builder(&self) -> BrowseRequestBuilder {
        self.connection("browse_request_builder")
            .browse_request_builder()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let Some(connection) = self.detach() else {
            return;
        };
        log::warn!(
            "Connection {} dropped without closing the lease",
            self.connection_id
        );
        let container = Arc::clone(&self.container);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let state = verify(connection.as_ref(), container.config().ping_timeout).await;
                    take_traces(connection.as_ref());
                    container.return_connection(state);
                });
            }
            Err(_) => {
                take_traces(connection.as_ref());
                container.return_connection(ConnectionState::Idle);
            }
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use crate::{
        cache::{config::CacheConfig, container::ConnectMode},
        driver::DriverManager,
        drivers::simulated::SimulatedDriver,
        trace::TraceEntry,
    };

    use super::*;

    async fn lease(options: &str, config: CacheConfig) -> (Arc<ConnectionContainer>, ConnectionLease) {
        let mut driver_manager = DriverManager::new();
        driver_manager.register_driver(Arc::new(SimulatedDriver::new()));
        let container = Arc::new(ConnectionContainer::new(
            format!("simulated://1.2.3.4:42?traceEnabled=true{options}"),
            Arc::new(driver_manager),
            config,
        ));
        let pending = container.lease();
        container.spawn_connect(ConnectMode::Initial);
        let lease = pending.await.unwrap().unwrap();
        (container, lease)
    }

    fn labels(traces: &[TraceEntry]) -> Vec<String> {
        traces.iter().map(TraceEntry::label).collect()
    }

    #[tokio::test]
    async fn close_returns_connection_traces() {
        let (container, lease) = lease("", CacheConfig::default()).await;
        assert!(lease.is_connected());
        assert!(lease.connection_id().ends_with("-1"));
        assert!(lease.connect().await.is_err());

        let result = lease.close().await.unwrap();
        assert_eq!(
            labels(&result.traces),
            [
                "connect-started",
                "connect-success",
                "ping-started",
                "ping-success"
            ]
        );
        // Stamped with the lease once it has been issued.
        assert!(!result.traces[0].connection_id.ends_with("-1"));
        assert!(result.traces[2].connection_id.ends_with("-1"));
        assert!(lease.is_closed());
        assert!(!lease.is_connected());
        assert_eq!(container.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    #[should_panic(expected = "Called 'ping' on a closed cached connection")]
    async fn closed_lease_panics() {
        let (_container, lease) = lease("", CacheConfig::default()).await;
        lease.close().await.unwrap();
        let _ = lease.ping().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timeout_invalidates_connection() {
        let config = CacheConfig::default()
            .with_ping_timeout(Duration::from_millis(100))
            .with_reconnect(crate::cache::config::ReconnectPolicy::no_retry());
        let (container, lease) = lease("&pingDelay=1000", config).await;

        let result = lease.close().await.unwrap();
        let labels = labels(&result.traces);
        assert_eq!(labels.last().map(String::as_str), Some("ping-timeout"));
        assert_ne!(container.state(), ConnectionState::Idle);

        // The reconnect serves the next lease.
        let next = container.lease().await.unwrap().unwrap();
        assert_eq!(next.lease_id(), 2);
        next.detach();
    }

    #[tokio::test]
    async fn dropped_lease_is_returned() {
        let (container, lease) = lease("", CacheConfig::default()).await;
        drop(lease);
        let next = container.lease().await.unwrap().unwrap();
        assert_eq!(next.lease_id(), 2);
        next.detach();
    }
}
