// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pool slot owning one connection per connection string

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::{runtime::Handle, sync::oneshot};

use crate::{connection::Connection, driver::DriverManager, Error, Result};

use super::{
    config::CacheConfig,
    lease::ConnectionLease,
    state::{ConnectionEvent, ConnectionListener, ConnectionState},
};

type LeaseSender = oneshot::Sender<Result<ConnectionLease>>;
pub(crate) type LeaseReceiver = oneshot::Receiver<Result<ConnectionLease>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Initial,
    Reconnect,
}

#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn Connection>>,
    state: ConnectionState,
    lease_counter: u64,
    closed: bool,
    /// Set once connecting failed for good.
    failure: Option<Error>,
    queue: VecDeque<LeaseSender>,
    listeners: Vec<Weak<dyn ConnectionListener>>,
}

/// Owns the connection for one connection string and arbitrates leases.
///
/// All state transitions happen while holding the slot lock. Leases are
/// delivered and listeners are notified after the lock is released.
pub(crate) struct ConnectionContainer {
    key: String,
    driver_manager: Arc<DriverManager>,
    config: CacheConfig,
    slot: Mutex<Slot>,
}

impl ConnectionContainer {
    pub(crate) fn new(key: String, driver_manager: Arc<DriverManager>, config: CacheConfig) -> Self {
        Self {
            key,
            driver_manager,
            config,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn lease_count(&self) -> u64 {
        self.lock().lease_counter
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub(crate) fn add_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.lock().listeners.push(listener);
    }

    pub(crate) fn spawn_connect(self: &Arc<Self>, mode: ConnectMode) {
        spawn(Arc::clone(self).connect(mode));
    }

    async fn connect(self: Arc<Self>, mode: ConnectMode) {
        log::debug!("Connecting {} ({mode:?})", self.key);
        let mut attempt = 0;
        let result = loop {
            match self.connect_once().await {
                Ok(connection) => break Ok(connection),
                Err(err)
                    if mode == ConnectMode::Reconnect
                        && self.config.reconnect.should_retry(attempt)
                        && !self.is_closed() =>
                {
                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    log::warn!("Reconnecting {} failed: {err}, retrying in {delay:?}", self.key);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };
        match result {
            Ok(connection) => self.connected(Arc::from(connection)),
            Err(err) => self.failed(err),
        }
    }

    async fn connect_once(&self) -> Result<Box<dyn Connection>> {
        let connect_timeout = self.config.connect_timeout();
        tokio::time::timeout(
            connect_timeout,
            self.driver_manager.get_connection(&self.key),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "connect",
            elapsed: connect_timeout,
        })?
    }

    fn connected(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        log::debug!(
            "Connected {} (connection {})",
            self.key,
            connection.connection_id()
        );
        let grant = {
            let mut slot = self.lock();
            if slot.closed {
                let waiters: Vec<_> = slot.queue.drain(..).collect();
                drop(slot);
                log::debug!("Cache closed while connecting {}", self.key);
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::CacheClosed));
                }
                spawn(async move {
                    if let Err(err) = connection.close().await {
                        log::debug!("Closing connection failed: {err}");
                    }
                });
                return;
            }
            slot.connection = Some(connection);
            slot.failure = None;
            slot.state = ConnectionState::Idle;
            self.next_grant(&mut slot)
        };
        self.deliver(grant);
    }

    fn failed(self: &Arc<Self>, err: Error) {
        log::warn!("Connecting {} failed: {err}", self.key);
        let listeners: Vec<_> = {
            let mut slot = self.lock();
            slot.state = ConnectionState::Invalid;
            slot.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        let event = ConnectionEvent::Error {
            key: self.key.clone(),
            error: err.clone(),
        };
        // The cache forgets the key before any waiter sees the error.
        for listener in listeners {
            listener.on_event(&event, self);
        }
        let waiters: Vec<_> = {
            let mut slot = self.lock();
            slot.failure = Some(err.clone());
            slot.queue.drain(..).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Requests a lease.
    ///
    /// An idle connection is leased immediately. Otherwise the request
    /// is queued and served in FIFO order.
    pub(crate) fn lease(self: &Arc<Self>) -> LeaseReceiver {
        self.request_lease(false)
    }

    fn request_lease(self: &Arc<Self>, ignore_closed: bool) -> LeaseReceiver {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.lock();
        if slot.closed && !ignore_closed {
            drop(slot);
            let _ = tx.send(Err(Error::CacheClosed));
            return rx;
        }
        if let Some(err) = &slot.failure {
            let err = err.clone();
            drop(slot);
            let _ = tx.send(Err(err));
            return rx;
        }
        match (slot.state, slot.connection.clone()) {
            (ConnectionState::Idle, Some(connection)) => {
                let lease = self.issue_lease(&mut slot, connection);
                drop(slot);
                // The receiver is still alive.
                let _ = tx.send(Ok(lease));
            }
            _ => {
                // Callers that timed out or went away.
                slot.queue.retain(|waiter| !waiter.is_closed());
                log::debug!(
                    "Queueing lease request for {} ({} waiting, {})",
                    self.key,
                    slot.queue.len(),
                    slot.state
                );
                slot.queue.push_back(tx);
            }
        }
        rx
    }

    fn issue_lease(
        self: &Arc<Self>,
        slot: &mut Slot,
        connection: Arc<dyn Connection>,
    ) -> ConnectionLease {
        slot.lease_counter += 1;
        slot.state = ConnectionState::InUse;
        log::debug!("Issuing lease {} for {}", slot.lease_counter, self.key);
        ConnectionLease::new(Arc::clone(self), slot.lease_counter, connection)
    }

    /// Leases the connection to the first waiter that is still interested
    /// or marks it idle.
    fn next_grant(self: &Arc<Self>, slot: &mut Slot) -> Option<(LeaseSender, ConnectionLease)> {
        let connection = slot.connection.clone()?;
        while let Some(waiter) = slot.queue.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let lease = self.issue_lease(slot, connection);
            return Some((waiter, lease));
        }
        slot.state = ConnectionState::Idle;
        None
    }

    fn deliver(self: &Arc<Self>, grant: Option<(LeaseSender, ConnectionLease)>) {
        let Some((waiter, lease)) = grant else {
            return;
        };
        if let Err(Ok(lease)) = waiter.send(Ok(lease)) {
            log::debug!(
                "Waiter for {} went away, taking back lease {}",
                self.key,
                lease.lease_id()
            );
            lease.detach();
            self.return_connection(ConnectionState::Idle);
        }
    }

    /// Takes back the connection of a closed lease.
    ///
    /// An invalid connection is replaced by a new one before the next
    /// waiter is served.
    pub(crate) fn return_connection(self: &Arc<Self>, state: ConnectionState) {
        let mut slot = self.lock();
        if state == ConnectionState::Invalid {
            if let Some(stale) = slot.connection.take() {
                spawn(async move {
                    if let Err(err) = stale.close().await {
                        log::debug!("Closing stale connection failed: {err}");
                    }
                });
            }
            if slot.closed {
                slot.state = ConnectionState::Invalid;
                let waiters: Vec<_> = slot.queue.drain(..).collect();
                drop(slot);
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::CacheClosed));
                }
                return;
            }
            log::debug!("Connection {} is invalid, reconnecting", self.key);
            slot.state = ConnectionState::Initialized;
            drop(slot);
            self.spawn_connect(ConnectMode::Reconnect);
            return;
        }
        let grant = self.next_grant(&mut slot);
        drop(slot);
        self.deliver(grant);
    }

    /// Closes the connection after the current lease (if any) has been
    /// returned, or forcefully after the maximum wait time.
    pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.lock().closed = true;
        let max_wait_time = self.config.max_wait_time;
        match tokio::time::timeout(max_wait_time, self.request_lease(true)).await {
            Ok(Ok(Ok(lease))) => {
                lease.detach();
            }
            Ok(Ok(Err(err))) => log::debug!("No lease for closing {}: {err}", self.key),
            Ok(Err(_)) => log::debug!("Lease request for closing {} dropped", self.key),
            Err(_) => log::warn!(
                "No lease for closing {} within {max_wait_time:?}, closing anyway",
                self.key
            ),
        }
        let (connection, waiters) = {
            let mut slot = self.lock();
            slot.state = ConnectionState::Invalid;
            let waiters: Vec<_> = slot.queue.drain(..).collect();
            (slot.connection.take(), waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::CacheClosed));
        }
        match connection {
            Some(connection) => connection.close().await.map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Spawns onto the current runtime, if any.
fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => log::error!("No Tokio runtime available for connection cache task"),
    }
}
