// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lightweight operation traces for connections and the connection cache.
//!
//! Traces are an observability aid. Nothing in this crate makes control
//! decisions based on them.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::SystemTime,
};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A single recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub timestamp: SystemTime,
    pub connection_id: String,
    pub transaction_id: Option<String>,
    pub operation: String,
    pub message: String,
}

impl TraceEntry {
    /// `"<operation>-<message>"`, e.g. `"connect-success"`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{}", self.operation, self.message)
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transaction_id {
            Some(transaction_id) => write!(
                f,
                "[{}/{}] {}",
                self.connection_id,
                transaction_id,
                self.label()
            ),
            None => write!(f, "[{}] {}", self.connection_id, self.label()),
        }
    }
}

#[derive(Debug, Default)]
struct TracerState {
    connection_id: String,
    traces: Vec<TraceEntry>,
}

/// Append-only trace recorder.
///
/// Cloning a tracer yields another handle to the same trace log.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    state: Arc<Mutex<TracerState>>,
}

impl Tracer {
    #[must_use]
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TracerState {
                connection_id: connection_id.into(),
                traces: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn connection_id(&self) -> String {
        self.lock().connection_id.clone()
    }

    /// Stamps all subsequent entries with `connection_id`.
    pub fn set_connection_id(&self, connection_id: impl Into<String>) {
        self.lock().connection_id = connection_id.into();
    }

    pub fn add_trace(&self, operation: impl Into<String>, message: impl Into<String>) {
        self.push(None, operation.into(), message.into());
    }

    /// Records the first entry of a transaction and returns its id.
    pub fn add_transactional_start_trace(
        &self,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> String {
        let transaction_id = format!(
            "{:08x}",
            NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
        );
        self.push(
            Some(transaction_id.clone()),
            operation.into(),
            message.into(),
        );
        transaction_id
    }

    pub fn add_transactional_trace(
        &self,
        transaction_id: &str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(
            Some(transaction_id.to_owned()),
            operation.into(),
            message.into(),
        );
    }

    /// A snapshot of all recorded entries in insertion order.
    #[must_use]
    pub fn traces(&self) -> Vec<TraceEntry> {
        self.lock().traces.clone()
    }

    pub fn reset_traces(&self) {
        self.lock().traces.clear();
    }

    /// Removes and returns all recorded entries.
    pub fn take_traces(&self) -> Vec<TraceEntry> {
        std::mem::take(&mut self.lock().traces)
    }

    fn push(&self, transaction_id: Option<String>, operation: String, message: String) {
        let mut state = self.lock();
        let entry = TraceEntry {
            timestamp: SystemTime::now(),
            connection_id: state.connection_id.clone(),
            transaction_id,
            operation,
            message,
        };
        log::trace!("{entry}");
        state.traces.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_entries_in_order() {
        let tracer = Tracer::new("cache");
        tracer.add_trace("connect", "started");
        tracer.add_trace("connect", "success");

        let labels: Vec<_> = tracer.traces().iter().map(TraceEntry::label).collect();
        assert_eq!(labels, ["connect-started", "connect-success"]);
    }

    #[test]
    fn transactional_entries_share_the_transaction_id() {
        let tracer = Tracer::new("cache");
        let tx_id = tracer.add_transactional_start_trace("get-connection", "lease");
        tracer.add_transactional_trace(&tx_id, "get-connection", "success");
        let other = tracer.add_transactional_start_trace("get-connection", "lease");
        assert_ne!(tx_id, other);

        let traces = tracer.traces();
        assert_eq!(traces[0].transaction_id.as_deref(), Some(tx_id.as_str()));
        assert_eq!(traces[1].transaction_id.as_deref(), Some(tx_id.as_str()));
        assert_eq!(traces[1].message, "success");
    }

    #[test]
    fn connection_id_is_stamped_on_new_entries_only() {
        let tracer = Tracer::new("conn");
        tracer.add_trace("ping", "started");
        tracer.set_connection_id("conn-1");
        tracer.add_trace("ping", "success");

        let traces = tracer.take_traces();
        assert_eq!(traces[0].connection_id, "conn");
        assert_eq!(traces[1].connection_id, "conn-1");
        assert!(tracer.traces().is_empty());
    }

    #[test]
    fn clones_share_the_log() {
        let tracer = Tracer::new("conn");
        let handle = tracer.clone();
        handle.add_trace("read", "started");
        assert_eq!(tracer.traces().len(), 1);
        tracer.reset_traces();
        assert!(handle.traces().is_empty());
    }
}
