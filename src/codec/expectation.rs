// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outstanding expectations of a message codec

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{Error, Result};

pub type AcceptsMessage<M> = Box<dyn Fn(&M) -> bool + Send>;
pub type HandleMessage<M> = Box<dyn FnOnce(&M) -> Result<()> + Send>;
pub type HandleError = Box<dyn FnOnce(Error) -> Result<()> + Send>;

/// A pending request waiting for a matching inbound message.
pub(crate) struct Expectation<M> {
    ttl: Duration,
    expires_at: Instant,
    accepts: AcceptsMessage<M>,
    on_message: HandleMessage<M>,
    on_error: HandleError,
}

impl<M> Expectation<M> {
    pub(crate) fn new(
        ttl: Duration,
        accepts: AcceptsMessage<M>,
        on_message: HandleMessage<M>,
        on_error: HandleError,
    ) -> Self {
        Self {
            ttl,
            expires_at: Instant::now() + ttl,
            accepts,
            on_message,
            on_error,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Returns `true` if the message has been handled successfully.
    fn handle(self, message: &M) -> bool {
        let Self {
            on_message,
            on_error,
            ..
        } = self;
        match guarded("message handler", || on_message(message)).and_then(|result| result) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("Expectation failed to handle message: {err}");
                report(on_error, err);
                false
            }
        }
    }

    fn expire(self) {
        let err = Error::Timeout {
            operation: "response",
            elapsed: self.ttl,
        };
        report(self.on_error, err);
    }
}

impl<M> fmt::Debug for Expectation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("ttl", &self.ttl)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn report(on_error: HandleError, err: Error) {
    if let Err(err) = guarded("error handler", || on_error(err)).and_then(|result| result) {
        log::error!("Error handler of expectation failed: {err}");
    }
}

/// Runs a callback of an expectation, turning a panic into an error.
fn guarded<T>(callback: &str, f: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let message = super::panic_message(panic.as_ref());
        log::error!("Expectation {callback} panicked: {message}");
        Error::Protocol(format!("expectation {callback} panicked: {message}"))
    })
}

/// Expectations in registration order.
#[derive(Debug)]
pub(crate) struct Expectations<M> {
    pending: Mutex<Vec<Expectation<M>>>,
}

impl<M> Default for Expectations<M> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl<M> Expectations<M> {
    fn lock(&self) -> MutexGuard<'_, Vec<Expectation<M>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, expectation: Expectation<M>) {
        self.lock().push(expectation);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes all expectations that are expired at `now` and reports a
    /// timeout to each of them.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut pending = self.lock();
            let (expired, remaining) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|expectation| expectation.is_expired(now));
            *pending = remaining;
            expired
        };
        let count = expired.len();
        if count > 0 {
            log::debug!("{count} expectation(s) timed out");
        }
        for expectation in expired {
            expectation.expire();
        }
        count
    }

    /// Offers `message` to the expectations in registration order.
    ///
    /// An accepting expectation is removed whether or not it handles the
    /// message successfully. Matching stops at the first success. An
    /// expectation whose predicate panics is removed and gets a protocol
    /// error, all others stay registered.
    pub(crate) fn handle(&self, message: &M) -> bool {
        let snapshot = std::mem::take(&mut *self.lock());
        let mut remaining = Vec::with_capacity(snapshot.len());
        let mut handled = false;
        for expectation in snapshot {
            if handled {
                remaining.push(expectation);
                continue;
            }
            match guarded("predicate", || (expectation.accepts)(message)) {
                Ok(false) => remaining.push(expectation),
                Ok(true) => handled = expectation.handle(message),
                Err(err) => report(expectation.on_error, err),
            }
        }
        let mut pending = self.lock();
        let registered_meanwhile = std::mem::replace(&mut *pending, remaining);
        pending.extend(registered_meanwhile);
        handled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn expectation(log: &Log, name: &'static str, accepts: u8, fail: bool) -> Expectation<u8> {
        let on_message_log = Arc::clone(log);
        let on_error_log = Arc::clone(log);
        Expectation::new(
            Duration::from_millis(100),
            Box::new(move |m| *m == accepts),
            Box::new(move |m| {
                on_message_log
                    .lock()
                    .unwrap()
                    .push(format!("{name}: message {m}"));
                if fail {
                    Err(Error::Protocol("rejected".to_owned()))
                } else {
                    Ok(())
                }
            }),
            Box::new(move |err| {
                on_error_log
                    .lock()
                    .unwrap()
                    .push(format!("{name}: error {err}"));
                Ok(())
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn first_accepting_expectation_wins() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(expectation(&log, "a", 1, false));
        expectations.register(expectation(&log, "b", 1, false));
        expectations.register(expectation(&log, "c", 2, false));

        assert!(expectations.handle(&1));
        assert_eq!(expectations.len(), 2);
        assert_eq!(*log.lock().unwrap(), ["a: message 1"]);

        assert!(expectations.handle(&1));
        assert!(!expectations.handle(&1));
        assert_eq!(expectations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_reports_error_and_matching_continues() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(expectation(&log, "a", 1, true));
        expectations.register(expectation(&log, "b", 1, false));

        assert!(expectations.handle(&1));
        assert!(expectations.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            [
                "a: message 1",
                "a: error protocol error: rejected",
                "b: message 1"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_without_further_match_is_not_handled() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(expectation(&log, "a", 1, true));

        assert!(!expectations.handle(&1));
        assert!(expectations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_reports_timeouts() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(expectation(&log, "a", 1, false));

        assert_eq!(expectations.expire(Instant::now()), 0);
        assert_eq!(
            expectations.expire(Instant::now() + Duration::from_millis(200)),
            1
        );
        assert!(expectations.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            ["a: error timeout while waiting for response after 100ms"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_predicate_keeps_other_expectations() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(expectation(&log, "a", 2, false));
        let on_error_log = Arc::clone(&log);
        expectations.register(Expectation::new(
            Duration::from_millis(100),
            Box::new(|m: &u8| if *m == 1 { panic!("bad predicate") } else { false }),
            Box::new(|_| Ok(())),
            Box::new(move |err| {
                on_error_log.lock().unwrap().push(format!("p: error {err}"));
                Ok(())
            }),
        ));
        expectations.register(expectation(&log, "c", 1, false));

        assert!(expectations.handle(&1));
        assert_eq!(expectations.len(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            [
                "p: error protocol error: expectation predicate panicked: bad predicate",
                "c: message 1"
            ]
        );

        assert!(expectations.handle(&2));
        assert!(expectations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_message_handler_reports_error() {
        let log = Log::default();
        let expectations = Expectations::default();
        let on_error_log = Arc::clone(&log);
        expectations.register(Expectation::new(
            Duration::from_millis(100),
            Box::new(|m: &u8| *m == 1),
            Box::new(|_| panic!("bad handler")),
            Box::new(move |err| {
                on_error_log.lock().unwrap().push(format!("p: error {err}"));
                Ok(())
            }),
        ));
        expectations.register(expectation(&log, "b", 1, false));

        assert!(expectations.handle(&1));
        assert!(expectations.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            [
                "p: error protocol error: expectation message handler panicked: bad handler",
                "b: message 1"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_error_handler_does_not_stop_expiry() {
        let log = Log::default();
        let expectations = Expectations::default();
        expectations.register(Expectation::new(
            Duration::from_millis(100),
            Box::new(|m: &u8| *m == 1),
            Box::new(|_| Ok(())),
            Box::new(|_| panic!("bad error handler")),
        ));
        expectations.register(expectation(&log, "b", 2, false));

        assert_eq!(
            expectations.expire(Instant::now() + Duration::from_millis(200)),
            2
        );
        assert_eq!(
            *log.lock().unwrap(),
            ["b: error timeout while waiting for response after 100ms"]
        );
    }
}
