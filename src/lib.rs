// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A pure [Rust](https://www.rust-lang.org) client library for
//! industrial controllers based on [tokio](https://tokio.rs).
//!
//! The library provides two building blocks for protocol drivers:
//!
//! - A [connection cache](cache) that hands out exclusive leases of
//!   shared connections, keyed by connection string. Connections are
//!   verified with a ping before they are reused and reconnected when
//!   they turn out to be broken.
//! - A [message codec](codec) that runs a receive loop per connection
//!   and correlates inbound messages with outstanding requests.
//!
//! Drivers are registered explicitly in a [`DriverManager`](driver::DriverManager).
//!
//! ## Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tokio-plc = "*"
//! ```
//!
//! ## Connection strings
//!
//! `<protocol>[:<transport>]://<address>[?<option>=<value>&...]`, e.g.
//! `simulated://1.2.3.4:42?traceEnabled=true`.

pub mod cache;
pub mod codec;
pub mod connection;
pub mod connection_string;
pub mod driver;
pub mod drivers;
pub mod model;
pub mod prelude;
pub mod trace;
pub mod transport;
pub mod value;

mod error;

pub use self::error::{Error, Result};
