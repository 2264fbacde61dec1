// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simulated driver
//!
//! Connection strings look like `simulated://<device>?<options>`. The
//! device is kept in memory and shared by all connections to the same
//! address. Options:
//!
//! | Option            | Meaning                                         |
//! |-------------------|-------------------------------------------------|
//! | `connectionDelay` | Delay applied when connecting (ms)              |
//! | `connectionError` | Connecting fails with this message              |
//! | `closingDelay`    | Delay applied when closing the connection (ms)  |
//! | `pingDelay`       | Delay applied when executing a ping (ms)        |
//! | `pingError`       | Pinging fails with this message                 |
//! | `readDelay`       | Delay applied when executing a read (ms)        |
//! | `writeDelay`      | Delay applied when executing a write (ms)       |
//! | `traceEnabled`    | Record traces (`true`/`false`)                  |

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    connection::{next_connection_id, CloseResult, Connection, ConnectionMetadata},
    connection_string::{ConnectionOptions, TransportUrl},
    driver::Driver,
    model::{
        BrowseRequestBuilder, ReadRequest, ReadRequestBuilder, ReadResponse, ReadResult, Reader,
        SubscriptionRequestBuilder, UnsubscriptionRequestBuilder, WriteRequest,
        WriteRequestBuilder, WriteResponse, Writer,
    },
    trace::Tracer,
    transport::TransportRegistry,
    value::{PlcValue, ResponseCode},
    Error, Result,
};

mod device;

pub use self::device::{Device, SimulatedTag, TagKind};

/// Driver for in-memory devices, see the [module docs](self).
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    devices: Mutex<HashMap<String, Arc<Device>>>,
}

impl SimulatedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The device behind `address`, created on first use.
    pub fn device(&self, address: &str) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            devices
                .entry(address.to_owned())
                .or_insert_with(|| Arc::new(Device::new(address))),
        )
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    fn protocol_code(&self) -> &str {
        "simulated"
    }

    fn protocol_name(&self) -> &str {
        "Simulated PLC4X Datasource"
    }

    async fn get_connection(
        &self,
        transport_url: &TransportUrl,
        _transports: &TransportRegistry,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Connection>> {
        let settings = Settings::from_options(options)?;
        let device = self.device(&transport_url.address);
        let connection = SimulatedConnection::new(device, settings);
        connection.connect().await?;
        Ok(Box::new(connection))
    }
}

#[derive(Debug, Clone, Default)]
struct Settings {
    connection_delay: Option<Duration>,
    connection_error: Option<String>,
    closing_delay: Option<Duration>,
    ping_delay: Option<Duration>,
    ping_error: Option<String>,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    trace_enabled: bool,
}

impl Settings {
    fn from_options(options: &ConnectionOptions) -> Result<Self> {
        Ok(Self {
            connection_delay: options.get_millis("connectionDelay")?,
            connection_error: options.get("connectionError").map(ToOwned::to_owned),
            closing_delay: options.get_millis("closingDelay")?,
            ping_delay: options.get_millis("pingDelay")?,
            ping_error: options.get("pingError").map(ToOwned::to_owned),
            read_delay: options.get_millis("readDelay")?,
            write_delay: options.get_millis("writeDelay")?,
            trace_enabled: options.get_bool("traceEnabled")?.unwrap_or(false),
        })
    }
}

async fn delay(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

fn trace(tracer: Option<&Tracer>, operation: &str, message: &str) {
    if let Some(tracer) = tracer {
        tracer.add_trace(operation, message);
    }
}

/// Connection to a simulated [`Device`].
pub struct SimulatedConnection {
    connection_id: String,
    device: Arc<Device>,
    settings: Settings,
    connected: AtomicBool,
    tracer: Option<Tracer>,
}

impl SimulatedConnection {
    fn new(device: Arc<Device>, settings: Settings) -> Self {
        let connection_id = next_connection_id();
        let tracer = settings
            .trace_enabled
            .then(|| Tracer::new(connection_id.clone()));
        Self {
            connection_id,
            device,
            settings,
            connected: AtomicBool::new(false),
            tracer,
        }
    }

    fn trace(&self, operation: &str, message: &str) {
        trace(self.tracer.as_ref(), operation, message);
    }

    fn unsupported(&self, operation: &str) -> ! {
        panic!(
            "{operation} requests are not supported by connection {}",
            self.connection_id
        )
    }
}

#[async_trait]
impl Connection for SimulatedConnection {
    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.trace("connect", "started");
        if self.is_connected() {
            self.trace("connect", "success");
            return Ok(());
        }
        delay(self.settings.connection_delay).await;
        if let Some(message) = &self.settings.connection_error {
            self.trace("connect", &format!("error: {message}"));
            return Err(Error::Connect(message.clone()));
        }
        self.connected.store(true, Ordering::Release);
        self.trace("connect", "success");
        log::debug!(
            "Connected to simulated device {} ({})",
            self.device.name(),
            self.connection_id
        );
        Ok(())
    }

    async fn close(&self) -> Result<CloseResult> {
        self.trace("close", "started");
        delay(self.settings.closing_delay).await;
        self.connected.store(false, Ordering::Release);
        self.trace("close", "success");
        Ok(CloseResult::default())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn ping(&self) -> Result<()> {
        self.trace("ping", "started");
        delay(self.settings.ping_delay).await;
        if !self.is_connected() {
            self.trace("ping", &format!("error: {}", Error::NotConnected));
            return Err(Error::NotConnected);
        }
        if let Some(message) = &self.settings.ping_error {
            self.trace("ping", &format!("error: {message}"));
            return Err(Error::Protocol(message.clone()));
        }
        self.trace("ping", "success");
        Ok(())
    }

    fn metadata(&self) -> ConnectionMetadata {
        let attributes = [
            ("connectionDelay", "Delay applied when connecting"),
            ("closingDelay", "Delay applied when closing the connection"),
            ("pingDelay", "Delay applied when executing a ping operation"),
            ("readDelay", "Delay applied when executing a read operation"),
            ("writeDelay", "Delay applied when executing a write operation"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect::<BTreeMap<_, _>>();
        ConnectionMetadata {
            attributes,
            can_read: true,
            can_write: true,
            can_subscribe: false,
            can_browse: false,
        }
    }

    fn tracer(&self) -> Option<Tracer> {
        self.tracer.clone()
    }

    fn read_request_builder(&self) -> ReadRequestBuilder {
        ReadRequestBuilder::new(Arc::new(SimulatedReader {
            device: Arc::clone(&self.device),
            delay: self.settings.read_delay,
            tracer: self.tracer.clone(),
        }))
    }

    fn write_request_builder(&self) -> WriteRequestBuilder {
        WriteRequestBuilder::new(Arc::new(SimulatedWriter {
            device: Arc::clone(&self.device),
            delay: self.settings.write_delay,
            tracer: self.tracer.clone(),
        }))
    }

    fn subscription_request_builder(&self) -> SubscriptionRequestBuilder {
        self.unsupported("subscription")
    }

    fn unsubscription_request_builder(&self) -> UnsubscriptionRequestBuilder {
        self.unsupported("unsubscription")
    }

    fn browse_request_builder(&self) -> BrowseRequestBuilder {
        self.unsupported("browse")
    }
}

impl fmt::Debug for SimulatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedConnection")
            .field("connection_id", &self.connection_id)
            .field("device", &self.device.name())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct SimulatedReader {
    device: Arc<Device>,
    delay: Option<Duration>,
    tracer: Option<Tracer>,
}

#[async_trait]
impl Reader for SimulatedReader {
    async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
        trace(self.tracer.as_ref(), "read", "started");
        delay(self.delay).await;
        let results = request
            .tags()
            .iter()
            .map(|tag| {
                let (code, value) = match tag.address.parse::<SimulatedTag>() {
                    Ok(address) => self.device.read(&address),
                    Err(err) => {
                        log::debug!("Invalid address of tag '{}': {err}", tag.name);
                        (ResponseCode::InvalidAddress, PlcValue::Null)
                    }
                };
                ReadResult {
                    name: tag.name.clone(),
                    code,
                    value,
                }
            })
            .collect();
        trace(self.tracer.as_ref(), "read", "success");
        Ok(ReadResponse { results })
    }
}

struct SimulatedWriter {
    device: Arc<Device>,
    delay: Option<Duration>,
    tracer: Option<Tracer>,
}

#[async_trait]
impl Writer for SimulatedWriter {
    async fn write(&self, request: &WriteRequest) -> Result<WriteResponse> {
        trace(self.tracer.as_ref(), "write", "started");
        delay(self.delay).await;
        let results = request
            .tags()
            .iter()
            .map(|tag| {
                let code = match tag.address.parse::<SimulatedTag>() {
                    Ok(address) => self.device.write(&address, &tag.value),
                    Err(err) => {
                        log::debug!("Invalid address of tag '{}': {err}", tag.name);
                        ResponseCode::InvalidAddress
                    }
                };
                (tag.name.clone(), code)
            })
            .collect();
        trace(self.tracer.as_ref(), "write", "success");
        Ok(WriteResponse { results })
    }
}
