// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol independent request model
//!
//! Requests address tags by driver specific address strings. A driver
//! provides the [`Reader`], [`Writer`], [`Subscriber`] and [`Browser`]
//! implementations that parse these addresses and execute the requests.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    value::{PlcValue, ResponseCode},
    Error, Result,
};

/// Executes read requests.
#[async_trait]
pub trait Reader: Send + Sync {
    async fn read(&self, request: &ReadRequest) -> Result<ReadResponse>;
}

/// Executes write requests.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, request: &WriteRequest) -> Result<WriteResponse>;
}

/// Executes subscription and unsubscription requests.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, request: &SubscriptionRequest) -> Result<SubscriptionResponse>;

    async fn unsubscribe(&self, request: &UnsubscriptionRequest) -> Result<UnsubscriptionResponse>;
}

/// Executes browse requests.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn browse(&self, request: &BrowseRequest) -> Result<BrowseResponse>;
}

fn check_unique_name(names: &mut HashSet<String>, name: &str) -> Result<()> {
    if names.insert(name.to_owned()) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("duplicate tag name '{name}'")))
    }
}

///////////////////////////////////////////////////////////////////
/// Read
///////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAddress {
    pub name: String,
    pub address: String,
}

#[must_use]
pub struct ReadRequestBuilder {
    reader: Arc<dyn Reader>,
    tags: Vec<TagAddress>,
}

impl ReadRequestBuilder {
    pub fn new(reader: Arc<dyn Reader>) -> Self {
        Self {
            reader,
            tags: Vec::new(),
        }
    }

    pub fn add_tag_address(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.tags.push(TagAddress {
            name: name.into(),
            address: address.into(),
        });
        self
    }

    pub fn build(self) -> Result<ReadRequest> {
        let mut names = HashSet::new();
        for tag in &self.tags {
            check_unique_name(&mut names, &tag.name)?;
        }
        Ok(ReadRequest {
            reader: self.reader,
            tags: self.tags,
        })
    }
}

pub struct ReadRequest {
    reader: Arc<dyn Reader>,
    tags: Vec<TagAddress>,
}

impl ReadRequest {
    #[must_use]
    pub fn tags(&self) -> &[TagAddress] {
        &self.tags
    }

    pub async fn execute(&self) -> Result<ReadResponse> {
        log::debug!("Read {self:?}");
        self.reader.read(self).await
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub name: String,
    pub code: ResponseCode,
    pub value: PlcValue,
}

/// Results in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResponse {
    pub results: Vec<ReadResult>,
}

impl ReadResponse {
    #[must_use]
    pub fn tag_names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }

    #[must_use]
    pub fn response_code(&self, name: &str) -> Option<ResponseCode> {
        self.result(name).map(|r| r.code)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&PlcValue> {
        self.result(name).map(|r| &r.value)
    }

    fn result(&self, name: &str) -> Option<&ReadResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

///////////////////////////////////////////////////////////////////
/// Write
///////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq)]
pub struct TagWrite {
    pub name: String,
    pub address: String,
    pub value: PlcValue,
}

#[must_use]
pub struct WriteRequestBuilder {
    writer: Arc<dyn Writer>,
    tags: Vec<TagWrite>,
}

impl WriteRequestBuilder {
    pub fn new(writer: Arc<dyn Writer>) -> Self {
        Self {
            writer,
            tags: Vec::new(),
        }
    }

    pub fn add_tag_address(
        mut self,
        name: impl Into<String>,
        address: impl Into<String>,
        value: impl Into<PlcValue>,
    ) -> Self {
        self.tags.push(TagWrite {
            name: name.into(),
            address: address.into(),
            value: value.into(),
        });
        self
    }

    pub fn build(self) -> Result<WriteRequest> {
        let mut names = HashSet::new();
        for tag in &self.tags {
            check_unique_name(&mut names, &tag.name)?;
        }
        Ok(WriteRequest {
            writer: self.writer,
            tags: self.tags,
        })
    }
}

pub struct WriteRequest {
    writer: Arc<dyn Writer>,
    tags: Vec<TagWrite>,
}

impl WriteRequest {
    #[must_use]
    pub fn tags(&self) -> &[TagWrite] {
        &self.tags
    }

    pub async fn execute(&self) -> Result<WriteResponse> {
        log::debug!("Write {self:?}");
        self.writer.write(self).await
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResponse {
    pub results: Vec<(String, ResponseCode)>,
}

impl WriteResponse {
    #[must_use]
    pub fn response_code(&self, name: &str) -> Option<ResponseCode> {
        self.results
            .iter()
            .find(|(tag_name, _)| tag_name == name)
            .map(|(_, code)| *code)
    }
}

///////////////////////////////////////////////////////////////////
/// Subscriptions
///////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    ChangeOfState,
    Cyclic(Duration),
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTag {
    pub name: String,
    pub address: String,
    pub subscription_type: SubscriptionType,
}

#[must_use]
pub struct SubscriptionRequestBuilder {
    subscriber: Arc<dyn Subscriber>,
    tags: Vec<SubscriptionTag>,
}

impl SubscriptionRequestBuilder {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            tags: Vec::new(),
        }
    }

    fn add(mut self, name: String, address: String, subscription_type: SubscriptionType) -> Self {
        self.tags.push(SubscriptionTag {
            name,
            address,
            subscription_type,
        });
        self
    }

    pub fn add_change_of_state_tag_address(
        self,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        self.add(name.into(), address.into(), SubscriptionType::ChangeOfState)
    }

    pub fn add_cyclic_tag_address(
        self,
        name: impl Into<String>,
        address: impl Into<String>,
        interval: Duration,
    ) -> Self {
        self.add(name.into(), address.into(), SubscriptionType::Cyclic(interval))
    }

    pub fn add_event_tag_address(self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.add(name.into(), address.into(), SubscriptionType::Event)
    }

    pub fn build(self) -> Result<SubscriptionRequest> {
        let mut names = HashSet::new();
        for tag in &self.tags {
            check_unique_name(&mut names, &tag.name)?;
            if matches!(tag.subscription_type, SubscriptionType::Cyclic(interval) if interval.is_zero())
            {
                return Err(Error::InvalidRequest(format!(
                    "zero cycle time for tag '{}'",
                    tag.name
                )));
            }
        }
        Ok(SubscriptionRequest {
            subscriber: self.subscriber,
            tags: self.tags,
        })
    }
}

pub struct SubscriptionRequest {
    subscriber: Arc<dyn Subscriber>,
    tags: Vec<SubscriptionTag>,
}

impl SubscriptionRequest {
    #[must_use]
    pub fn tags(&self) -> &[SubscriptionTag] {
        &self.tags
    }

    pub async fn execute(&self) -> Result<SubscriptionResponse> {
        log::debug!("Subscribe {self:?}");
        self.subscriber.subscribe(self).await
    }
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Identifies an active subscription on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub tag_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResult {
    pub name: String,
    pub code: ResponseCode,
    pub handle: Option<SubscriptionHandle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionResponse {
    pub results: Vec<SubscriptionResult>,
}

impl SubscriptionResponse {
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<&SubscriptionHandle> {
        self.results
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.handle.as_ref())
    }
}

#[must_use]
pub struct UnsubscriptionRequestBuilder {
    subscriber: Arc<dyn Subscriber>,
    handles: Vec<SubscriptionHandle>,
}

impl UnsubscriptionRequestBuilder {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            handles: Vec::new(),
        }
    }

    pub fn add_handle(mut self, handle: SubscriptionHandle) -> Self {
        self.handles.push(handle);
        self
    }

    pub fn build(self) -> Result<UnsubscriptionRequest> {
        if self.handles.is_empty() {
            return Err(Error::InvalidRequest(
                "no subscription handles given".to_owned(),
            ));
        }
        Ok(UnsubscriptionRequest {
            subscriber: self.subscriber,
            handles: self.handles,
        })
    }
}

pub struct UnsubscriptionRequest {
    subscriber: Arc<dyn Subscriber>,
    handles: Vec<SubscriptionHandle>,
}

impl UnsubscriptionRequest {
    #[must_use]
    pub fn handles(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    pub async fn execute(&self) -> Result<UnsubscriptionResponse> {
        log::debug!("Unsubscribe {self:?}");
        self.subscriber.unsubscribe(self).await
    }
}

impl fmt::Debug for UnsubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscriptionRequest")
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscriptionResponse {
    pub results: Vec<(SubscriptionHandle, ResponseCode)>,
}

///////////////////////////////////////////////////////////////////
/// Browse
///////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseQuery {
    pub name: String,
    pub query: String,
}

#[must_use]
pub struct BrowseRequestBuilder {
    browser: Arc<dyn Browser>,
    queries: Vec<BrowseQuery>,
}

impl BrowseRequestBuilder {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self {
            browser,
            queries: Vec::new(),
        }
    }

    pub fn add_query(mut self, name: impl Into<String>, query: impl Into<String>) -> Self {
        self.queries.push(BrowseQuery {
            name: name.into(),
            query: query.into(),
        });
        self
    }

    pub fn build(self) -> Result<BrowseRequest> {
        let mut names = HashSet::new();
        for query in &self.queries {
            check_unique_name(&mut names, &query.name)?;
        }
        Ok(BrowseRequest {
            browser: self.browser,
            queries: self.queries,
        })
    }
}

pub struct BrowseRequest {
    browser: Arc<dyn Browser>,
    queries: Vec<BrowseQuery>,
}

impl BrowseRequest {
    #[must_use]
    pub fn queries(&self) -> &[BrowseQuery] {
        &self.queries
    }

    pub async fn execute(&self) -> Result<BrowseResponse> {
        log::debug!("Browse {self:?}");
        self.browser.browse(self).await
    }
}

impl fmt::Debug for BrowseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowseRequest")
            .field("queries", &self.queries)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseItem {
    pub address: String,
    pub name: String,
    pub readable: bool,
    pub writable: bool,
    pub subscribable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseResult {
    pub query_name: String,
    pub code: ResponseCode,
    pub items: Vec<BrowseItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseResponse {
    pub results: Vec<BrowseResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoReader;

    #[async_trait]
    impl Reader for EchoReader {
        async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
            let results = request
                .tags()
                .iter()
                .map(|tag| ReadResult {
                    name: tag.name.clone(),
                    code: ResponseCode::Ok,
                    value: PlcValue::String(tag.address.clone()),
                })
                .collect();
            Ok(ReadResponse { results })
        }
    }

    #[tokio::test]
    async fn execute_read_request() {
        let request = ReadRequestBuilder::new(Arc::new(EchoReader))
            .add_tag_address("first", "STATE/a:BOOL")
            .add_tag_address("second", "STATE/b:INT")
            .build()
            .unwrap();
        let response = request.execute().await.unwrap();
        assert_eq!(response.tag_names(), ["first", "second"]);
        assert_eq!(response.response_code("second"), Some(ResponseCode::Ok));
        assert_eq!(
            response.value("first"),
            Some(&PlcValue::from("STATE/a:BOOL"))
        );
        assert_eq!(response.value("third"), None);
    }

    #[test]
    fn reject_duplicate_tag_names() {
        let result = ReadRequestBuilder::new(Arc::new(EchoReader))
            .add_tag_address("a", "STATE/a:BOOL")
            .add_tag_address("a", "STATE/b:BOOL")
            .build();
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }
}
