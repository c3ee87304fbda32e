//! Header propagation across service hops.
//!
//! When a request enters an intercepted service, every header whose name
//! contains the `x-telepresence` marker is captured into an
//! [`InterceptContext`]. Outbound calls re-emit those headers, so routing
//! survives any number of hops even through services that know nothing about
//! interception.
//!
//! Messaging integrations mirror the HTTP path with three filters: publish
//! and send attach the context to outgoing messages, and the consume filter
//! gates delivery through the sidecar API. Every filter is fail-open: a
//! broken or absent sidecar must never stall production traffic.

use std::collections::BTreeMap;

use crate::api::ApiService;
use crate::constants;

/// Per-call bag of propagated headers. Names are stored lowercased; capture
/// overwrites, so the most recent hop wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptContext {
    headers: BTreeMap<String, String>,
}

impl InterceptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures one header pair; names without the marker are ignored.
    pub fn capture(&mut self, name: &str, value: &str) {
        let lowered = name.to_lowercase();
        if lowered.contains(constants::HEADER_MARKER) {
            self.headers.insert(lowered, value.to_string());
        }
    }

    /// Captures every marker-bearing pair from an inbound header set.
    pub fn capture_all<'a, I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in pairs {
            self.capture(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Anything headers can be written onto: HTTP requests, broker messages.
pub trait HeaderCarrier {
    fn set_header(&mut self, name: &str, value: &str);
}

impl HeaderCarrier for reqwest::header::HeaderMap {
    fn set_header(&mut self, name: &str, value: &str) {
        use reqwest::header::{HeaderName, HeaderValue};
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.insert(name, value);
        }
    }
}

impl HeaderCarrier for BTreeMap<String, String> {
    fn set_header(&mut self, name: &str, value: &str) {
        self.insert(name.to_string(), value.to_string());
    }
}

/// Writes every captured header onto a carrier.
pub fn apply_headers(context: &InterceptContext, carrier: &mut dyn HeaderCarrier) {
    for (name, value) in context.headers() {
        carrier.set_header(name, value);
    }
}

/// Attaches the captured headers to an outbound HTTP request.
pub fn attach_headers(
    context: &InterceptContext,
    request: reqwest::blocking::RequestBuilder,
) -> reqwest::blocking::RequestBuilder {
    let mut headers = reqwest::header::HeaderMap::new();
    apply_headers(context, &mut headers);
    request.headers(headers)
}

/// Probe name shared by all pipeline filters.
pub const FILTER_PROBE: &str = "telepresence";

/// Attaches the intercept context to messages being published.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishFilter;

impl PublishFilter {
    pub fn probe(&self) -> &'static str {
        FILTER_PROBE
    }

    pub fn apply(&self, context: &InterceptContext, message_headers: &mut dyn HeaderCarrier) {
        apply_headers(context, message_headers);
    }
}

/// Attaches the intercept context to messages being sent point-to-point.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendFilter;

impl SendFilter {
    pub fn probe(&self) -> &'static str {
        FILTER_PROBE
    }

    pub fn apply(&self, context: &InterceptContext, message_headers: &mut dyn HeaderCarrier) {
        apply_headers(context, message_headers);
    }
}

/// Gates message delivery: a consumer running next to a traffic agent asks
/// the sidecar whether this instance should handle the message.
pub struct ConsumeFilter {
    api: ApiService,
}

impl ConsumeFilter {
    pub fn new() -> Self {
        Self {
            api: ApiService::new(),
        }
    }

    /// Filter backed by an explicit API client, e.g. one pinned to a stub port.
    pub fn with_api(api: ApiService) -> Self {
        Self { api }
    }

    pub fn probe(&self) -> &'static str {
        FILTER_PROBE
    }

    /// Captures the message's marker headers and asks the sidecar whether to
    /// consume here. Answers true whenever the sidecar cannot be asked.
    pub fn should_consume<'a, I>(&self, message_headers: I) -> (bool, InterceptContext)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut context = InterceptContext::new();
        context.capture_all(message_headers);
        let consume = self.api.consume_here(&context, None);
        (consume, context)
    }
}

impl Default for ConsumeFilter {
    fn default() -> Self {
        Self::new()
    }
}
