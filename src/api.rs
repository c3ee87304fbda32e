//! Client for the sidecar RESTful API injected by the traffic agent.
//!
//! The agent publishes its port through `TELEPRESENCE_API_PORT`. The port is
//! read on every call, not cached, because the variable only appears once the
//! pod's environment has been injected. All answers are fail-open: an absent
//! or unreachable sidecar yields the answer that keeps traffic flowing.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::constants;
use crate::propagation::InterceptContext;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Intercept status as reported by the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InterceptInfo {
    #[serde(default)]
    pub intercepted: bool,
    #[serde(rename = "clientSide", default)]
    pub client_side: bool,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

pub struct ApiService {
    client: reqwest::blocking::Client,
    port_override: Option<u16>,
}

impl ApiService {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            port_override: None,
        }
    }

    /// Fixed port instead of the env lookup; for tests against a local stub.
    pub fn with_port(port: u16) -> Self {
        let mut api = Self::new();
        api.port_override = Some(port);
        api
    }

    fn port(&self) -> Option<u16> {
        if let Some(port) = self.port_override {
            return Some(port);
        }
        std::env::var(constants::API_PORT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
    }

    fn endpoint(&self, port: u16, name: &str, path: Option<&str>) -> Option<Url> {
        let mut url = Url::parse(&format!("http://localhost:{port}/{name}")).ok()?;
        if let Some(path) = path {
            url.set_query(Some(&format!("path={}", urlencoding::encode(path))));
        }
        Some(url)
    }

    fn get(&self, context: &InterceptContext, url: Url) -> Option<String> {
        let mut request = self.client.get(url);
        for (header, value) in context.headers() {
            request = request.header(header, value);
        }
        // The sidecar matches the caller to its intercept by this id.
        if let Ok(id) = std::env::var(constants::INTERCEPT_ID_ENV) {
            request = request.header(constants::INTERCEPT_ID_HEADER, id);
        }
        let response = request.send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().ok()
    }

    /// Whether the sidecar is up. Unreachable means false.
    pub fn healthz(&self) -> bool {
        let Some(port) = self.port() else {
            return false;
        };
        let Some(url) = self.endpoint(port, "healthz", None) else {
            return false;
        };
        self.get(&InterceptContext::new(), url).is_some()
    }

    /// Whether this instance should consume the current message or request.
    /// No configured port and any failure both mean yes.
    pub fn consume_here(&self, context: &InterceptContext, path: Option<&str>) -> bool {
        let Some(port) = self.port() else {
            return true;
        };
        let Some(url) = self.endpoint(port, "consume-here", path) else {
            return true;
        };
        match self.get(context, url) {
            Some(body) => body.to_lowercase().contains("true"),
            None => true,
        }
    }

    /// Detailed intercept status. Unreachable means none.
    pub fn intercept_info(&self, context: &InterceptContext) -> Option<InterceptInfo> {
        let port = self.port()?;
        let url = self.endpoint(port, "intercept-info", None)?;
        let body = self.get(context, url)?;
        serde_json::from_str(&body).ok()
    }
}

impl Default for ApiService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_here_is_open_without_a_port() {
        let api = ApiService {
            client: reqwest::blocking::Client::new(),
            port_override: None,
        };
        // No override and (in tests) no env var: fail open.
        if std::env::var(constants::API_PORT_ENV).is_err() {
            assert!(api.consume_here(&InterceptContext::new(), None));
        }
    }

    #[test]
    fn test_consume_here_is_open_when_unreachable() {
        // Port 1 is never a listening sidecar.
        let api = ApiService::with_port(1);
        assert!(api.consume_here(&InterceptContext::new(), Some("/orders")));
    }

    #[test]
    fn test_healthz_is_closed_when_unreachable() {
        let api = ApiService::with_port(1);
        assert!(!api.healthz());
    }

    #[test]
    fn test_intercept_info_is_none_when_unreachable() {
        let api = ApiService::with_port(1);
        assert!(api.intercept_info(&InterceptContext::new()).is_none());
    }

    #[test]
    fn test_endpoint_encodes_the_path_query() {
        let api = ApiService::with_port(9980);
        let url = api
            .endpoint(9980, "consume-here", Some("/orders and more"))
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "http://localhost:9980/consume-here?path=%2Forders%20and%20more"
        );
    }

    #[test]
    fn test_intercept_info_parses_wire_names() {
        let info: InterceptInfo = serde_json::from_str(
            r#"{"intercepted": true, "clientSide": false, "metadata": {"team": "payments"}}"#,
        )
        .expect("parse");
        assert!(info.intercepted);
        assert!(!info.client_side);
        assert_eq!(info.metadata.unwrap()["team"], "payments");
    }
}
