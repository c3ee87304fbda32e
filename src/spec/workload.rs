//! Workloads and the service/port bindings intercepted on them.

use std::io;
use std::net::TcpListener;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::errors::{reasons, Error, Result};
use crate::spec::validate;
use crate::spec::NamedValuePair;

/// An intercepted workload (Deployment, ReplicaSet or StatefulSet), keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub(crate) name: String,
    pub(crate) intercepts: Vec<WorkloadIntercept>,
}

impl Workload {
    pub fn builder(name: impl Into<String>) -> WorkloadBuilder {
        WorkloadBuilder {
            name: name.into(),
            intercepts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intercepts(&self) -> &[WorkloadIntercept] {
        &self.intercepts
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    name: String,
    intercepts: Vec<WorkloadIntercept>,
}

impl WorkloadBuilder {
    pub fn intercept(mut self, intercept: WorkloadIntercept) -> Self {
        self.intercepts.push(intercept);
        self
    }

    /// Builds the workload. With no intercepts added, a single one named after
    /// the workload is created by convention. Insertion order is preserved.
    pub fn build(self) -> Result<Workload> {
        if !validate::is_resource_name(&self.name) {
            return Err(Error::validation(
                "workload.name",
                reasons::ALPHANUMERIC_WITH_HYPHENS,
            ));
        }
        let intercepts = if self.intercepts.is_empty() {
            vec![WorkloadIntercept::builder(&self.name).build()?]
        } else {
            self.intercepts
        };
        if intercepts.len() > 16 {
            return Err(Error::validation(
                "workload.intercepts",
                reasons::INVALID_INTERCEPT_COUNT,
            ));
        }
        Ok(Workload {
            name: self.name,
            intercepts,
        })
    }
}

/// One interceptable service/port binding on a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIntercept {
    pub(crate) name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) enabled: Option<bool>,
    pub(crate) handler: String,
    pub(crate) service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) port: Option<u16>,
    pub(crate) local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) local_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mount_point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) global: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) replace: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) headers: Option<Vec<NamedValuePair>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) path_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) path_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) path_equal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) path_regexp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) plaintext: Option<bool>,
}

impl WorkloadIntercept {
    pub fn builder(name: impl Into<String>) -> WorkloadInterceptBuilder {
        WorkloadInterceptBuilder {
            name: name.into(),
            ..WorkloadInterceptBuilder::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local port that receives intercepted traffic. May have been
    /// auto-generated at build time.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadInterceptBuilder {
    name: String,
    enabled: Option<bool>,
    handler: Option<String>,
    service: Option<String>,
    port: Option<u16>,
    local_port: Option<u16>,
    local_address: Option<String>,
    mount_point: Option<String>,
    global: Option<bool>,
    replace: Option<bool>,
    headers: Option<Vec<NamedValuePair>>,
    path_prefix: Option<String>,
    path_suffix: Option<String>,
    path_equal: Option<String>,
    path_regexp: Option<String>,
    plaintext: Option<bool>,
}

impl WorkloadInterceptBuilder {
    /// Disable this intercept without removing it from the specification.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Name of the handler serving this intercept. Defaults to the intercept's
    /// own name.
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Name of the service to intercept. Defaults to the intercept's own name.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// The remote port that will be intercepted.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Local port receiving the traffic. When unset, a free port in
    /// [55000, 65535) is picked at build time.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Local IPv4 address receiving the traffic.
    pub fn local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    /// Local directory where the remote volumes are mounted.
    pub fn mount_point(mut self, path: impl Into<String>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    /// Intercept all tcp/udp traffic. Mutually exclusive with headers and the
    /// path selectors; the conflict is rejected at build.
    pub fn global(mut self, global: bool) -> Self {
        self.global = Some(global);
        self
    }

    /// Replace the running container instead of running alongside it.
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = Some(replace);
        self
    }

    /// Header selectors routing matching requests to this intercept.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.get_or_insert_with(Vec::new).push(NamedValuePair {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.path_suffix = Some(suffix.into());
        self
    }

    pub fn path_equal(mut self, path: impl Into<String>) -> Self {
        self.path_equal = Some(path.into());
        self
    }

    pub fn path_regexp(mut self, pattern: impl Into<String>) -> Self {
        self.path_regexp = Some(pattern.into());
        self
    }

    /// Use plaintext when talking to the local interceptor process.
    pub fn plaintext(mut self, plaintext: bool) -> Self {
        self.plaintext = Some(plaintext);
        self
    }

    pub fn build(self) -> Result<WorkloadIntercept> {
        if !validate::is_local_name(&self.name) {
            return Err(Error::validation(
                "intercept.name",
                reasons::ALPHANUMERIC_WITH_HYPHENS_UNDERSCORES,
            ));
        }
        let handler = self.handler.unwrap_or_else(|| self.name.clone());
        if !validate::is_local_name(&handler) {
            return Err(Error::validation(
                "intercept.handler",
                reasons::ALPHANUMERIC_WITH_HYPHENS_UNDERSCORES,
            ));
        }
        let service = self.service.unwrap_or_else(|| self.name.clone());
        if !validate::is_resource_name(&service) {
            return Err(Error::validation(
                "intercept.service",
                reasons::ALPHANUMERIC_WITH_HYPHENS,
            ));
        }
        if let Some(0) = self.port {
            return Err(Error::validation("intercept.port", reasons::NOT_A_VALID_PORT));
        }
        if let Some(0) = self.local_port {
            return Err(Error::validation(
                "intercept.localPort",
                reasons::NOT_A_VALID_PORT,
            ));
        }
        if let Some(address) = &self.local_address {
            if !validate::is_ipv4(address) {
                return Err(Error::validation(
                    "intercept.localAddress",
                    reasons::NOT_AN_IP_ADDRESS,
                ));
            }
        }
        let has_selectors = self.headers.is_some()
            || self.path_prefix.is_some()
            || self.path_suffix.is_some()
            || self.path_equal.is_some()
            || self.path_regexp.is_some();
        if self.global == Some(true) && has_selectors {
            return Err(Error::validation(
                "intercept.global",
                reasons::GLOBAL_MUTUALLY_EXCLUSIVE,
            ));
        }
        // Without an explicit selector or global routing, requests are routed
        // to this developer by the auto-generated intercept-as header.
        let headers = match self.headers {
            Some(headers) => Some(headers),
            None if self.global != Some(true) => Some(vec![NamedValuePair {
                name: constants::INTERCEPT_AS_HEADER.to_string(),
                value: validate::username(),
            }]),
            None => None,
        };
        let local_port = match self.local_port {
            Some(port) => port,
            None => generate_local_port()?,
        };
        Ok(WorkloadIntercept {
            name: self.name,
            enabled: self.enabled,
            handler,
            service,
            port: self.port,
            local_port,
            local_address: self.local_address,
            mount_point: self.mount_point,
            global: self.global,
            replace: self.replace,
            headers,
            path_prefix: self.path_prefix,
            path_suffix: self.path_suffix,
            path_equal: self.path_equal,
            path_regexp: self.path_regexp,
            plaintext: self.plaintext,
        })
    }
}

/// Pick a random port in [55000, 65535) that is currently free on the host.
fn generate_local_port() -> Result<u16> {
    const LOW: u16 = 55000;
    const SPAN: u16 = 10535; // 65535 - 55000, exclusive upper bound
    for _ in 0..1024 {
        let mut buf = [0u8; 2];
        getrandom::getrandom(&mut buf)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let port = LOW + u16::from_le_bytes(buf) % SPAN;
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free local port found in 55000-65535",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_intercept_name() {
        let intercept = WorkloadIntercept::builder("web-svc").build().expect("build");
        assert_eq!(intercept.handler, "web-svc");
        assert_eq!(intercept.service, "web-svc");
        assert!(intercept.local_port >= 55000);
    }

    #[test]
    fn test_auto_port_in_range_and_free() {
        for _ in 0..8 {
            let port = generate_local_port().expect("generate port");
            assert!((55000..65535).contains(&port), "port out of range: {port}");
            TcpListener::bind(("127.0.0.1", port)).expect("generated port not bindable");
        }
    }

    #[test]
    fn test_global_after_selector_rejected() {
        let err = WorkloadIntercept::builder("web-svc")
            .path_prefix("/api")
            .global(true)
            .build()
            .expect_err("global with selector accepted");
        assert!(matches!(err, Error::Validation { field: "intercept.global", .. }));
    }

    #[test]
    fn test_selector_after_global_rejected() {
        let err = WorkloadIntercept::builder("web-svc")
            .global(true)
            .header("x-custom", "me")
            .build()
            .expect_err("selector with global accepted");
        assert!(matches!(err, Error::Validation { field: "intercept.global", .. }));
    }

    #[test]
    fn test_global_false_with_selector_is_allowed() {
        let intercept = WorkloadIntercept::builder("web-svc")
            .global(false)
            .path_prefix("/api")
            .build()
            .expect("build");
        assert_eq!(intercept.global, Some(false));
        assert_eq!(intercept.path_prefix.as_deref(), Some("/api"));
    }

    #[test]
    fn test_default_header_generated_when_not_global() {
        let intercept = WorkloadIntercept::builder("web-svc").build().expect("build");
        let headers = intercept.headers.expect("default headers missing");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name, crate::constants::INTERCEPT_AS_HEADER);
    }

    #[test]
    fn test_no_default_header_when_global() {
        let intercept = WorkloadIntercept::builder("web-svc")
            .global(true)
            .build()
            .expect("build");
        assert!(intercept.headers.is_none());
    }

    #[test]
    fn test_invalid_local_address_rejected() {
        let err = WorkloadIntercept::builder("web-svc")
            .local_address("300.1.1.1")
            .build()
            .expect_err("bad address accepted");
        assert!(matches!(err, Error::Validation { field: "intercept.localAddress", .. }));
    }

    #[test]
    fn test_zero_port_rejected() {
        let err = WorkloadIntercept::builder("web-svc")
            .port(0)
            .build()
            .expect_err("port 0 accepted");
        assert!(matches!(err, Error::Validation { field: "intercept.port", .. }));
    }

    #[test]
    fn test_workload_default_intercept_named_after_workload() {
        let workload = Workload::builder("web").build().expect("build");
        assert_eq!(workload.intercepts.len(), 1);
        assert_eq!(workload.intercepts[0].name, "web");
    }

    #[test]
    fn test_workload_intercept_count_capped_at_16() {
        let mut builder = Workload::builder("web");
        for i in 0..17 {
            builder = builder.intercept(
                WorkloadIntercept::builder(format!("svc-{i}"))
                    .local_port(60000 + i as u16)
                    .build()
                    .expect("build intercept"),
            );
        }
        let err = builder.build().expect_err("17 intercepts accepted");
        assert!(matches!(err, Error::Validation { field: "workload.intercepts", .. }));
    }
}
