//! The declarative intercept specification consumed by the external tool.
//!
//! Entities are immutable values produced by explicit builders; every derived
//! default is computed once at `build()`, so field values never depend on the
//! order anything is read in. Serialization is camelCase YAML with
//! default/absent fields omitted and enums rendered by their wire string.

mod connection;
mod handler;
mod validate;
mod workload;

pub use connection::{Connection, ConnectionBuilder};
pub use handler::{
    ContainerHandler, ExternalHandler, Handler, HandlerBuilder, HandlerKind, OutputFormat,
    OutputTarget, ScriptHandler, Shell,
};
pub use workload::{Workload, WorkloadBuilder, WorkloadIntercept, WorkloadInterceptBuilder};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::errors::{reasons, Error, Result};

/// A named value, the wire shape used for header selectors and handler
/// environment entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedValuePair {
    pub name: String,
    pub value: String,
}

/// Aggregate root: everything the external tool needs to establish one or
/// more intercepts in a single `intercept run` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptSpecification {
    pub(crate) name: String,
    pub(crate) connection: Connection,
    pub(crate) workloads: Vec<Workload>,
    pub(crate) handlers: Vec<Handler>,
}

impl InterceptSpecification {
    pub fn builder() -> InterceptSpecificationBuilder {
        InterceptSpecificationBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Name-derived directory under the system temp dir that owns the
    /// specification file for one lifecycle. Shared mutable state: callers
    /// running concurrent lifecycles must not share a specification name.
    pub(crate) fn temporary_directory(&self) -> PathBuf {
        std::env::temp_dir()
            .join(constants::TOOL_NAME)
            .join(&self.name)
    }

    pub(crate) fn file_path(&self) -> PathBuf {
        self.temporary_directory()
            .join(format!("{}-intercept-specification.yaml", self.name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterceptSpecificationBuilder {
    name: Option<String>,
    connection: Option<Connection>,
    workloads: Vec<Workload>,
    handlers: Vec<Handler>,
}

impl InterceptSpecificationBuilder {
    /// Name of the specification. Defaults to the current executable's name,
    /// normalized to lowercase with dots and underscores replaced by hyphens.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn workload(mut self, workload: Workload) -> Self {
        self.workloads.push(workload);
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<InterceptSpecification> {
        let name = match self.name {
            Some(name) => name,
            None => validate::default_name()
                .ok_or(Error::validation("name", reasons::CANT_DETERMINE_NAME))?,
        };
        if !validate::is_local_name(&name) {
            return Err(Error::validation(
                "name",
                reasons::ALPHANUMERIC_WITH_HYPHENS_UNDERSCORES,
            ));
        }
        let connection = match self.connection {
            Some(connection) => connection,
            None => Connection::builder().build()?,
        };
        let workloads = if self.workloads.is_empty() {
            vec![Workload::builder(validate::normalize_name(&name)).build()?]
        } else {
            self.workloads
        };
        if workloads.len() > 32 {
            return Err(Error::validation(
                "workloads",
                reasons::INVALID_WORKLOAD_COUNT,
            ));
        }
        let handlers = if self.handlers.is_empty() {
            vec![Handler::builder(&name)
                .external(ExternalHandler::default())
                .build()?]
        } else {
            self.handlers
        };
        if handlers.len() > 64 {
            return Err(Error::validation("handlers", reasons::INVALID_HANDLER_COUNT));
        }
        Ok(InterceptSpecification {
            name,
            connection,
            workloads,
            handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Connection {
        Connection::builder()
            .context("kind")
            .namespace("default")
            .build()
            .expect("build connection")
    }

    #[test]
    fn test_convention_defaults_single_workload_and_handler() {
        let spec = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection())
            .build()
            .expect("build spec");
        assert_eq!(spec.workloads.len(), 1);
        assert_eq!(spec.workloads[0].name(), "web");
        assert_eq!(spec.workloads[0].intercepts().len(), 1);
        assert_eq!(spec.workloads[0].intercepts()[0].name(), "web");
        assert_eq!(spec.handlers.len(), 1);
        assert_eq!(spec.handlers[0].name(), "web");
        assert!(matches!(spec.handlers[0].kind(), HandlerKind::External(_)));
    }

    #[test]
    fn test_yaml_uses_camel_case_and_omits_defaults() {
        let spec = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection())
            .workload(
                Workload::builder("web")
                    .intercept(
                        WorkloadIntercept::builder("web-svc")
                            .port(8080)
                            .local_port(56001)
                            .build()
                            .expect("build intercept"),
                    )
                    .build()
                    .expect("build workload"),
            )
            .build()
            .expect("build spec");
        let yaml = spec.to_yaml().expect("serialize");
        assert!(yaml.contains("localPort: 56001"), "camelCase missing:\n{yaml}");
        assert!(!yaml.contains("local_port"), "snake_case leaked:\n{yaml}");
        assert!(!yaml.contains("pathPrefix"), "unset field serialized:\n{yaml}");
        assert!(!yaml.contains("managerNamespace"), "unset field serialized:\n{yaml}");
        assert!(yaml.contains("outputFormat: json"), "enum wire string missing:\n{yaml}");
    }

    #[test]
    fn test_yaml_round_trip_preserves_explicit_fields() {
        let spec = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection())
            .workload(
                Workload::builder("web")
                    .intercept(
                        WorkloadIntercept::builder("web-svc")
                            .port(8080)
                            .local_port(56002)
                            .local_address("127.0.0.1")
                            .replace(true)
                            .build()
                            .expect("build intercept"),
                    )
                    .build()
                    .expect("build workload"),
            )
            .handler(
                Handler::builder("web-svc")
                    .env("RUST_LOG", "debug")
                    .external(ExternalHandler {
                        is_docker: None,
                        output_format: OutputFormat::Json,
                        output_path: OutputTarget::File("/tmp/env.json".to_string()),
                    })
                    .build()
                    .expect("build handler"),
            )
            .build()
            .expect("build spec");
        let yaml = spec.to_yaml().expect("serialize");
        let parsed = InterceptSpecification::from_yaml(&yaml).expect("deserialize");
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_workload_count_capped_at_32() {
        let mut builder = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection());
        for i in 0..33 {
            builder = builder.workload(
                Workload::builder(format!("w{i}"))
                    .intercept(
                        WorkloadIntercept::builder(format!("w{i}"))
                            .local_port(56100 + i as u16)
                            .build()
                            .expect("build intercept"),
                    )
                    .build()
                    .expect("build workload"),
            );
        }
        let err = builder.build().expect_err("33 workloads accepted");
        assert!(matches!(err, Error::Validation { field: "workloads", .. }));
    }

    #[test]
    fn test_handler_count_capped_at_64() {
        let mut builder = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection());
        for i in 0..65 {
            builder = builder.handler(
                Handler::builder(format!("h{i}"))
                    .external(ExternalHandler::default())
                    .build()
                    .expect("build handler"),
            );
        }
        let err = builder.build().expect_err("65 handlers accepted");
        assert!(matches!(err, Error::Validation { field: "handlers", .. }));
    }

    #[test]
    fn test_spec_file_path_is_name_derived() {
        let spec = InterceptSpecification::builder()
            .name("web")
            .connection(test_connection())
            .build()
            .expect("build spec");
        let path = spec.file_path();
        let rendered = path.to_string_lossy();
        assert!(rendered.contains("telepresence"), "tool dir missing: {rendered}");
        assert!(
            rendered.ends_with("web-intercept-specification.yaml"),
            "unexpected file name: {rendered}"
        );
    }
}
