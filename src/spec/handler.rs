//! Local handlers: where intercepted traffic is routed on this machine.
//!
//! Container, script and external handlers are strictly exclusive; the sum
//! type makes that a construction invariant instead of a runtime flag check.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{reasons, Error, Result};
use crate::spec::validate;
use crate::spec::NamedValuePair;

/// The resource intercepted requests are routed to, i.e. a running version of
/// the code on the developer's machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handler {
    pub(crate) name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) environment: Option<Vec<NamedValuePair>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stop_grace_period: Option<u32>,
    #[serde(flatten)]
    pub(crate) kind: HandlerKind,
}

impl Handler {
    pub fn builder(name: impl Into<String>) -> HandlerBuilder {
        HandlerBuilder {
            name: name.into(),
            environment: None,
            stop_grace_period: None,
            kind: None,
            kinds_set: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }
}

/// Exactly one of container, script or external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    #[serde(rename = "docker")]
    Container(ContainerHandler),
    #[serde(rename = "script")]
    Script(ScriptHandler),
    #[serde(rename = "external")]
    External(ExternalHandler),
}

/// Run the handler as a container: `docker run [OPTIONS] IMAGE [ARG...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandler {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// Run a script using a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHandler {
    pub run: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<Shell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Sh,
}

/// Emit intercept info to an external runner: this process, typically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalHandler {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_docker: Option<bool>,
    pub output_format: OutputFormat,
    pub output_path: OutputTarget,
}

impl Default for ExternalHandler {
    fn default() -> Self {
        Self {
            is_docker: None,
            output_format: OutputFormat::Json,
            output_path: OutputTarget::Stdout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Where the external runner's result payload lands: stdout, stderr, or a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    Stderr,
    File(String),
}

impl Serialize for OutputTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            OutputTarget::Stdout => serializer.serialize_str("stdout"),
            OutputTarget::Stderr => serializer.serialize_str("stderr"),
            OutputTarget::File(path) => serializer.serialize_str(path),
        }
    }
}

impl<'de> Deserialize<'de> for OutputTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "stdout" => Ok(OutputTarget::Stdout),
            "stderr" => Ok(OutputTarget::Stderr),
            "" => Err(D::Error::custom("output path cannot be empty")),
            _ => Ok(OutputTarget::File(raw)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerBuilder {
    name: String,
    environment: Option<Vec<NamedValuePair>>,
    stop_grace_period: Option<u32>,
    kind: Option<HandlerKind>,
    kinds_set: u8,
}

impl HandlerBuilder {
    /// Additional environment injected into the handler.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.get_or_insert_with(Vec::new).push(NamedValuePair {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Seconds to wait after SIGTERM before SIGKILL arrives.
    pub fn stop_grace_period(mut self, seconds: u32) -> Self {
        self.stop_grace_period = Some(seconds);
        self
    }

    pub fn container(mut self, container: ContainerHandler) -> Self {
        self.kind = Some(HandlerKind::Container(container));
        self.kinds_set += 1;
        self
    }

    pub fn script(mut self, script: ScriptHandler) -> Self {
        self.kind = Some(HandlerKind::Script(script));
        self.kinds_set += 1;
        self
    }

    pub fn external(mut self, external: ExternalHandler) -> Self {
        self.kind = Some(HandlerKind::External(external));
        self.kinds_set += 1;
        self
    }

    pub fn build(self) -> Result<Handler> {
        if !validate::is_local_name(&self.name) {
            return Err(Error::validation(
                "handler.name",
                reasons::ALPHANUMERIC_WITH_HYPHENS_UNDERSCORES,
            ));
        }
        for pair in self.environment.iter().flatten() {
            if !validate::is_env_name(&pair.name) {
                return Err(Error::validation(
                    "handler.environment",
                    reasons::ALPHANUMERIC_WITH_UNDERSCORES,
                ));
            }
        }
        let kind = match (self.kinds_set, self.kind) {
            (1, Some(kind)) => kind,
            _ => {
                return Err(Error::validation(
                    "handler",
                    reasons::MUTUALLY_EXCLUSIVE_HANDLERS,
                ))
            }
        };
        Ok(Handler {
            name: self.name,
            environment: self.environment,
            stop_grace_period: self.stop_grace_period,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_kind_succeeds() {
        let handler = Handler::builder("web")
            .external(ExternalHandler::default())
            .build()
            .expect("single kind rejected");
        assert!(matches!(handler.kind, HandlerKind::External(_)));
    }

    #[test]
    fn test_zero_kinds_rejected() {
        let err = Handler::builder("web").build().expect_err("no kind accepted");
        assert!(matches!(err, Error::Validation { field: "handler", .. }));
    }

    #[test]
    fn test_two_kinds_rejected() {
        let err = Handler::builder("web")
            .external(ExternalHandler::default())
            .script(ScriptHandler {
                run: "cargo run".to_string(),
                shell: None,
            })
            .build()
            .expect_err("two kinds accepted");
        assert!(matches!(err, Error::Validation { field: "handler", .. }));
    }

    #[test]
    fn test_invalid_env_name_rejected() {
        let err = Handler::builder("web")
            .env("BAD-NAME", "1")
            .external(ExternalHandler::default())
            .build()
            .expect_err("bad env name accepted");
        assert!(matches!(err, Error::Validation { field: "handler.environment", .. }));
    }

    #[test]
    fn test_output_target_round_trip() {
        for target in [
            OutputTarget::Stdout,
            OutputTarget::Stderr,
            OutputTarget::File("/tmp/result.json".to_string()),
        ] {
            let yaml = serde_yaml::to_string(&target).expect("serialize");
            let back: OutputTarget = serde_yaml::from_str(&yaml).expect("deserialize");
            assert_eq!(back, target);
        }
    }

    #[test]
    fn test_handler_serializes_kind_under_wire_key() {
        let handler = Handler::builder("web")
            .container(ContainerHandler {
                image: "alpine:3.20".to_string(),
                options: None,
                args: None,
            })
            .build()
            .expect("build");
        let yaml = serde_yaml::to_string(&handler).expect("serialize");
        assert!(yaml.contains("docker:"), "missing docker key:\n{yaml}");
        assert!(!yaml.contains("Container"), "variant name leaked:\n{yaml}");
    }
}
