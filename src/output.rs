//! Result payload parsing and environment injection.
//!
//! The external tool reports the intercepted pod's environment as a JSON
//! payload, either inline on a stream or written to a file. Only the
//! environment maps are consumed here; everything else in the payload is
//! modeled but passed through untouched.
//!
//! All mutation goes through an [`EnvironmentSink`], so tests can observe an
//! in-memory map instead of the real process environment. The default sink
//! mutates process-wide state: callers running concurrent lifecycles must
//! serialize access themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::errors::{Error, Result};
use crate::supervisor;

/// Somewhere to apply discovered environment entries.
pub trait EnvironmentSink {
    fn set(&mut self, key: &str, value: &str);
    fn get(&self, key: &str) -> Option<String>;
}

/// The real process environment. Process-wide, unguarded state.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl EnvironmentSink for ProcessEnvironment {
    fn set(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// An in-memory sink for tests and for embedders that stage the environment
/// before deciding to apply it.
#[derive(Debug, Default, Clone)]
pub struct MemoryEnvironment {
    values: BTreeMap<String, String>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

impl EnvironmentSink for MemoryEnvironment {
    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Top-level result payload produced by the external tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterceptOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepts: Option<Vec<InterceptResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

/// Per-intercept result entry. Only `environment` is consumed by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterceptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(rename = "workload_kind", skip_serializing_if = "Option::is_none")]
    pub workload_kind: Option<String>,
    #[serde(rename = "target_host", skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(rename = "target_port", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(rename = "service_port_id", skip_serializing_if = "Option::is_none")]
    pub service_port_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountResult>,
    #[serde(rename = "filter_desc", skip_serializing_if = "Option::is_none")]
    pub filter_description: Option<String>,
    #[serde(rename = "http_filter", skip_serializing_if = "Option::is_none")]
    pub http_filters: Option<Vec<String>>,
    #[serde(rename = "preview_url", skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressResult>,
}

/// Remote volume mount info, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountResult {
    #[serde(rename = "local_dir", skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<String>,
    #[serde(rename = "remote_dir", skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "pod_ip", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<String>>,
}

/// Ingress info, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l5host: Option<String>,
}

/// Loads environment entries from a result payload into a sink.
pub struct OutputLoader;

impl OutputLoader {
    /// Dispatches on file extension. JSON is supported; the YAML and dotenv
    /// formats are declared by the external tool but intentionally
    /// unimplemented here, and fail loudly rather than silently skipping.
    /// Unknown extensions and missing files are no-ops.
    pub fn load_from_file(
        path: &Path,
        sink: &mut dyn EnvironmentSink,
        token: &CancellationToken,
    ) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Self::load_json_file(path, sink, token),
            "yaml" | "yml" => Err(Error::UnsupportedFormat("yaml".to_string())),
            "env" => Err(Error::UnsupportedFormat("dotenv".to_string())),
            _ => Ok(()),
        }
    }

    /// Parses an inline JSON payload with the same schema as the file form.
    pub fn load_from_str(payload: &str, sink: &mut dyn EnvironmentSink) -> Result<()> {
        let output: InterceptOutput = serde_json::from_str(payload)?;
        Self::apply_output(&output, sink);
        Ok(())
    }

    fn load_json_file(
        path: &Path,
        sink: &mut dyn EnvironmentSink,
        token: &CancellationToken,
    ) -> Result<()> {
        // The writer may still hold an exclusive lock right after creating
        // the file; wait until it can be opened for shared reading.
        supervisor::wait_for_readable_file(path, token);
        let contents = std::fs::read_to_string(path)?;
        let output: InterceptOutput = serde_json::from_str(&contents)?;
        Self::apply_output(&output, sink);
        Ok(())
    }

    /// Per-intercept environment of the first intercept first, then the
    /// top-level override map, which therefore wins on conflicting keys.
    fn apply_output(output: &InterceptOutput, sink: &mut dyn EnvironmentSink) {
        if let Some(first) = output.intercepts.iter().flatten().next() {
            if let Some(environment) = &first.environment {
                for (key, value) in environment {
                    sink.set(key, value);
                }
            }
        }
        if let Some(environment) = &output.environment {
            for (key, value) in environment {
                sink.set(key, value);
            }
        }
    }

    /// Applies caller-supplied overrides last (highest precedence). Keys in
    /// the exclude set are removed from the include map before it is applied.
    pub fn apply_overrides(
        include: &BTreeMap<String, String>,
        exclude: Option<&BTreeSet<String>>,
        sink: &mut dyn EnvironmentSink,
    ) {
        for (key, value) in include {
            if exclude.map(|ex| ex.contains(key)).unwrap_or(false) {
                continue;
            }
            sink.set(key, value);
        }
    }
}
