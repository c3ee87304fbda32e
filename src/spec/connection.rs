//! Cluster connection properties for the `connect` step of a lifecycle.

use serde::{Deserialize, Serialize};

use crate::errors::{reasons, Error, Result};
use crate::kubeconfig;
use crate::spec::validate;

/// Connection properties used when the external tool connects to the cluster.
///
/// Immutable once built; construct through [`ConnectionBuilder`], which fills
/// convention defaults (current kubeconfig context/namespace, `context-namespace`
/// connection name) at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub(crate) name: String,
    pub(crate) context: String,
    pub(crate) namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) manager_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mapped_namespaces: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) also_proxy: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) never_proxy: Option<Vec<String>>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub(crate) impersonate_user: Option<String>,
    #[serde(rename = "asGroups", skip_serializing_if = "Option::is_none")]
    pub(crate) impersonate_groups: Option<Vec<String>>,
    #[serde(rename = "asUID", skip_serializing_if = "Option::is_none")]
    pub(crate) impersonate_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) user: Option<String>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Flags for the `connect` subcommand, rebuilt deterministically from the
    /// final state (never accumulated per-setter).
    pub(crate) fn connect_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        args.push("--context".to_string());
        args.push(self.context.clone());
        args.push("--namespace".to_string());
        args.push(self.namespace.clone());
        if let Some(ns) = &self.manager_namespace {
            args.push("--manager-namespace".to_string());
            args.push(ns.clone());
        }
        if let Some(mapped) = &self.mapped_namespaces {
            args.push("--mapped-namespaces".to_string());
            args.push(mapped.join(","));
        }
        for cidr in self.also_proxy.iter().flatten() {
            args.push("--also-proxy".to_string());
            args.push(cidr.clone());
        }
        for cidr in self.never_proxy.iter().flatten() {
            args.push("--never-proxy".to_string());
            args.push(cidr.clone());
        }
        if let Some(user) = &self.impersonate_user {
            args.push("--as".to_string());
            args.push(user.clone());
        }
        for group in self.impersonate_groups.iter().flatten() {
            args.push("--as-group".to_string());
            args.push(group.clone());
        }
        if let Some(uid) = &self.impersonate_uid {
            args.push("--as-uid".to_string());
            args.push(uid.clone());
        }
        if let Some(cluster) = &self.cluster {
            args.push("--cluster".to_string());
            args.push(cluster.clone());
        }
        if let Some(user) = &self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    name: Option<String>,
    context: Option<String>,
    namespace: Option<String>,
    manager_namespace: Option<String>,
    mapped_namespaces: Option<Vec<String>>,
    also_proxy: Option<Vec<String>>,
    never_proxy: Option<Vec<String>>,
    impersonate_user: Option<String>,
    impersonate_groups: Option<Vec<String>>,
    impersonate_uid: Option<String>,
    cluster: Option<String>,
    user: Option<String>,
}

impl ConnectionBuilder {
    /// Explicit connection name. Defaults to `<context>-<namespace>`,
    /// lowercased with underscores replaced by hyphens.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Kubeconfig context. Defaults to the kubeconfig's current context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Namespace this connection is bound to. Defaults to the namespace
    /// appointed by the context.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Namespace where the traffic manager lives.
    pub fn manager_namespace(mut self, ns: impl Into<String>) -> Self {
        self.manager_namespace = Some(ns.into());
        self
    }

    /// Namespaces the external tool will be concerned with.
    pub fn mapped_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mapped_namespaces = Some(namespaces.into_iter().map(Into::into).collect());
        self
    }

    /// Additional CIDRs to proxy.
    pub fn also_proxy<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.also_proxy = Some(cidrs.into_iter().map(Into::into).collect());
        self
    }

    /// CIDRs to never proxy.
    pub fn never_proxy<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.never_proxy = Some(cidrs.into_iter().map(Into::into).collect());
        self
    }

    /// Username to impersonate for the operation.
    pub fn impersonate_user(mut self, user: impl Into<String>) -> Self {
        self.impersonate_user = Some(user.into());
        self
    }

    /// Groups to impersonate for the operation.
    pub fn impersonate_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.impersonate_groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// UID to impersonate for the operation.
    pub fn impersonate_uid(mut self, uid: impl Into<String>) -> Self {
        self.impersonate_uid = Some(uid.into());
        self
    }

    /// Kubeconfig cluster name.
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Kubeconfig user name.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn build(self) -> Result<Connection> {
        let context = match self.context {
            Some(c) if !c.trim().is_empty() => c,
            _ => kubeconfig::current_context().ok_or(Error::validation(
                "connection.context",
                reasons::CANT_DETERMINE_NAME,
            ))?,
        };
        let namespace = match self.namespace {
            Some(ns) => ns,
            None => kubeconfig::current_namespace().unwrap_or_else(|| "default".to_string()),
        };
        if !validate::is_namespace(&namespace) {
            return Err(Error::validation(
                "connection.namespace",
                reasons::ALPHANUMERIC_WITH_HYPHENS,
            ));
        }
        if let Some(ns) = &self.manager_namespace {
            if !validate::is_namespace(ns) {
                return Err(Error::validation(
                    "connection.managerNamespace",
                    reasons::ALPHANUMERIC_WITH_HYPHENS,
                ));
            }
        }
        for ns in self.mapped_namespaces.iter().flatten() {
            if !validate::is_namespace(ns) {
                return Err(Error::validation(
                    "connection.mappedNamespaces",
                    reasons::ALPHANUMERIC_WITH_HYPHENS,
                ));
            }
        }
        let name = match self.name {
            Some(n) => n,
            None => validate::normalize_name(&format!("{context}-{namespace}")),
        };
        if name.len() > 64 {
            return Err(Error::validation(
                "connection.name",
                reasons::CANT_EXCEED_64_CHARACTERS,
            ));
        }
        if !validate::is_resource_name(&name) {
            return Err(Error::validation(
                "connection.name",
                reasons::ALPHANUMERIC_WITH_HYPHENS,
            ));
        }
        Ok(Connection {
            name,
            context,
            namespace,
            manager_namespace: self.manager_namespace,
            mapped_namespaces: self.mapped_namespaces,
            also_proxy: self.also_proxy,
            never_proxy: self.never_proxy,
            impersonate_user: self.impersonate_user,
            impersonate_groups: self.impersonate_groups,
            impersonate_uid: self.impersonate_uid,
            cluster: self.cluster,
            user: self.user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_is_normalized_context_namespace() {
        let conn = Connection::builder()
            .context("Docker_Desktop")
            .namespace("emojivoto")
            .build()
            .expect("build connection");
        assert_eq!(conn.name(), "docker-desktop-emojivoto");
    }

    #[test]
    fn test_explicit_name_is_validated() {
        let err = Connection::builder()
            .context("kind")
            .namespace("default")
            .name("Not_Allowed")
            .build()
            .expect_err("uppercase name accepted");
        match err {
            Error::Validation { field, .. } => assert_eq!(field, "connection.name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_name_longer_than_64_rejected() {
        let err = Connection::builder()
            .context("kind")
            .namespace("default")
            .name("a".repeat(65))
            .build()
            .expect_err("overlong name accepted");
        assert!(matches!(err, Error::Validation { field: "connection.name", .. }));
    }

    #[test]
    fn test_bad_namespace_rejected() {
        let err = Connection::builder()
            .context("kind")
            .namespace("Bad_NS")
            .build()
            .expect_err("bad namespace accepted");
        assert!(matches!(err, Error::Validation { field: "connection.namespace", .. }));
    }

    #[test]
    fn test_connect_args_are_deterministic() {
        let conn = Connection::builder()
            .context("kind")
            .namespace("default")
            .manager_namespace("ambassador")
            .mapped_namespaces(["a", "b"])
            .also_proxy(["10.0.0.0/8"])
            .impersonate_user("dev")
            .build()
            .expect("build connection");
        let args = conn.connect_args();
        assert_eq!(
            args,
            vec![
                "--context",
                "kind",
                "--namespace",
                "default",
                "--manager-namespace",
                "ambassador",
                "--mapped-namespaces",
                "a,b",
                "--also-proxy",
                "10.0.0.0/8",
                "--as",
                "dev",
            ]
        );
    }
}
