//! Minimal kubeconfig lookup: current context name and its default namespace.
//!
//! Only the two values the connection defaults need are read; everything else
//! in the kubeconfig is left to the external tool. `KUBECONFIG` takes
//! precedence over `~/.kube/config`, matching kubectl.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    contexts: Option<Vec<NamedContext>>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: Option<ContextEntry>,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    namespace: Option<String>,
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    home::home_dir().map(|h| h.join(".kube").join("config"))
}

fn load() -> Option<KubeConfig> {
    let contents = std::fs::read_to_string(config_path()?).ok()?;
    serde_yaml::from_str(&contents).ok()
}

/// The kubeconfig's current context name, if one is configured.
pub fn current_context() -> Option<String> {
    load()?.current_context
}

/// The namespace appointed by the current context. Falls back to "default"
/// when the context exists but names no namespace.
pub fn current_namespace() -> Option<String> {
    let config = load()?;
    let current = config.current_context?;
    let contexts = config.contexts?;
    let entry = contexts.into_iter().find(|c| c.name == current)?;
    Some(
        entry
            .context
            .and_then(|c| c.namespace)
            .unwrap_or_else(|| "default".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &std::path::Path, contents: &str) -> PathBuf {
        let path = dir.join("config");
        let mut f = std::fs::File::create(&path).expect("create kubeconfig");
        f.write_all(contents.as_bytes()).expect("write kubeconfig");
        path
    }

    #[test]
    fn test_parses_current_context_and_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            "current-context: minikube\ncontexts:\n- name: minikube\n  context:\n    cluster: minikube\n    namespace: emojivoto\n",
        );
        let contents = std::fs::read_to_string(&path).unwrap();
        let config: KubeConfig = serde_yaml::from_str(&contents).unwrap();
        assert_eq!(config.current_context.as_deref(), Some("minikube"));
        let ns = config.contexts.unwrap()[0]
            .context
            .as_ref()
            .and_then(|c| c.namespace.clone());
        assert_eq!(ns.as_deref(), Some("emojivoto"));
    }

    #[test]
    fn test_context_without_namespace_falls_back_to_default() {
        let contents = "current-context: kind\ncontexts:\n- name: kind\n  context:\n    cluster: kind\n";
        let config: KubeConfig = serde_yaml::from_str(contents).unwrap();
        let current = config.current_context.unwrap();
        let entry = config
            .contexts
            .unwrap()
            .into_iter()
            .find(|c| c.name == current)
            .unwrap();
        let ns = entry
            .context
            .and_then(|c| c.namespace)
            .unwrap_or_else(|| "default".to_string());
        assert_eq!(ns, "default");
    }
}
