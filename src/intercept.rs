//! The intercept lifecycle controller.
//!
//! One controller instance drives one intercept through a strict sequence:
//! connect, leave any previous intercept of the same name, start, await the
//! result payload, apply the environment, clean up. There is no internal
//! locking; callers running concurrent lifecycles must not share an intercept
//! name.
//!
//! Error policy is asymmetric on purpose. Connect and the pre-start leave are
//! best-effort: their failures are logged and swallowed. Start itself
//! propagates, because a start that did not take effect must never look like
//! one that did.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::color::{color_enabled_stderr, log_error_stderr, log_info_stderr, log_warn_stderr};
use crate::connect::ClusterConnection;
use crate::errors::{Error, Result};
use crate::output::{EnvironmentSink, OutputLoader, ProcessEnvironment};
use crate::spec::{Connection, HandlerKind, InterceptSpecification, OutputFormat, OutputTarget};
use crate::supervisor::{self, RunRequest, StreamedRun, DEFAULT_OPERATION_TIMEOUT};

/// Hosting URL variables set after a successful start, all pointing at the
/// intercepted local port.
const HOSTING_URL_VARS: [&str; 3] = ["TELEPRESENCE_URLS", "DOTNET_URLS", "ASPNETCORE_URLS"];

/// How the intercept is handed to the external tool.
enum LaunchMode {
    /// `intercept run <spec-file>`: the tool owns the whole specification and
    /// the process stays alive for the duration of the intercept.
    Specification(InterceptSpecification),
    /// `intercept <name> [flags]`: the classic one-shot form; the tool
    /// detaches and the intercept survives the invocation.
    Flags {
        name: String,
        flags: InterceptFlags,
    },
}

/// Flags for the one-shot `intercept <name>` form. The argument list is
/// rebuilt in a fixed order from the final field values; setters never
/// append to it directly.
#[derive(Debug, Clone, Default)]
pub struct InterceptFlags {
    workload: Option<String>,
    service: Option<String>,
    port: Option<String>,
    address: Option<String>,
    mechanism: Option<String>,
    env_file: Option<PathBuf>,
    env_json: Option<PathBuf>,
    mount: Option<String>,
    to_pod: Vec<String>,
    http_headers: Vec<(String, String)>,
    replace: bool,
}

impl InterceptFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workload to intercept when it differs from the intercept name.
    pub fn workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Port mapping, `local[:svcPortIdentifier]`.
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Local IP address the intercepted traffic is forwarded to.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Intercept mechanism (`tcp` or `http`).
    pub fn mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = Some(mechanism.into());
        self
    }

    /// Dotenv-style environment dump target.
    pub fn env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// JSON environment dump target; this is the file the controller waits
    /// for and loads when environment injection is requested.
    pub fn env_json(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_json = Some(path.into());
        self
    }

    /// Volume mount behavior: `true`, `false`, or a local directory.
    pub fn mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = Some(mount.into());
        self
    }

    /// Additional ports forwarded to the pod.
    pub fn to_pod(mut self, port: impl Into<String>) -> Self {
        self.to_pod.push(port.into());
        self
    }

    /// Header selector, `name=value`, repeatable.
    pub fn http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.push((name.into(), value.into()));
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// The local port extracted from the `local[:svcPortIdentifier]` mapping.
    pub(crate) fn local_port(&self) -> Option<u16> {
        self.port
            .as_deref()
            .and_then(|p| p.split(':').next())
            .and_then(|p| p.parse().ok())
    }

    pub(crate) fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(workload) = &self.workload {
            args.push("--workload".to_string());
            args.push(workload.clone());
        }
        if let Some(service) = &self.service {
            args.push("--service".to_string());
            args.push(service.clone());
        }
        if let Some(port) = &self.port {
            args.push("--port".to_string());
            args.push(port.clone());
        }
        if let Some(address) = &self.address {
            args.push("--address".to_string());
            args.push(address.clone());
        }
        if let Some(mechanism) = &self.mechanism {
            args.push("--mechanism".to_string());
            args.push(mechanism.clone());
        }
        if let Some(path) = &self.env_file {
            args.push("--env-file".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = &self.env_json {
            args.push("--env-json".to_string());
            args.push(path.display().to_string());
        }
        if let Some(mount) = &self.mount {
            args.push("--mount".to_string());
            args.push(mount.clone());
        }
        for port in &self.to_pod {
            args.push("--to-pod".to_string());
            args.push(port.clone());
        }
        for (name, value) in &self.http_headers {
            args.push("--http-header".to_string());
            args.push(format!("{name}={value}"));
        }
        if self.replace {
            args.push("--replace".to_string());
        }
        args
    }
}

pub struct InterceptBuilder {
    specification: Option<InterceptSpecification>,
    flags: Option<(String, InterceptFlags)>,
    connection: Option<Connection>,
    inject_environment: bool,
    include_env: BTreeMap<String, String>,
    exclude_env: BTreeSet<String>,
    use_selector: Option<String>,
    start_timeout: Duration,
    tool: Option<PathBuf>,
    sink: Option<Box<dyn EnvironmentSink>>,
}

impl Default for InterceptBuilder {
    fn default() -> Self {
        Self {
            specification: None,
            flags: None,
            connection: None,
            inject_environment: true,
            include_env: BTreeMap::new(),
            exclude_env: BTreeSet::new(),
            use_selector: None,
            start_timeout: DEFAULT_OPERATION_TIMEOUT,
            tool: None,
            sink: None,
        }
    }
}

impl InterceptBuilder {
    /// Drive the intercept from a full specification file.
    pub fn specification(mut self, spec: InterceptSpecification) -> Self {
        self.specification = Some(spec);
        self
    }

    /// Drive the intercept with the one-shot flag form.
    pub fn flags(mut self, name: impl Into<String>, flags: InterceptFlags) -> Self {
        self.flags = Some((name.into(), flags));
        self
    }

    /// Connection used by flag-mode intercepts. Specification-mode intercepts
    /// carry their own connection and ignore this.
    pub fn connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Whether the intercepted pod's environment is applied locally after a
    /// successful start. Defaults to true.
    pub fn inject_environment(mut self, inject: bool) -> Self {
        self.inject_environment = inject;
        self
    }

    /// Extra environment entry applied after the loaded payload, overriding it.
    pub fn include_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.include_env.insert(name.into(), value.into());
        self
    }

    /// Name excluded from the manual overrides.
    pub fn exclude_env(mut self, name: impl Into<String>) -> Self {
        self.exclude_env.insert(name.into());
        self
    }

    /// Selector passed to `leave --use` when multiple intercept backends match.
    pub fn use_selector(mut self, selector: impl Into<String>) -> Self {
        self.use_selector = Some(selector.into());
        self
    }

    /// Ceiling for the start sequence, including the wait for the result
    /// payload. Defaults to 30 seconds.
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Explicit path to the external binary instead of a PATH lookup.
    pub fn tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool = Some(path.into());
        self
    }

    /// Where loaded environment entries land. Defaults to the real process
    /// environment.
    pub fn environment_sink(mut self, sink: Box<dyn EnvironmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Intercept> {
        let mode = match (self.specification, self.flags) {
            (Some(spec), None) => LaunchMode::Specification(spec),
            (None, Some((name, flags))) => LaunchMode::Flags { name, flags },
            _ => {
                return Err(Error::validation(
                    "intercept",
                    "exactly one of specification or flags must be set",
                ))
            }
        };
        let connection = match &mode {
            LaunchMode::Specification(spec) => spec.connection().clone(),
            LaunchMode::Flags { .. } => match self.connection {
                Some(connection) => connection,
                None => Connection::builder().build()?,
            },
        };
        let tool = match self.tool {
            Some(tool) => tool,
            None => supervisor::tool_path()?,
        };
        Ok(Intercept {
            tool: tool.clone(),
            connection: ClusterConnection::with_tool(tool, connection),
            mode,
            inject_environment: self.inject_environment,
            include_env: self.include_env,
            exclude_env: self.exclude_env,
            use_selector: self.use_selector,
            start_timeout: self.start_timeout,
            sink: self.sink.unwrap_or_else(|| Box::new(ProcessEnvironment)),
            run: None,
            started: false,
        })
    }
}

/// Drives one intercept through its lifecycle against the external tool.
pub struct Intercept {
    tool: PathBuf,
    connection: ClusterConnection,
    mode: LaunchMode,
    inject_environment: bool,
    include_env: BTreeMap<String, String>,
    exclude_env: BTreeSet<String>,
    use_selector: Option<String>,
    start_timeout: Duration,
    sink: Box<dyn EnvironmentSink>,
    run: Option<StreamedRun>,
    started: bool,
}

impl Intercept {
    pub fn builder() -> InterceptBuilder {
        InterceptBuilder::default()
    }

    pub fn name(&self) -> &str {
        match &self.mode {
            LaunchMode::Specification(spec) => spec.name(),
            LaunchMode::Flags { name, .. } => name,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Connects the daemon to the cluster. Failures are logged and swallowed.
    pub fn connect(&mut self, token: &CancellationToken) -> Result<()> {
        self.connection.connect(token)
    }

    /// Runs the full start sequence. Each step is bounded by `start_timeout`
    /// combined with the caller's token.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(name = self.name())))]
    pub fn start(&mut self, token: &CancellationToken) -> Result<()> {
        let use_err = color_enabled_stderr();
        // Each sequenced step gets its own ceiling; a hung connect must not
        // eat the budget of the wait for the intercept's output.
        self.connection
            .connect(&token.linked_with_timeout(self.start_timeout))?;
        // A stale intercept of the same name would make the new start a
        // silent no-op on the cluster side.
        self.leave(&token.linked_with_timeout(self.start_timeout))?;
        let deadline = token.linked_with_timeout(self.start_timeout);

        let result = match &self.mode {
            LaunchMode::Specification(spec) => {
                let spec = spec.clone();
                self.start_from_specification(&spec, &deadline)
            }
            LaunchMode::Flags { name, flags } => {
                let (name, flags) = (name.clone(), flags.clone());
                self.start_from_flags(&name, &flags, &deadline)
            }
        };
        match result {
            Ok(()) => {
                self.started = true;
                log_info_stderr(use_err, &format!("intercept '{}' started", self.name()));
                Ok(())
            }
            Err(e) => {
                log_error_stderr(use_err, &format!("start failed: {e}"));
                Err(e)
            }
        }
    }

    fn start_from_specification(
        &mut self,
        spec: &InterceptSpecification,
        token: &CancellationToken,
    ) -> Result<()> {
        let path = spec.file_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, spec.to_yaml()?)?;

        let request = RunRequest::new(&self.tool)
            .arg("intercept")
            .arg("run")
            .arg(path.display().to_string());
        let mut run = StreamedRun::spawn(request)?;

        if self.inject_environment {
            let external = spec.handlers().iter().find_map(|h| match h.kind() {
                HandlerKind::External(external) => Some(external.clone()),
                _ => None,
            });
            match external {
                Some(external) => {
                    if external.output_format != OutputFormat::Json {
                        run.terminate();
                        return Err(Error::UnsupportedFormat("yaml".to_string()));
                    }
                    self.await_and_load(&external.output_path, &mut run, token)?;
                }
                None => {
                    run.terminate();
                    return Err(Error::NotImplemented(
                        "environment injection for container and script handlers",
                    ));
                }
            }
            self.apply_overrides_and_urls(first_local_port(spec));
        }

        self.run = Some(run);
        Ok(())
    }

    fn await_and_load(
        &mut self,
        target: &OutputTarget,
        run: &mut StreamedRun,
        token: &CancellationToken,
    ) -> Result<()> {
        match target {
            OutputTarget::Stdout => {
                let line = run.await_line(token, is_payload_line);
                match line {
                    Some(line) => OutputLoader::load_from_str(&line, self.sink.as_mut()),
                    None => {
                        run.terminate();
                        Err(Error::UnableToStartIntercept)
                    }
                }
            }
            OutputTarget::Stderr => {
                let line = await_stderr_payload(run, token);
                match line {
                    Some(line) => OutputLoader::load_from_str(&line, self.sink.as_mut()),
                    None => {
                        run.terminate();
                        Err(Error::UnableToStartIntercept)
                    }
                }
            }
            OutputTarget::File(raw) => {
                let path = PathBuf::from(raw);
                if !supervisor::wait_for_file(&path, token) {
                    run.terminate();
                    return Err(Error::UnableToStartIntercept);
                }
                OutputLoader::load_from_file(&path, self.sink.as_mut(), token)?;
                remove_artifact(&path);
                Ok(())
            }
        }
    }

    fn start_from_flags(
        &mut self,
        name: &str,
        flags: &InterceptFlags,
        token: &CancellationToken,
    ) -> Result<()> {
        let request = RunRequest::new(&self.tool)
            .arg("intercept")
            .arg(name)
            .args(flags.to_args())
            .timeout(self.start_timeout);
        let outcome = supervisor::run(request, token)?;
        if outcome.status.is_none() {
            return Err(Error::Cancelled);
        }
        if !outcome.success() {
            return Err(Error::Subprocess(outcome.stderr_text()));
        }

        if self.inject_environment {
            // The JSON dump is preferred when both targets are configured;
            // either way the configured file is waited for and routed through
            // the loader, so the dotenv format fails loudly instead of being
            // skipped.
            let dump = flags.env_json.clone().or_else(|| flags.env_file.clone());
            if let Some(path) = dump {
                if !supervisor::wait_for_file(&path, token) {
                    return Err(Error::UnableToStartIntercept);
                }
                OutputLoader::load_from_file(&path, self.sink.as_mut(), token)?;
                remove_artifact(&path);
            }
            self.apply_overrides_and_urls(flags.local_port());
        }
        Ok(())
    }

    fn apply_overrides_and_urls(&mut self, local_port: Option<u16>) {
        OutputLoader::apply_overrides(
            &self.include_env,
            Some(&self.exclude_env),
            self.sink.as_mut(),
        );
        if let Some(port) = local_port {
            let url = format!("http://+:{port}");
            for var in HOSTING_URL_VARS {
                self.sink.set(var, &url);
            }
        }
    }

    /// Removes the intercept from the cluster. A "not found" answer counts as
    /// success and any other failure is logged as a warning; either way the
    /// name-derived temp directory is deleted.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(name = self.name())))]
    pub fn leave(&mut self, token: &CancellationToken) -> Result<()> {
        if let Some(mut run) = self.run.take() {
            run.terminate();
        }
        let mut request = RunRequest::new(&self.tool).arg("leave").arg(self.name());
        if let Some(selector) = &self.use_selector {
            request = request.arg("--use").arg(selector.clone());
        }
        match supervisor::run(request, token) {
            Ok(outcome)
                if outcome.success()
                    || outcome.stderr_text().to_lowercase().contains("not found") => {}
            Ok(outcome) => {
                log_warn_stderr(
                    color_enabled_stderr(),
                    &format!("leave did not succeed: {}", outcome.stderr_text()),
                );
            }
            Err(e) => {
                log_warn_stderr(color_enabled_stderr(), &format!("leave failed: {e}"));
            }
        }
        self.started = false;
        self.remove_temporary_directory();
        Ok(())
    }

    /// Quits the daemon. Only meaningful for flag-mode intercepts; the
    /// specification-driven flow leaves the daemon alone so sibling
    /// specifications sharing it keep working.
    pub fn quit(&mut self, stop_daemons: bool, token: &CancellationToken) -> Result<()> {
        match &self.mode {
            LaunchMode::Specification(_) => Err(Error::NotImplemented(
                "quit for specification-driven intercepts",
            )),
            LaunchMode::Flags { .. } => {
                self.connection.quit(stop_daemons, token);
                Ok(())
            }
        }
    }

    /// Quits the daemon without `--stop-daemons`. Available in both modes,
    /// unlike [`Intercept::quit`]: it cannot take the shared background
    /// daemons down, so sibling specifications are unaffected.
    pub fn disconnect(&mut self, token: &CancellationToken) {
        self.connection.disconnect(token);
    }

    fn remove_temporary_directory(&self) {
        if let LaunchMode::Specification(spec) = &self.mode {
            let dir = spec.temporary_directory();
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    log_warn_stderr(
                        color_enabled_stderr(),
                        &format!("could not remove {}: {e}", dir.display()),
                    );
                }
            }
        }
    }
}

fn first_local_port(spec: &InterceptSpecification) -> Option<u16> {
    spec.workloads()
        .first()
        .and_then(|w| w.intercepts().first())
        .map(|i| i.local_port())
}

/// Result payloads are the only stdout/stderr lines that are a JSON object
/// carrying an environment map.
fn is_payload_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('{') && trimmed.contains("\"environment\"")
}

fn await_stderr_payload(run: &mut StreamedRun, token: &CancellationToken) -> Option<String> {
    let mut seen = 0;
    loop {
        let lines = run.stderr_lines();
        for line in &lines[seen..] {
            if is_payload_line(line) {
                return Some(line.clone());
            }
        }
        seen = lines.len();
        if token.is_cancelled() {
            return None;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn remove_artifact(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log_warn_stderr(
            color_enabled_stderr(),
            &format!("could not remove {}: {e}", path.display()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Connection;

    fn test_connection() -> Connection {
        Connection::builder()
            .context("kind")
            .namespace("default")
            .build()
            .expect("build connection")
    }

    fn test_specification() -> InterceptSpecification {
        InterceptSpecification::builder()
            .name("web")
            .connection(test_connection())
            .build()
            .expect("build spec")
    }

    #[test]
    fn test_builder_requires_exactly_one_mode() {
        match Intercept::builder().tool_path("/usr/bin/true").build() {
            Ok(_) => panic!("no mode accepted"),
            Err(Error::Validation { field, .. }) => assert_eq!(field, "intercept"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }

        match Intercept::builder()
            .specification(test_specification())
            .flags("web", InterceptFlags::new())
            .tool_path("/usr/bin/true")
            .build()
        {
            Ok(_) => panic!("both modes accepted"),
            Err(Error::Validation { field, .. }) => assert_eq!(field, "intercept"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_quit_is_unimplemented_in_specification_mode() {
        let mut intercept = Intercept::builder()
            .specification(test_specification())
            .tool_path("/usr/bin/true")
            .build()
            .expect("build");
        let err = intercept
            .quit(false, &CancellationToken::new())
            .expect_err("spec-mode quit succeeded");
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_disconnect_is_allowed_in_specification_mode() {
        let mut intercept = Intercept::builder()
            .specification(test_specification())
            .tool_path("/usr/bin/true")
            .build()
            .expect("build");
        // Only quit is reserved; detaching the connection is always allowed.
        intercept.disconnect(&CancellationToken::new());
    }

    #[test]
    fn test_flag_args_are_rebuilt_in_fixed_order() {
        let flags = InterceptFlags::new()
            .replace(true)
            .http_header("x-dev", "me")
            .env_json("/tmp/env.json")
            .port("8080:http")
            .service("web-svc");
        assert_eq!(
            flags.to_args(),
            vec![
                "--service",
                "web-svc",
                "--port",
                "8080:http",
                "--env-json",
                "/tmp/env.json",
                "--http-header",
                "x-dev=me",
                "--replace",
            ]
        );
    }

    #[test]
    fn test_local_port_extracted_from_mapping() {
        assert_eq!(InterceptFlags::new().port("8080:http").local_port(), Some(8080));
        assert_eq!(InterceptFlags::new().port("9090").local_port(), Some(9090));
        assert_eq!(InterceptFlags::new().local_port(), None);
    }

    #[test]
    fn test_payload_line_detection() {
        assert!(is_payload_line(r#"{"environment": {"A": "1"}}"#));
        assert!(is_payload_line(r#"  {"name": "x", "environment": {}}"#));
        assert!(!is_payload_line("connected to context default"));
        assert!(!is_payload_line(r#"{"name": "x"}"#));
    }

    #[test]
    fn test_name_comes_from_the_active_mode() {
        let intercept = Intercept::builder()
            .flags("api", InterceptFlags::new())
            .connection(test_connection())
            .tool_path("/usr/bin/true")
            .build()
            .expect("build");
        assert_eq!(intercept.name(), "api");
    }
}
