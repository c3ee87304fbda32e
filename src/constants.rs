//! Well-known names shared with the external tooling.

/// Name of the external CLI binary this crate drives.
pub const TOOL_NAME: &str = "telepresence";

/// Marker substring; any header whose name contains it is captured into the
/// intercept context and propagated onto outbound calls.
pub const HEADER_MARKER: &str = "x-telepresence";

/// Header identifying which developer an intercepted call belongs to.
pub const INTERCEPT_AS_HEADER: &str = "x-telepresence-intercept-as";

/// Header carrying the caller's intercept id towards the sidecar API.
pub const INTERCEPT_ID_HEADER: &str = "x-telepresence-caller-intercept-id";

/// Environment variable naming the intercept the current process runs under.
pub const INTERCEPT_AS_ENV: &str = "TELEPRESENCE_INTERCEPT_AS";

/// Environment variable carrying the id of the running intercept.
pub const INTERCEPT_ID_ENV: &str = "TELEPRESENCE_INTERCEPT_ID";

/// Port of the sidecar RESTful API injected by the traffic agent.
pub const API_PORT_ENV: &str = "TELEPRESENCE_API_PORT";
