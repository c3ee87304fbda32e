//! Client library around the Telepresence CLI.
//!
//! Three capabilities, composable but independent:
//!
//! - **Specification model** ([`spec`]): a builder-based, validated model of
//!   an intercept specification, serialized to the YAML the CLI consumes.
//! - **Lifecycle control** ([`Intercept`], [`ClusterConnection`]): drives
//!   connect, start, leave and quit against the `telepresence` binary, waits
//!   for the result payload and injects the intercepted pod's environment
//!   into the local process (or any [`EnvironmentSink`]).
//! - **Header propagation** ([`propagation`], [`api`]): captures the
//!   `x-telepresence` routing headers from inbound calls, re-emits them on
//!   outbound HTTP requests and broker messages, and gates message
//!   consumption through the sidecar API, failing open throughout.
//!
//! Execution is synchronous; bounded waits take a [`CancellationToken`].

pub mod api;
mod cancel;
pub mod color;
mod connect;
mod constants;
mod errors;
mod intercept;
mod kubeconfig;
mod output;
pub mod propagation;
pub mod spec;
mod supervisor;
#[cfg(feature = "tracing")]
pub mod telemetry;

pub use cancel::CancellationToken;
pub use connect::ClusterConnection;
pub use constants::{
    API_PORT_ENV, HEADER_MARKER, INTERCEPT_AS_ENV, INTERCEPT_AS_HEADER, INTERCEPT_ID_ENV,
    INTERCEPT_ID_HEADER, TOOL_NAME,
};
pub use errors::{Error, Result};
pub use intercept::{Intercept, InterceptBuilder, InterceptFlags};
pub use output::{
    EnvironmentSink, InterceptOutput, InterceptResult, IngressResult, MemoryEnvironment,
    MountResult, OutputLoader, ProcessEnvironment,
};
