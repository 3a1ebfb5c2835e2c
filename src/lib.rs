//! Whitebox controller - a generic, configuration-driven Kubernetes controller
//! framework.
//!
//! Instead of compiling reconciliation logic into the controller binary, the
//! framework delegates every decision about desired state to an external
//! handler: a child process fed JSON on stdin, or an HTTP endpoint receiving a
//! JSON POST. The framework watches the cluster, assembles a snapshot of the
//! observed state, invokes the handler, validates the returned snapshot, and
//! applies the difference back to the cluster.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration model and validation
//! - [`client`] - cluster access abstraction over the Kubernetes API
//! - [`handler`] - handler transports (subprocess, HTTP) and typed facades
//! - [`reconciler`] - the per-resource reconcile loop and state snapshot
//! - [`syncer`] - periodic resync pulses for time-driven reconciliation
//! - [`controller`] - per-resource controller wiring (watches and queues)
//! - [`webhook`] - admission and injection webhook server
//! - [`manager`] - component assembly and lifecycle
//! - [`error`] - error types for the framework

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod manager;
pub mod reconciler;
pub mod syncer;
pub mod webhook;

pub use error::Error;

/// Result type alias using the framework's error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable that forces debug logging on every handler
/// transport, regardless of per-handler configuration.
pub const DEBUG_ENV_VAR: &str = "WHITEBOX_DEBUG";

/// Default deadline for a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Default port for the webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 443;

/// How long the webhook server waits for in-flight requests on shutdown
pub const WEBHOOK_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
