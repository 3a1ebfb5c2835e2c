//! Configuration model for the controller framework.
//!
//! A single YAML file declares every resource the framework manages, the
//! external handlers to invoke for reconciliation and admission, and the
//! webhook server settings. The file is loaded once at startup, validated,
//! and frozen for the lifetime of the process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::core::GroupVersionKind;
use serde::Deserialize;

use crate::handler::Handler;
use crate::{Error, Result};

/// Top-level configuration: the set of managed resources plus optional
/// webhook and metrics server settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Resources managed by this controller process
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Webhook server settings, required when any resource declares a
    /// validator, mutator or injector
    #[serde(default)]
    pub webhook: Option<ServerConfig>,
    /// Metrics server settings; binding the endpoint is delegated to the
    /// embedding process
    #[serde(default)]
    pub metrics: Option<ServerConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&buf)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(Error::config("at least one resource must be specified"));
        }

        for (i, resource) in self.resources.iter().enumerate() {
            resource
                .validate()
                .map_err(|e| Error::config(format!("resources[{i}]: {e}")))?;
        }

        if self.resources.iter().any(ResourceConfig::has_webhook) {
            let webhook = self
                .webhook
                .as_ref()
                .ok_or_else(|| Error::config("webhook: configuration must be specified"))?;
            webhook
                .validate_tls()
                .map_err(|e| Error::config(format!("webhook: {e}")))?;
        }

        Ok(())
    }
}

/// Group/version/kind triple as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GvkConfig {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind name
    #[serde(default)]
    pub kind: String,
}

impl GvkConfig {
    /// Whether any required component is missing.
    pub fn is_empty(&self) -> bool {
        self.version.is_empty() || self.kind.is_empty()
    }

    /// Convert to the kube representation.
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

/// Per-resource configuration: the primary kind, its dependents and
/// references, and the handlers wired to it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// The primary kind this resource block manages
    #[serde(flatten)]
    pub resource: GvkConfig,
    /// Kinds owned by the primary, eligible for create/update/delete
    #[serde(default)]
    pub dependents: Vec<DependentConfig>,
    /// Kinds looked up by field path and passed read-only to the handler
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,
    /// Reconcile handler settings
    #[serde(default)]
    pub reconciler: Option<ReconcilerConfig>,
    /// Finalize handler, invoked while the primary is being deleted
    #[serde(default)]
    pub finalizer: Option<HandlerConfig>,
    /// Interval at which all instances are re-queued ("30s", "5m", ...)
    #[serde(default)]
    pub resync_period: Option<String>,
    /// Admission validation handler
    #[serde(default)]
    pub validator: Option<HandlerConfig>,
    /// Admission mutation handler
    #[serde(default)]
    pub mutator: Option<HandlerConfig>,
    /// Token-authenticated injection handler
    #[serde(default)]
    pub injector: Option<InjectorConfig>,
}

impl ResourceConfig {
    /// The primary kind as a kube GVK.
    pub fn gvk(&self) -> GroupVersionKind {
        self.resource.gvk()
    }

    /// Controller name for this resource, used for event reporting and
    /// logging: `lower(kind)-controller`.
    pub fn controller_name(&self) -> String {
        format!("{}-controller", self.resource.kind.to_lowercase())
    }

    /// Finalizer string placed on the primary while a finalize handler is
    /// configured: `lower(kind)-controller.group`.
    pub fn finalizer_name(&self) -> String {
        format!("{}.{}", self.controller_name(), self.resource.group)
    }

    /// Whether this resource registers any webhook endpoint.
    pub fn has_webhook(&self) -> bool {
        self.validator.is_some() || self.mutator.is_some() || self.injector.is_some()
    }

    /// Parsed resync period, if configured.
    pub fn resync_period(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.resync_period.as_deref())
    }

    fn validate(&self) -> Result<()> {
        if self.resource.is_empty() {
            return Err(Error::config("resource group/version/kind is empty"));
        }

        for (i, dep) in self.dependents.iter().enumerate() {
            if dep.resource.is_empty() {
                return Err(Error::config(format!("dependents[{i}] is empty")));
            }
        }

        for (i, reference) in self.references.iter().enumerate() {
            if reference.resource.is_empty() {
                return Err(Error::config(format!("references[{i}] is empty")));
            }
        }

        if let Some(reconciler) = &self.reconciler {
            reconciler
                .validate()
                .map_err(|e| Error::config(format!("reconciler: {e}")))?;
        }

        if let Some(finalizer) = &self.finalizer {
            finalizer
                .validate()
                .map_err(|e| Error::config(format!("finalizer: {e}")))?;
        }

        parse_optional_duration(self.resync_period.as_deref())
            .map_err(|e| Error::config(format!("resyncPeriod: {e}")))?;

        if let Some(validator) = &self.validator {
            validator
                .validate()
                .map_err(|e| Error::config(format!("validator: {e}")))?;
        }

        if let Some(mutator) = &self.mutator {
            mutator
                .validate()
                .map_err(|e| Error::config(format!("mutator: {e}")))?;
        }

        if let Some(injector) = &self.injector {
            injector
                .validate()
                .map_err(|e| Error::config(format!("injector: {e}")))?;
        }

        Ok(())
    }
}

/// A dependent kind declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentConfig {
    /// The dependent kind
    #[serde(flatten)]
    pub resource: GvkConfig,
    /// Orphaned dependents get no owner reference and survive deletion of
    /// the primary
    #[serde(default)]
    pub orphan: bool,
}

/// A reference kind declaration. Names are extracted from the primary
/// object with the configured field path and resolved in its namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceConfig {
    /// The referenced kind
    #[serde(flatten)]
    pub resource: GvkConfig,
    /// Field path yielding one or more resource names, e.g.
    /// `.spec.backends[*].serviceName`
    #[serde(default)]
    pub name_field_path: String,
}

/// Reconcile handler settings for a resource.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// The handler to invoke
    #[serde(flatten)]
    pub handler: HandlerConfig,
    /// Default requeue interval applied when the handler does not request
    /// one itself
    #[serde(default)]
    pub requeue_after: Option<String>,
    /// Observe mode: the handler is invoked but its response is discarded
    /// and nothing is written back to the cluster
    #[serde(default)]
    pub observe: bool,
}

impl ReconcilerConfig {
    /// Parsed default requeue interval, if configured.
    pub fn requeue_after(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.requeue_after.as_deref())
    }

    fn validate(&self) -> Result<()> {
        self.handler.validate()?;
        parse_optional_duration(self.requeue_after.as_deref())
            .map_err(|e| Error::config(format!("requeueAfter: {e}")))?;
        Ok(())
    }
}

/// An in-process handler, available when the framework is embedded as a
/// library. Not expressible in the configuration file.
#[derive(Clone)]
pub struct InProcessHandler(pub Arc<dyn Handler>);

impl fmt::Debug for InProcessHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InProcessHandler")
    }
}

/// Handler declaration: exactly one transport must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfig {
    /// Subprocess transport
    #[serde(default)]
    pub exec: Option<ExecHandlerConfig>,
    /// HTTP transport
    #[serde(default)]
    pub http: Option<HttpHandlerConfig>,
    /// In-process handler, only settable from code
    #[serde(skip)]
    pub in_process: Option<InProcessHandler>,
}

impl HandlerConfig {
    /// Wrap an in-process handler for use when embedding the framework.
    pub fn in_process(handler: Arc<dyn Handler>) -> Self {
        Self {
            exec: None,
            http: None,
            in_process: Some(InProcessHandler(handler)),
        }
    }

    fn validate(&self) -> Result<()> {
        let count = [
            self.exec.is_some(),
            self.http.is_some(),
            self.in_process.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if count != 1 {
            return Err(Error::config(
                "exactly one of exec, http or an in-process handler must be specified",
            ));
        }

        if let Some(exec) = &self.exec {
            exec.validate()?;
        }
        if let Some(http) = &self.http {
            http.validate()?;
        }

        Ok(())
    }
}

/// Subprocess handler settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecHandlerConfig {
    /// Command to run
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment merged onto the parent environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child process
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Invocation deadline ("60s", "2m", ...); the child is killed when it
    /// expires
    #[serde(default)]
    pub timeout: Option<String>,
    /// Log stdin, stderr and stdout of every invocation
    #[serde(default)]
    pub debug: bool,
}

impl ExecHandlerConfig {
    /// Parsed invocation deadline, falling back to the framework default.
    pub fn timeout(&self) -> Result<Duration> {
        Ok(parse_optional_duration(self.timeout.as_deref())?
            .unwrap_or(crate::DEFAULT_HANDLER_TIMEOUT))
    }

    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::config("exec: command must be specified"));
        }
        parse_optional_duration(self.timeout.as_deref())
            .map_err(|e| Error::config(format!("exec: timeout: {e}")))?;
        Ok(())
    }
}

/// HTTP handler settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHandlerConfig {
    /// Endpoint URL receiving the JSON POST
    #[serde(default)]
    pub url: String,
    /// TLS settings for the connection to the handler
    #[serde(default)]
    pub tls: Option<HandlerTlsConfig>,
    /// Request deadline ("60s", "2m", ...)
    #[serde(default)]
    pub timeout: Option<String>,
    /// Log the request and response body of every invocation
    #[serde(default)]
    pub debug: bool,
}

impl HttpHandlerConfig {
    /// Parsed request deadline, falling back to the framework default.
    pub fn timeout(&self) -> Result<Duration> {
        Ok(parse_optional_duration(self.timeout.as_deref())?
            .unwrap_or(crate::DEFAULT_HANDLER_TIMEOUT))
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::config("http: url must be specified"));
        }
        parse_optional_duration(self.timeout.as_deref())
            .map_err(|e| Error::config(format!("http: timeout: {e}")))?;
        Ok(())
    }
}

/// Client-side TLS settings for the HTTP handler transport.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerTlsConfig {
    /// Client certificate presented to the handler (mTLS)
    #[serde(default)]
    pub cert_file: Option<String>,
    /// Private key for the client certificate
    #[serde(default)]
    pub key_file: Option<String>,
    /// CA bundle used to verify the handler's certificate
    #[serde(default)]
    pub ca_cert_file: Option<String>,
}

/// Injection handler settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectorConfig {
    /// The handler to invoke
    #[serde(flatten)]
    pub handler: HandlerConfig,
    /// PEM-encoded public key used to verify injection tokens
    #[serde(default)]
    pub verify_key_file: String,
}

impl InjectorConfig {
    fn validate(&self) -> Result<()> {
        self.handler.validate()?;
        if self.verify_key_file.is_empty() {
            return Err(Error::config("verifyKeyFile must be specified"));
        }
        Ok(())
    }
}

/// Listener settings shared by the webhook and metrics servers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind host; empty binds all interfaces
    #[serde(default)]
    pub host: String,
    /// Bind port; the webhook server defaults to 443 when unset
    #[serde(default)]
    pub port: u16,
    /// Server TLS settings
    #[serde(default)]
    pub tls: Option<TlsServerConfig>,
}

impl ServerConfig {
    fn validate_tls(&self) -> Result<()> {
        let tls = self
            .tls
            .as_ref()
            .ok_or_else(|| Error::config("tls must be specified"))?;
        if tls.cert_file.is_empty() {
            return Err(Error::config("tls: cert file must be specified"));
        }
        if tls.key_file.is_empty() {
            return Err(Error::config("tls: key file must be specified"));
        }
        Ok(())
    }
}

/// Server-side TLS certificate and key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsServerConfig {
    /// PEM-encoded certificate chain
    #[serde(default)]
    pub cert_file: String,
    /// PEM-encoded private key
    #[serde(default)]
    pub key_file: String,
}

fn parse_optional_duration(value: Option<&str>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some("") => Ok(None),
        Some(s) => humantime::parse_duration(s)
            .map(Some)
            .map_err(|e| Error::config(format!("invalid duration {s:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
resources:
  - group: example.com
    version: v1alpha1
    kind: Hello
    dependents:
      - version: v1
        kind: Pod
      - version: v1
        kind: ConfigMap
        orphan: true
    references:
      - version: v1
        kind: Secret
        nameFieldPath: .spec.secretName
    reconciler:
      exec:
        command: /opt/handlers/reconcile
        args: ["--verbose"]
        env:
          HANDLER_MODE: reconcile
        timeout: 30s
      requeueAfter: 5m
    finalizer:
      exec:
        command: /opt/handlers/finalize
    resyncPeriod: 1m
    validator:
      http:
        url: https://handlers.svc/validate
        timeout: 10s
    injector:
      exec:
        command: /opt/handlers/inject
      verifyKeyFile: /etc/whitebox/token.pub
webhook:
  port: 8443
  tls:
    certFile: /etc/whitebox/tls.crt
    keyFile: /etc/whitebox/tls.key
metrics:
  port: 9090
"#;

    #[test]
    fn full_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        let resource = &config.resources[0];
        assert_eq!(resource.resource.group, "example.com");
        assert_eq!(resource.resource.kind, "Hello");
        assert_eq!(resource.dependents.len(), 2);
        assert!(!resource.dependents[0].orphan);
        assert!(resource.dependents[1].orphan);
        assert_eq!(resource.references[0].name_field_path, ".spec.secretName");

        let reconciler = resource.reconciler.as_ref().unwrap();
        let exec = reconciler.handler.exec.as_ref().unwrap();
        assert_eq!(exec.command, "/opt/handlers/reconcile");
        assert_eq!(exec.timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(
            reconciler.requeue_after().unwrap(),
            Some(Duration::from_secs(300))
        );

        assert_eq!(resource.resync_period().unwrap(), Some(Duration::from_secs(60)));
        assert_eq!(config.webhook.as_ref().unwrap().port, 8443);
    }

    #[test]
    fn empty_resources_rejected() {
        let config: Config = serde_yaml::from_str("resources: []").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one resource"));
    }

    #[test]
    fn resource_without_kind_rejected() {
        let config: Config = serde_yaml::from_str(
            r#"
resources:
  - group: example.com
    version: v1
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resources[0]"));
        assert!(err.to_string().contains("group/version/kind is empty"));
    }

    #[test]
    fn handler_must_have_exactly_one_transport() {
        let both = HandlerConfig {
            exec: Some(ExecHandlerConfig {
                command: "/bin/true".into(),
                ..Default::default()
            }),
            http: Some(HttpHandlerConfig {
                url: "https://example.com".into(),
                ..Default::default()
            }),
            in_process: None,
        };
        assert!(both.validate().is_err());

        let neither = HandlerConfig::default();
        assert!(neither.validate().is_err());

        let exec_only = HandlerConfig {
            exec: Some(ExecHandlerConfig {
                command: "/bin/true".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        exec_only.validate().unwrap();
    }

    #[test]
    fn invalid_duration_rejected() {
        let config: Config = serde_yaml::from_str(
            r#"
resources:
  - version: v1
    kind: Hello
    resyncPeriod: notaduration
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resyncPeriod"));
    }

    #[test]
    fn webhook_tls_required_when_hooks_configured() {
        let config: Config = serde_yaml::from_str(
            r#"
resources:
  - version: v1
    kind: Hello
    validator:
      exec:
        command: /opt/handlers/validate
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("webhook"));
    }

    #[test]
    fn controller_and_finalizer_names() {
        let resource = ResourceConfig {
            resource: GvkConfig {
                group: "example.com".into(),
                version: "v1alpha1".into(),
                kind: "Hello".into(),
            },
            ..Default::default()
        };
        assert_eq!(resource.controller_name(), "hello-controller");
        assert_eq!(resource.finalizer_name(), "hello-controller.example.com");
    }
}
