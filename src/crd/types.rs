//! Shared types for VirtualCluster resources

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a virtual cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VirtualClusterPhase {
    /// Not reconciled yet
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Deploying or waiting for the control plane to come up
    Pending,
    /// Control plane is initialized and answering readiness checks
    Deployed,
    /// A condition reported an error that needs user action
    Failed,
}

impl std::fmt::Display for VirtualClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Pending => write!(f, "Pending"),
            Self::Deployed => write!(f, "Deployed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a False condition is
///
/// Only meaningful when the condition status is False. `Error` promotes the
/// resource to the Failed phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// No severity (condition is True or Unknown)
    #[default]
    #[serde(rename = "")]
    None,
    /// Informational, expected to resolve
    Info,
    /// Something is off but may resolve on retry
    Warning,
    /// Requires user intervention
    Error,
}

impl ConditionSeverity {
    /// Ordering used when several False conditions are summarized
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Info => 1,
            Self::Warning => 2,
            Self::Error => 3,
        }
    }

    /// True for the default (empty) severity
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Kubernetes-style condition with a severity
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, HelmChartDeployed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, set only when status is False
    #[serde(default, skip_serializing_if = "ConditionSeverity::is_none")]
    pub severity: ConditionSeverity,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp and no severity
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: ConditionSeverity::None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Set the severity and return self for chaining
    pub fn with_severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Whether two conditions describe the same state, ignoring the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Endpoint where the virtual cluster API server is reachable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Hostname or IP address
    #[serde(default)]
    pub host: String,

    /// Port number
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// True when neither host nor port has been set
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

/// Chart identity for the virtual cluster deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HelmChart {
    /// Chart name, defaults to the configured default chart
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Chart repository URL, defaults to the configured default repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Chart version, required
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Helm release settings for the virtual cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    /// Chart to deploy
    #[serde(default)]
    pub chart: HelmChart,

    /// Raw values document (YAML). Mutually exclusive with `valuesObject`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values: String,

    /// Structured values. Mutually exclusive with `values`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub values_object: Option<serde_json::Value>,
}

/// Schema for a free-form object the API server must store untouched
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
