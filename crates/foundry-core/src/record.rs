//! Service records — what a worker node publishes about itself.
//!
//! Records live in the registry store under
//!   services/{name}/{ip}/{port}
//! as JSON, with a TTL equal to the lease duration. Join and leave
//! events are published on the `service-join` / `service-leave` channels.

use serde::{Deserialize, Serialize};

/// Prefix of every registry key.
pub const KEY_PREFIX: &str = "services/";

/// Channel carrying the JSON record of a node that joined.
pub const JOIN_CHANNEL: &str = "service-join";

/// Channel carrying the key of a node that left.
pub const LEAVE_CHANNEL: &str = "service-leave";

/// Port assumed when a record does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// One worker node as seen through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Service name, e.g. "builder".
    pub name: String,
    /// Address clients should connect to.
    pub ip: String,
    /// Listen port. `None` means `DEFAULT_PORT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// CPU cores available for packaging.
    pub cpu_count: u32,
    /// Jobs currently queued or running on the node.
    #[serde(default)]
    pub job_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub hostname: String,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16, cpu_count: u32) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port: Some(port),
            cpu_count,
            job_count: 0,
            latitude: None,
            longitude: None,
            hostname: String::new(),
        }
    }

    /// Effective port.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Store key for this record.
    pub fn key(&self) -> String {
        format!("{KEY_PREFIX}{}/{}/{}", self.name, self.ip, self.port_or_default())
    }

    /// Endpoint URL handed to clients by the router.
    pub fn endpoint(&self) -> String {
        self.endpoint_or(DEFAULT_PORT)
    }

    /// Like `endpoint`, with a deployment-specific fallback port.
    pub fn endpoint_or(&self, default_port: u16) -> String {
        format!("https://{}:{}", self.ip, self.port.unwrap_or(default_port))
    }

    /// Load score used by the router: jobs per core, lower is better.
    ///
    /// `cpu_count == 0` is not guarded: the weight is `inf` (or `NaN` when
    /// the node is also idle) and such records sort last.
    pub fn weight(&self) -> f64 {
        self.job_count as f64 / self.cpu_count as f64
    }

    /// Parse a stored value. Missing, empty or malformed values yield `None`.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let raw = raw?;
        if raw.is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }
}
