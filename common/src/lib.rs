use serde::{Deserialize, Deserializer, Serialize};

/// Identity value used when a manifest joins an identity group without
/// naming its slot.
pub const INVALID_IDENTITY: i64 = i64::MAX;

/// Workload descriptor handed to the node agent when an app instance starts.
///
/// The same document is stored under `/scheduled/<name>` in the coordination
/// store, so the reaper can rebuild presence paths for a dead node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Fully qualified instance name, `<proid>.<app>#<instance>`.
    pub name: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub identity_group: Option<String>,
    #[serde(default)]
    pub identity: Option<i64>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    /// Port the service listens on inside the container.
    pub port: u16,
    /// Host port advertised to the rest of the cluster. Only known once the
    /// node has allocated it, so scheduled manifests may not carry it.
    #[serde(default)]
    pub real_port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(
        default = "default_restart_count",
        deserialize_with = "lenient_restart_count"
    )]
    pub restart_count: i64,
}

/// Restart bound of a service after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartLimit {
    Unlimited,
    Bounded(u32),
}

impl RestartLimit {
    /// `-1` means unlimited and `0` is read as `1` for older manifests.
    /// Any other negative value yields a bound no restart count can satisfy.
    pub fn from_count(count: i64) -> Self {
        match count {
            -1 => RestartLimit::Unlimited,
            0 => RestartLimit::Bounded(1),
            n if n < 0 => RestartLimit::Bounded(0),
            n => RestartLimit::Bounded(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    pub fn allows(&self, actual_restarts: usize) -> bool {
        match self {
            RestartLimit::Unlimited => true,
            RestartLimit::Bounded(bound) => *bound as usize > actual_restarts,
        }
    }
}

impl std::fmt::Display for RestartLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartLimit::Unlimited => write!(f, "unlimited"),
            RestartLimit::Bounded(bound) => write!(f, "{bound}"),
        }
    }
}

impl ServiceSpec {
    pub fn restart_limit(&self) -> RestartLimit {
        RestartLimit::from_count(self.restart_count)
    }
}

impl Endpoint {
    /// Endpoint name, falling back to the internal port.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.port.to_string())
    }
}

impl Manifest {
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn from_yaml_slice(content: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(content)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn identity_or_invalid(&self) -> i64 {
        self.identity.unwrap_or(INVALID_IDENTITY)
    }
}

fn default_restart_count() -> i64 {
    1
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRestartCount {
    Int(i64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

// Manifests written by hand sometimes carry junk here; fall back to a single run.
fn lenient_restart_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawRestartCount>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawRestartCount::Int(n)) => n,
        Some(RawRestartCount::Text(s)) => s
            .trim()
            .parse()
            .unwrap_or_else(|_| default_restart_count()),
        Some(RawRestartCount::Other(_)) | None => default_restart_count(),
    })
}
