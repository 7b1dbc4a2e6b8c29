//! Host update agent capability probe

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use machina_common::{Error, Result};

use crate::command::{CommandRunner, HostCommand};

/// Feature rpm-ostree advertises when it can deploy container images natively
pub const CONTAINER_FEATURE: &str = "container";

/// Update agent installed on the host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateAgent {
    /// rpm-ostree managed host
    #[default]
    RpmOstree,
    /// bootc managed host
    Bootc,
}

impl fmt::Display for UpdateAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateAgent::RpmOstree => f.write_str("rpm-ostree"),
            UpdateAgent::Bootc => f.write_str("bootc"),
        }
    }
}

impl FromStr for UpdateAgent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rpm-ostree" => Ok(UpdateAgent::RpmOstree),
            "bootc" => Ok(UpdateAgent::Bootc),
            other => Err(Error::validation_for(
                "update agent",
                format!("unknown agent {:?}, expected rpm-ostree or bootc", other),
            )),
        }
    }
}

/// What the host can do, read once per update attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostCapability {
    /// Installed update agent
    pub agent: UpdateAgent,
    /// Whether the agent can deploy container images natively
    pub layering: bool,
}

/// The `rpm-ostree` section of `rpm-ostree --version`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RpmOstreeVersion {
    /// Release version
    #[serde(default)]
    pub version: String,
    /// Compiled-in features
    #[serde(default)]
    pub features: Vec<String>,
    /// Source commit
    #[serde(default)]
    pub git: Option<String>,
}

impl RpmOstreeVersion {
    /// True if container images can be deployed natively
    pub fn supports_layering(&self) -> bool {
        self.features.iter().any(|f| f == CONTAINER_FEATURE)
    }
}

#[derive(Deserialize)]
struct VersionDocument {
    #[serde(rename = "rpm-ostree")]
    root: RpmOstreeVersion,
}

/// Parse the YAML printed by `rpm-ostree --version`
pub fn parse_rpm_ostree_version(output: &str) -> Result<RpmOstreeVersion> {
    serde_yaml::from_str::<VersionDocument>(output)
        .map(|doc| doc.root)
        .map_err(|e| {
            Error::serialization_for_kind(
                "rpm-ostree --version",
                format!("failed to parse `rpm-ostree --version` output: {}", e),
            )
        })
}

/// Probe the host's update agent. Any failure is fatal to the attempt.
pub async fn probe_host(runner: &dyn CommandRunner, agent: UpdateAgent) -> Result<HostCapability> {
    match agent {
        UpdateAgent::RpmOstree => {
            let out = runner
                .run_captured(&HostCommand::new("rpm-ostree").arg("--version"))
                .await
                .map_err(|e| Error::probe(e.to_string()))?;
            let version = parse_rpm_ostree_version(&out)?;
            debug!(version = %version.version, features = ?version.features, "rpm-ostree probed");
            Ok(HostCapability {
                agent,
                layering: version.supports_layering(),
            })
        }
        UpdateAgent::Bootc => {
            let out = runner
                .run_captured(&HostCommand::new("bootc").arg("--version"))
                .await
                .map_err(|e| Error::probe(e.to_string()))?;
            debug!(version = %out.trim(), "bootc probed");
            Ok(HostCapability {
                agent,
                layering: true,
            })
        }
    }
}
