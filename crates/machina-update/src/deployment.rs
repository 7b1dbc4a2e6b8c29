//! Booted and staged deployments of the host
//!
//! Read from `rpm-ostree status --json` or `bootc status --json`, so an
//! update can tell which image the host runs and which one waits for the
//! next boot.

use serde::Deserialize;
use tracing::debug;

use machina_common::{Error, Result};

use crate::command::{CommandRunner, HostCommand};
use crate::probe::UpdateAgent;
use crate::strategy::UNVERIFIED_REGISTRY;

const PIVOT_PREFIX: &str = "pivot://";

/// One deployment as printed by `rpm-ostree status --json`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Deployment {
    /// Deployment id
    #[serde(default)]
    pub id: String,
    /// OSTree commit
    #[serde(default)]
    pub checksum: String,
    /// Commit of the base image when packages are layered on top
    #[serde(default)]
    pub base_checksum: Option<String>,
    /// OS version
    #[serde(default)]
    pub version: Option<String>,
    /// Whether the host runs this deployment
    #[serde(default)]
    pub booted: bool,
    /// Whether this deployment becomes active on next boot
    #[serde(default)]
    pub staged: bool,
    /// Ostree container reference the deployment was pulled from
    #[serde(default)]
    pub container_image_reference: Option<String>,
    /// Origin recorded by older pivot-based updates
    #[serde(default)]
    pub custom_origin: Vec<String>,
}

impl Deployment {
    /// Image the deployment came from, without the ostree transport prefix
    pub fn image(&self) -> Option<String> {
        if let Some(reference) = self.container_image_reference.as_deref() {
            return Some(image_from_reference(reference).to_string());
        }
        self.custom_origin
            .first()
            .and_then(|origin| origin.strip_prefix(PIVOT_PREFIX))
            .map(str::to_string)
    }

    /// Commit to compare deployments by
    pub fn base_checksum(&self) -> &str {
        self.base_checksum.as_deref().unwrap_or(&self.checksum)
    }
}

/// Deployments known to the host
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct DeploymentStatus {
    /// Every deployment, newest first
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

impl DeploymentStatus {
    /// Deployment the host is running
    pub fn booted(&self) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.booted)
    }

    /// Deployment waiting for the next boot
    pub fn staged(&self) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.staged)
    }

    /// Image of the booted deployment
    pub fn booted_image(&self) -> Option<String> {
        self.booted().and_then(Deployment::image)
    }

    /// Image of the staged deployment
    pub fn staged_image(&self) -> Option<String> {
        self.staged().and_then(Deployment::image)
    }
}

/// Strip the ostree signature policy and transport from a container reference.
///
/// `ostree-unverified-registry:quay.io/os@sha256:..` and
/// `ostree-remote-image:fedora:docker://quay.io/os` both yield the bare image.
pub fn image_from_reference(reference: &str) -> &str {
    if let Some(image) = reference.strip_prefix(UNVERIFIED_REGISTRY) {
        return image;
    }
    if let Some(rest) = reference.strip_prefix("ostree-remote-registry:") {
        return without_remote(rest);
    }
    let rest = ["ostree-unverified-image:", "ostree-image-signed:"]
        .iter()
        .find_map(|policy| reference.strip_prefix(policy))
        .or_else(|| reference.strip_prefix("ostree-remote-image:").map(without_remote))
        .unwrap_or(reference);

    ["docker://", "registry:"]
        .iter()
        .find_map(|transport| rest.strip_prefix(transport))
        .unwrap_or(rest)
}

fn without_remote(rest: &str) -> &str {
    rest.split_once(':').map_or(rest, |(_remote, image)| image)
}

/// Parse `rpm-ostree status --json`
pub fn parse_rpm_ostree_status(output: &str) -> Result<DeploymentStatus> {
    serde_json::from_str(output).map_err(|e| {
        Error::serialization_for_kind(
            "rpm-ostree status",
            format!("failed to parse `rpm-ostree status --json` output: {}", e),
        )
    })
}

#[derive(Deserialize)]
struct BootcHost {
    #[serde(default)]
    status: BootcStatus,
}

#[derive(Default, Deserialize)]
struct BootcStatus {
    #[serde(default)]
    booted: Option<BootcEntry>,
    #[serde(default)]
    staged: Option<BootcEntry>,
}

#[derive(Deserialize)]
struct BootcEntry {
    #[serde(default)]
    image: Option<BootcImageStatus>,
    #[serde(default)]
    ostree: Option<BootcOstree>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootcImageStatus {
    image: BootcImageReference,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct BootcImageReference {
    image: String,
}

#[derive(Deserialize)]
struct BootcOstree {
    #[serde(default)]
    checksum: String,
}

impl BootcEntry {
    fn into_deployment(self, booted: bool) -> Deployment {
        let (reference, version) = match self.image {
            Some(status) => (Some(status.image.image), status.version),
            None => (None, None),
        };
        Deployment {
            checksum: self.ostree.map(|o| o.checksum).unwrap_or_default(),
            version,
            booted,
            staged: !booted,
            container_image_reference: reference,
            ..Default::default()
        }
    }
}

/// Parse `bootc status --json` into the same shape as rpm-ostree's
pub fn parse_bootc_status(output: &str) -> Result<DeploymentStatus> {
    let host: BootcHost = serde_json::from_str(output).map_err(|e| {
        Error::serialization_for_kind(
            "bootc status",
            format!("failed to parse `bootc status --json` output: {}", e),
        )
    })?;
    let BootcStatus { booted, staged } = host.status;
    let deployments = staged
        .map(|entry| entry.into_deployment(false))
        .into_iter()
        .chain(booted.map(|entry| entry.into_deployment(true)))
        .collect();
    Ok(DeploymentStatus { deployments })
}

/// Read the host's deployments through its update agent
pub async fn query_deployments(
    runner: &dyn CommandRunner,
    agent: UpdateAgent,
) -> Result<DeploymentStatus> {
    let program = agent.to_string();
    let out = runner
        .run_captured(&HostCommand::new(&program).args(["status", "--json"]))
        .await?;
    let status = match agent {
        UpdateAgent::RpmOstree => parse_rpm_ostree_status(&out)?,
        UpdateAgent::Bootc => parse_bootc_status(&out)?,
    };
    debug!(
        agent = %agent,
        booted = ?status.booted_image(),
        staged = ?status.staged_image(),
        "deployments queried"
    );
    Ok(status)
}
