use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use machina_common::retry::{retry_with_backoff, RetryConfig};
use machina_common::Result;

use super::{StrategyKind, Updater};
use crate::command::{CommandRunner, HostCommand};
use crate::config::HostPaths;
use crate::selinux::with_permissive;

/// Transient systemd unit podman runs under
pub const UPDATE_UNIT: &str = "machine-config-daemon-update-rpmostree-via-container";

/// Update for hosts whose rpm-ostree cannot deploy container images itself.
///
/// The target image is pulled and run as a privileged container that deploys
/// itself onto the host (`rpm-ostree ex deploy-from-self`). SELinux is
/// permissive for the duration.
pub struct ContainerUpdater {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
    retry: RetryConfig,
}

impl ContainerUpdater {
    /// Create an updater using the given runner and host paths
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths) -> Self {
        Self {
            runner,
            paths,
            retry: RetryConfig::net_commands(),
        }
    }

    /// Override the pull retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn podman(&self) -> HostCommand {
        HostCommand::new("systemd-run")
            .args(["--unit", UPDATE_UNIT, "-p"])
            .arg(format!("EnvironmentFile=-{}", self.paths.proxy_env.display()))
            .args(["--collect", "--wait", "--", "podman"])
    }

    fn pull_command(&self, image: &str) -> HostCommand {
        self.podman()
            .args(["pull", "--authfile"])
            .arg(self.paths.kubelet_auth.display().to_string())
            .arg(image)
    }

    fn deploy_command(&self, image: &str) -> HostCommand {
        self.podman()
            .args(["run", "--env-file"])
            .arg(self.paths.proxy_env.display().to_string())
            .args(["--privileged", "--pid=host", "--net=host", "--rm", "-v", "/:/run/host"])
            .arg(image)
            .args(["rpm-ostree", "ex", "deploy-from-self", "/run/host"])
    }

    async fn pull_and_deploy(&self, image: &str) -> Result<()> {
        let pull = self.pull_command(image);
        retry_with_backoff(&self.retry, "podman pull", || self.runner.run_streaming(&pull)).await?;
        self.runner.run_streaming(&self.deploy_command(image)).await
    }
}

#[async_trait]
impl Updater for ContainerUpdater {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ContainerFallback
    }

    async fn apply_update(&self, image: &str) -> Result<()> {
        info!(image, "Deploying via privileged container");
        with_permissive(self.runner.as_ref(), &self.paths.selinux_enforce, || {
            self.pull_and_deploy(image)
        })
        .await
    }
}
