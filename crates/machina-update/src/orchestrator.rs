//! Per-host update orchestration
//!
//! One orchestrator owns the host-global resources (credential link, SELinux
//! mode, rpm-ostreed drop-in) for the lifetime of the daemon.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use machina_common::events::reasons;
use machina_common::Result;

use crate::command::{log_system, CommandRunner};
use crate::config::HostPaths;
use crate::credentials::provision_credentials;
use crate::deployment::{query_deployments, DeploymentStatus};
use crate::probe::{probe_host, HostCapability, UpdateAgent};
use crate::progress::{NoopProgress, UpdateProgress};
use crate::strategy::{
    select_strategy, BootcUpdater, ContainerUpdater, LayeredUpdater, StrategyKind, UpdateTarget,
    Updater,
};
use crate::workaround::ensure_rpm_ostreed_dropin;

/// Drives OS image updates on the local host
pub struct UpdateOrchestrator {
    runner: Arc<dyn CommandRunner>,
    agent: UpdateAgent,
    paths: HostPaths,
    progress: Arc<dyn UpdateProgress>,
}

impl UpdateOrchestrator {
    /// Orchestrator for a host managed by `agent`
    pub fn new(runner: Arc<dyn CommandRunner>, agent: UpdateAgent) -> Self {
        Self {
            runner,
            agent,
            paths: HostPaths::default(),
            progress: Arc::new(NoopProgress),
        }
    }

    /// Use a different host path layout
    pub fn with_paths(mut self, paths: HostPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Report progress to `progress`
    pub fn with_progress(mut self, progress: Arc<dyn UpdateProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// One-time host preparation. Safe to call repeatedly.
    ///
    /// Installs the rpm-ostreed drop-in on rpm-ostree hosts, then links
    /// registry credentials. Credential problems are logged only.
    pub async fn initialize(&self) -> Result<()> {
        if self.agent == UpdateAgent::RpmOstree {
            ensure_rpm_ostreed_dropin(self.runner.as_ref(), &self.paths.rpm_ostreed_dropin)
                .await?;
        }
        if let Err(e) = provision_credentials(&self.paths).await {
            error!(error = %e, "error while linking rpm-ostree pull secrets");
        }
        Ok(())
    }

    /// Probe the host's update agent
    pub async fn probe(&self) -> Result<HostCapability> {
        probe_host(self.runner.as_ref(), self.agent).await
    }

    /// Build the updater for a strategy
    pub fn updater_for(&self, strategy: StrategyKind) -> Box<dyn Updater> {
        match strategy {
            StrategyKind::NativeLayered => {
                Box::new(LayeredUpdater::new(self.runner.clone(), self.paths.clone()))
            }
            StrategyKind::ContainerFallback => {
                Box::new(ContainerUpdater::new(self.runner.clone(), self.paths.clone()))
            }
            StrategyKind::ImageNative => Box::new(BootcUpdater::new(self.runner.clone())),
        }
    }

    /// Probe the host and decide how to reach `image`
    pub async fn plan(&self, image: &str) -> Result<UpdateTarget> {
        let capability = self.probe().await?;
        Ok(UpdateTarget {
            image: image.to_string(),
            strategy: select_strategy(&capability),
        })
    }

    /// Read the host's booted and staged deployments
    pub async fn deployments(&self) -> Result<DeploymentStatus> {
        query_deployments(self.runner.as_ref(), self.agent).await
    }

    /// Move the host to `image`.
    ///
    /// The host is probed on every attempt. A host already booted into or
    /// staged with `image` is left alone. Any failure aborts the attempt and
    /// is reported through the progress sink before being returned.
    #[instrument(skip(self), fields(agent = %self.agent))]
    pub async fn apply_update(&self, image: &str) -> Result<()> {
        let target = self.plan(image).await?;

        // the status query is advisory; the update proceeds without it
        match self.deployments().await {
            Ok(status) if status.booted_image().as_deref() == Some(image) => {
                info!(image, "host is already booted into the target image, skipping update");
                return Ok(());
            }
            Ok(status) if status.staged_image().as_deref() == Some(image) => {
                info!(image, "target image is already staged for next boot, skipping update");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to query deployments, updating anyway"),
        }

        let result = self.apply_target(&target).await;
        if result.is_err() {
            match self.deployments().await {
                Ok(status) => info!(
                    booted = ?status.booted_image(),
                    staged = ?status.staged_image(),
                    "host remains on its booted deployment"
                ),
                Err(e) => warn!(error = %e, "failed to query deployments after failed update"),
            }
        }
        result
    }

    /// Apply an already planned target
    pub async fn apply_target(&self, target: &UpdateTarget) -> Result<()> {
        let updater = self.updater_for(target.strategy);
        if target.strategy == StrategyKind::ContainerFallback {
            log_system(
                self.runner.as_ref(),
                "rpm-ostree is not new enough for layering; forcing an update via container",
            )
            .await;
        }

        info!(image = %target.image, strategy = %target.strategy, "Starting OS update");
        self.progress
            .report(&format!("Updating OS to {}", target.image), reasons::UPDATE_STARTED)
            .await;

        match updater.apply_update(&target.image).await {
            Ok(()) => {
                log_system(
                    self.runner.as_ref(),
                    &format!("OS update to {} staged", target.image),
                )
                .await;
                self.progress
                    .report(&format!("Updated OS to {}", target.image), reasons::UPDATE_COMPLETE)
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(image = %target.image, error = %e, "OS update failed");
                self.progress
                    .report(
                        &format!("Failed to update OS to {}", target.image),
                        reasons::UPDATE_FAILED,
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Updater chosen from the agent alone, without probing the host
    fn unprobed_updater(&self) -> Box<dyn Updater> {
        self.updater_for(match self.agent {
            UpdateAgent::Bootc => StrategyKind::ImageNative,
            UpdateAgent::RpmOstree => StrategyKind::NativeLayered,
        })
    }

    /// Roll back to `image` (currently a no-op for every strategy)
    pub async fn rollback_update(&self, image: &str) -> Result<()> {
        self.unprobed_updater().rollback_update(image).await
    }

    /// Apply a payload without reboot (currently a no-op for every strategy)
    pub async fn live_apply(&self, payload: &[u8]) -> Result<()> {
        self.unprobed_updater().live_apply(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{HostCommand, MockCommandRunner};
    use crate::deployment::tests::RPM_OSTREE_STATUS;
    use crate::progress::MockUpdateProgress;
    use machina_common::Error;
    use rstest::rstest;

    const LAYERING: &str = "rpm-ostree:\n Version: '2024.3'\n Features:\n  - container\n";

    fn is_status(cmd: &HostCommand) -> bool {
        cmd.args == ["status", "--json"]
    }

    fn layering_runner() -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_captured()
            .withf(|cmd| cmd.to_string() == "rpm-ostree --version")
            .returning(|_| Ok(LAYERING.to_string()));
        runner
    }

    fn host() -> (tempfile::TempDir, HostPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted(dir.path());
        std::fs::create_dir_all(paths.kubelet_auth.parent().unwrap()).unwrap();
        std::fs::write(&paths.kubelet_auth, "{}").unwrap();
        (dir, paths)
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (_dir, paths) = host();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .withf(|cmd| cmd.to_string() == "systemctl daemon-reload")
            .times(1)
            .returning(|_| Ok(()));

        let orch = UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree)
            .with_paths(paths.clone());
        orch.initialize().await.unwrap();
        orch.initialize().await.unwrap();

        assert!(paths.rpm_ostreed_dropin.exists());
        assert_eq!(
            std::fs::read_link(&paths.ostree_auth_link).unwrap(),
            paths.kubelet_auth
        );
    }

    #[tokio::test]
    async fn bootc_hosts_skip_the_dropin() {
        let (_dir, paths) = host();
        let mut runner = MockCommandRunner::new();
        runner.expect_run_streaming().never();

        let orch =
            UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::Bootc).with_paths(paths.clone());
        orch.initialize().await.unwrap();
        assert!(!paths.rpm_ostreed_dropin.exists());
    }

    #[tokio::test]
    async fn layering_host_rebases_and_reports() {
        let (_dir, paths) = host();
        let mut runner = layering_runner();
        runner
            .expect_run_captured()
            .withf(is_status)
            .times(1)
            .returning(|_| Ok(RPM_OSTREE_STATUS.to_string()));
        runner
            .expect_run_streaming()
            .withf(|cmd| cmd.program == "rpm-ostree" && cmd.args[0] == "rebase")
            .times(1)
            .returning(|_| Ok(()));
        runner.expect_run_with_stdin().returning(|_, _| Ok(()));

        let mut progress = MockUpdateProgress::new();
        progress
            .expect_report()
            .withf(|phase, reason| phase == "Updating OS to quay.io/os:2" && reason == reasons::UPDATE_STARTED)
            .times(1)
            .return_const(());
        progress
            .expect_report()
            .withf(|phase, reason| phase == "Updated OS to quay.io/os:2" && reason == reasons::UPDATE_COMPLETE)
            .times(1)
            .return_const(());

        let orch = UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree)
            .with_paths(paths)
            .with_progress(Arc::new(progress));
        orch.apply_update("quay.io/os:2").await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_aborts_before_any_mutation() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_captured()
            .returning(|cmd| Err(Error::command(cmd.to_string(), "not found")));
        runner.expect_run_streaming().never();

        let orch = UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree);
        let err = orch.apply_update("quay.io/os:2").await.unwrap_err();
        assert!(matches!(err, Error::Probe { .. }));
    }

    #[tokio::test]
    async fn failed_update_is_reported() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .returning(|cmd| Err(Error::command(cmd.to_string(), "exit status: 1")));

        let mut progress = MockUpdateProgress::new();
        progress
            .expect_report()
            .withf(|phase, reason| phase == "Updating OS to img" && reason == reasons::UPDATE_STARTED)
            .return_const(());
        progress
            .expect_report()
            .withf(|phase, reason| phase == "Failed to update OS to img" && reason == reasons::UPDATE_FAILED)
            .times(1)
            .return_const(());

        let orch = UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::Bootc)
            .with_progress(Arc::new(progress));
        let target = UpdateTarget {
            image: "img".to_string(),
            strategy: StrategyKind::ImageNative,
        };
        assert!(orch.apply_target(&target).await.is_err());
    }

    #[rstest]
    #[case::booted("quay.io/os@sha256:1111")]
    #[case::staged("quay.io/os@sha256:2222")]
    #[tokio::test]
    async fn deployed_image_is_not_reapplied(#[case] image: &str) {
        let mut runner = layering_runner();
        runner
            .expect_run_captured()
            .withf(is_status)
            .returning(|_| Ok(RPM_OSTREE_STATUS.to_string()));
        runner.expect_run_streaming().never();
        runner.expect_run_with_stdin().never();

        let mut progress = MockUpdateProgress::new();
        progress.expect_report().never();

        let orch = UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree)
            .with_progress(Arc::new(progress));
        orch.apply_update(image).await.unwrap();
    }

    #[tokio::test]
    async fn failed_rebase_rechecks_deployments() {
        let (_dir, paths) = host();
        let mut runner = layering_runner();
        runner
            .expect_run_captured()
            .withf(is_status)
            .times(2)
            .returning(|_| Ok(RPM_OSTREE_STATUS.to_string()));
        runner
            .expect_run_streaming()
            .returning(|cmd| Err(Error::command(cmd.to_string(), "exit status: 1")));
        runner.expect_run_with_stdin().returning(|_, _| Ok(()));

        let orch =
            UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree).with_paths(paths);
        let err = orch.apply_update("quay.io/os:3").await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn status_query_failure_does_not_block_update() {
        let (_dir, paths) = host();
        let mut runner = layering_runner();
        runner
            .expect_run_captured()
            .withf(is_status)
            .returning(|cmd| Err(Error::command(cmd.to_string(), "exit status: 1")));
        runner
            .expect_run_streaming()
            .withf(|cmd| cmd.args[0] == "rebase")
            .times(1)
            .returning(|_| Ok(()));
        runner.expect_run_with_stdin().returning(|_, _| Ok(()));

        let orch =
            UpdateOrchestrator::new(Arc::new(runner), UpdateAgent::RpmOstree).with_paths(paths);
        orch.apply_update("quay.io/os:3").await.unwrap();
    }

    #[rstest]
    #[case(UpdateAgent::RpmOstree)]
    #[case(UpdateAgent::Bootc)]
    #[tokio::test]
    async fn rollback_and_live_apply_skip_the_probe(#[case] agent: UpdateAgent) {
        let mut runner = MockCommandRunner::new();
        runner.expect_run_captured().never();
        runner.expect_run_streaming().never();
        runner.expect_run_with_stdin().never();

        let orch = UpdateOrchestrator::new(Arc::new(runner), agent);
        orch.rollback_update("img").await.unwrap();
        orch.live_apply(b"payload").await.unwrap();
    }
}
