use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use machina_common::Result;

use super::{StrategyKind, Updater};
use crate::command::{CommandRunner, HostCommand};
use crate::config::HostPaths;
use crate::credentials::provision_credentials;

/// Transport prefix rpm-ostree uses for unsigned container images
pub const UNVERIFIED_REGISTRY: &str = "ostree-unverified-registry:";

/// Native container rebase through rpm-ostree
pub struct LayeredUpdater {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
}

impl LayeredUpdater {
    /// Create an updater using the given runner and host paths
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths) -> Self {
        Self { runner, paths }
    }
}

#[async_trait]
impl Updater for LayeredUpdater {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NativeLayered
    }

    async fn apply_update(&self, image: &str) -> Result<()> {
        // secrets may have appeared since initialize() without a daemon restart
        if let Err(e) = provision_credentials(&self.paths).await {
            error!(error = %e, "error while linking rpm-ostree pull secrets");
        }

        info!(image, "Executing rebase");
        self.runner
            .run_streaming(
                &HostCommand::new("rpm-ostree")
                    .args(["rebase", "--experimental"])
                    .arg(format!("{}{}", UNVERIFIED_REGISTRY, image)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use machina_common::Error;

    #[tokio::test]
    async fn rebases_to_unverified_registry_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .withf(|cmd| {
                cmd.to_string()
                    == "rpm-ostree rebase --experimental ostree-unverified-registry:quay.io/os@sha256:abc"
            })
            .times(1)
            .returning(|_| Ok(()));

        let updater = LayeredUpdater::new(Arc::new(runner), HostPaths::rooted(dir.path()));
        updater.apply_update("quay.io/os@sha256:abc").await.unwrap();
    }

    #[tokio::test]
    async fn rebase_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .returning(|cmd| Err(Error::command(cmd.to_string(), "exit status: 1")));

        let updater = LayeredUpdater::new(Arc::new(runner), HostPaths::rooted(dir.path()));
        assert!(updater.apply_update("quay.io/os:1").await.is_err());
    }
}
