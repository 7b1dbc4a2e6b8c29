use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use machina_common::Result;

use super::{StrategyKind, Updater};
use crate::command::{CommandRunner, HostCommand};

/// Image-native upgrade through bootc
pub struct BootcUpdater {
    runner: Arc<dyn CommandRunner>,
}

impl BootcUpdater {
    /// Create an updater using the given runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Updater for BootcUpdater {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ImageNative
    }

    /// bootc tracks its own image reference; `image` is only logged.
    async fn apply_update(&self, image: &str) -> Result<()> {
        info!(image, "Executing bootc upgrade");
        self.runner
            .run_streaming(&HostCommand::new("bootc").arg("upgrade"))
            .await
    }
}
