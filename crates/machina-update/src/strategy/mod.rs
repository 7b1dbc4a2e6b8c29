//! OS update strategies
//!
//! Three ways to move a host to a new OS image, chosen from the probed
//! [`HostCapability`]:
//!
//! | Host | Strategy |
//! |------|----------|
//! | rpm-ostree with the `container` feature | [`LayeredUpdater`] |
//! | rpm-ostree without it | [`ContainerUpdater`] |
//! | bootc | [`BootcUpdater`] |

mod bootc;
mod container;
mod layered;

pub use bootc::BootcUpdater;
pub use container::ContainerUpdater;
pub use layered::{LayeredUpdater, UNVERIFIED_REGISTRY};

use std::fmt;

use async_trait::async_trait;

use machina_common::Result;

use crate::probe::{HostCapability, UpdateAgent};

/// Which update strategy applies to a host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// `rpm-ostree rebase` straight to the image
    NativeLayered,
    /// Deploy from inside the target image run as a privileged container
    ContainerFallback,
    /// `bootc upgrade`
    ImageNative,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::NativeLayered => "native-layered",
            StrategyKind::ContainerFallback => "container-fallback",
            StrategyKind::ImageNative => "image-native",
        };
        f.write_str(s)
    }
}

/// Pick the strategy for a host
pub fn select_strategy(capability: &HostCapability) -> StrategyKind {
    match capability.agent {
        UpdateAgent::Bootc => StrategyKind::ImageNative,
        UpdateAgent::RpmOstree if capability.layering => StrategyKind::NativeLayered,
        UpdateAgent::RpmOstree => StrategyKind::ContainerFallback,
    }
}

/// Desired image plus the strategy chosen to reach it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateTarget {
    /// OS image reference
    pub image: String,
    /// Strategy that will apply it
    pub strategy: StrategyKind,
}

/// Capability set shared by all strategies
#[async_trait]
pub trait Updater: Send + Sync {
    /// Strategy this updater implements
    fn kind(&self) -> StrategyKind;

    /// Move the host to `image`. Failure aborts the attempt.
    async fn apply_update(&self, image: &str) -> Result<()>;

    /// Roll back to `image`. Not supported by any strategy yet.
    async fn rollback_update(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    /// Apply a config payload without a reboot. Not supported by any strategy yet.
    async fn live_apply(&self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(UpdateAgent::RpmOstree, true, StrategyKind::NativeLayered)]
    #[case(UpdateAgent::RpmOstree, false, StrategyKind::ContainerFallback)]
    #[case(UpdateAgent::Bootc, true, StrategyKind::ImageNative)]
    #[case(UpdateAgent::Bootc, false, StrategyKind::ImageNative)]
    fn strategy_follows_capability(
        #[case] agent: UpdateAgent,
        #[case] layering: bool,
        #[case] expected: StrategyKind,
    ) {
        assert_eq!(select_strategy(&HostCapability { agent, layering }), expected);
    }
}
