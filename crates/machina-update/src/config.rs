//! Host file locations touched by the updater

use std::path::{Path, PathBuf};

/// Well-known host paths. Tests point these at a temporary directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPaths {
    /// Symlink rpm-ostree reads registry credentials from
    pub ostree_auth_link: PathBuf,
    /// Merged image registry + cluster pull secret (preferred)
    pub merged_auth: PathBuf,
    /// Cluster pull secret used by the kubelet (fallback)
    pub kubelet_auth: PathBuf,
    /// SELinux enforcement flag
    pub selinux_enforce: PathBuf,
    /// rpm-ostreed drop-in clearing `InaccessiblePaths`
    pub rpm_ostreed_dropin: PathBuf,
    /// Proxy environment passed to podman
    pub proxy_env: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            ostree_auth_link: PathBuf::from("/run/ostree/auth.json"),
            merged_auth: PathBuf::from("/etc/mco/internal-registry-pull-secret.json"),
            kubelet_auth: PathBuf::from("/var/lib/kubelet/config.json"),
            selinux_enforce: PathBuf::from("/sys/fs/selinux/enforce"),
            rpm_ostreed_dropin: PathBuf::from(
                "/run/systemd/system/rpm-ostreed.service.d/bug2111817.conf",
            ),
            proxy_env: PathBuf::from("/etc/mco/proxy.env"),
        }
    }
}

impl HostPaths {
    /// The default layout re-rooted under `root`
    pub fn rooted(root: &Path) -> Self {
        let defaults = Self::default();
        let reroot = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            ostree_auth_link: reroot(&defaults.ostree_auth_link),
            merged_auth: reroot(&defaults.merged_auth),
            kubelet_auth: reroot(&defaults.kubelet_auth),
            selinux_enforce: reroot(&defaults.selinux_enforce),
            rpm_ostreed_dropin: reroot(&defaults.rpm_ostreed_dropin),
            proxy_env: reroot(&defaults.proxy_env),
        }
    }
}
