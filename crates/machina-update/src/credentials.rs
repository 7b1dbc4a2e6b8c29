//! Registry credentials for the update agent
//!
//! rpm-ostree reads registry credentials from a fixed path. We expose one of
//! the host's pull secrets there as a symlink, preferring the merged image
//! registry secret and falling back to the kubelet's cluster pull secret.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use machina_common::{Error, Result};

use crate::config::HostPaths;

/// Ordered credential sources; the first usable one wins
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialChain {
    sources: Vec<PathBuf>,
}

impl CredentialChain {
    /// Chain over explicit sources, most preferred first
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self { sources }
    }

    /// Merged registry secret, then the kubelet pull secret
    pub fn from_paths(paths: &HostPaths) -> Self {
        Self::new(vec![paths.merged_auth.clone(), paths.kubelet_auth.clone()])
    }

    /// Pick the source to expose.
    ///
    /// Every source but the last must exist, be readable and hold valid JSON.
    /// The last source is the unconditional fallback. Rejected sources are
    /// logged, never returned as errors.
    pub async fn select(&self) -> Option<&Path> {
        let (fallback, preferred) = self.sources.split_last()?;
        for source in preferred {
            match validate_source(source).await {
                Ok(()) => return Some(source),
                Err(reason) => error!(
                    source = %source.display(),
                    fallback = %fallback.display(),
                    "{}; defaulting to cluster pull secret",
                    reason
                ),
            }
        }
        Some(fallback)
    }
}

async fn validate_source(path: &Path) -> std::result::Result<(), String> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err("merged secret file does not exist".to_string())
        }
        Err(e) => return Err(format!("merged secret file could not be read: {}", e)),
    };
    serde_json::from_slice::<serde_json::Value>(&bytes)
        .map(|_| ())
        .map_err(|e| format!("merged secret file could not be validated: {}", e))
}

/// Point the ostree auth link at `target`.
///
/// An existing link is removed first, never overwritten in place. A missing
/// parent directory is created.
pub async fn link_ostree_auth_file(link: &Path, target: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(link).await {
        Ok(_) => tokio::fs::remove_file(link)
            .await
            .map_err(|e| Error::io(format!("removing {}", link.display()), e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = link.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
        }
        Err(e) => return Err(Error::io(format!("inspecting {}", link.display()), e)),
    }

    info!(target = %target.display(), "Linking ostree authfile");
    tokio::fs::symlink(target, link)
        .await
        .map_err(|e| Error::io(format!("linking {} to {}", link.display(), target.display()), e))
}

/// Expose the best available pull secret at the ostree auth path
pub async fn provision_credentials(paths: &HostPaths) -> Result<PathBuf> {
    let chain = CredentialChain::from_paths(paths);
    let source = chain
        .select()
        .await
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::internal_with_context("credentials", "no credential sources"))?;
    link_ostree_auth_file(&paths.ostree_auth_link, &source).await?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn host() -> (TempDir, HostPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted(dir.path());
        tokio::fs::create_dir_all(paths.kubelet_auth.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&paths.kubelet_auth, br#"{"auths":{}}"#)
            .await
            .unwrap();
        tokio::fs::create_dir_all(paths.merged_auth.parent().unwrap())
            .await
            .unwrap();
        (dir, paths)
    }

    async fn link_target(paths: &HostPaths) -> PathBuf {
        tokio::fs::read_link(&paths.ostree_auth_link).await.unwrap()
    }

    #[tokio::test]
    async fn valid_merged_secret_is_preferred() {
        let (_dir, paths) = host().await;
        tokio::fs::write(&paths.merged_auth, br#"{"auths":{"registry":{}}}"#)
            .await
            .unwrap();

        let chosen = provision_credentials(&paths).await.unwrap();
        assert_eq!(chosen, paths.merged_auth);
        assert_eq!(link_target(&paths).await, paths.merged_auth);
    }

    #[tokio::test]
    async fn missing_merged_secret_falls_back() {
        let (_dir, paths) = host().await;

        let chosen = provision_credentials(&paths).await.unwrap();
        assert_eq!(chosen, paths.kubelet_auth);
        assert_eq!(link_target(&paths).await, paths.kubelet_auth);
    }

    #[tokio::test]
    async fn invalid_json_falls_back() {
        let (_dir, paths) = host().await;
        tokio::fs::write(&paths.merged_auth, b"{not json").await.unwrap();

        assert_eq!(provision_credentials(&paths).await.unwrap(), paths.kubelet_auth);
    }

    #[tokio::test]
    async fn unreadable_merged_secret_falls_back() {
        let (_dir, paths) = host().await;
        // a directory cannot be read as a file, even by root
        tokio::fs::create_dir_all(&paths.merged_auth).await.unwrap();

        assert_eq!(provision_credentials(&paths).await.unwrap(), paths.kubelet_auth);
    }

    #[tokio::test]
    async fn existing_link_is_replaced() {
        let (_dir, paths) = host().await;
        provision_credentials(&paths).await.unwrap();
        assert_eq!(link_target(&paths).await, paths.kubelet_auth);

        tokio::fs::write(&paths.merged_auth, br#"{}"#).await.unwrap();
        provision_credentials(&paths).await.unwrap();
        assert_eq!(link_target(&paths).await, paths.merged_auth);
    }

    #[tokio::test]
    async fn empty_chain_selects_nothing() {
        assert_eq!(CredentialChain::new(vec![]).select().await, None);
    }
}
