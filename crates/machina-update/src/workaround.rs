//! rpm-ostreed `InaccessiblePaths` drop-in
//!
//! Older rpm-ostreed units mark paths inaccessible that the daemon needs when
//! it is driven from a container. A runtime drop-in clears the setting.

use std::path::Path;

use tracing::info;

use machina_common::{Error, Result};

use crate::command::{CommandRunner, HostCommand};

/// Contents of the drop-in
pub const DROPIN_CONTENTS: &str = "[Service]\nInaccessiblePaths=\n";

/// Write `contents` to `path` via a sibling temp file and rename
pub async fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::validation_for(path.display().to_string(), "not a file path"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::io(format!("renaming {} to {}", tmp.display(), path.display()), e))
}

/// Install the drop-in and reload systemd. Returns `false` if it was already present.
pub async fn ensure_rpm_ostreed_dropin(runner: &dyn CommandRunner, dropin: &Path) -> Result<bool> {
    if tokio::fs::try_exists(dropin).await.unwrap_or(false) {
        return Ok(false);
    }

    if let Some(dir) = dropin.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
    }
    write_file_atomically(dropin, DROPIN_CONTENTS.as_bytes()).await?;
    runner
        .run_streaming(&HostCommand::new("systemctl").arg("daemon-reload"))
        .await?;

    info!(dropin = %dropin.display(), "Enabled rpm-ostreed InaccessiblePaths workaround");
    Ok(true)
}
