//! Temporary SELinux permissive mode
//!
//! Deploying from inside a privileged container cannot get the right install
//! context, so enforcement is switched off for the duration of the deploy and
//! restored afterwards on every exit path.

use std::future::Future;
use std::path::Path;

use tracing::{error, info};

use machina_common::{Error, Result};

use crate::command::{CommandRunner, HostCommand};

/// Read the enforcement flag. A missing file means SELinux is not enforcing.
pub async fn read_enforcing(enforce_file: &Path) -> Result<bool> {
    let raw = match tokio::fs::read_to_string(enforce_file).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::io(
                format!("failed to read {}", enforce_file.display()),
                e,
            ))
        }
    };
    let value: i64 = raw.trim().parse().map_err(|_| {
        Error::serialization_for_kind(
            "selinux enforce",
            format!("failed to parse selinux enforcing {:?}", raw),
        )
    })?;
    Ok(value == 1)
}

fn setenforce(mode: &str) -> HostCommand {
    HostCommand::new("setenforce").arg(mode)
}

/// Run `body` with SELinux permissive, restoring the original mode afterwards.
///
/// If the host was not enforcing, `body` runs untouched. When both `body` and
/// the restore fail, the body's error is returned and the restore failure is
/// logged.
pub async fn with_permissive<F, Fut, T>(
    runner: &dyn CommandRunner,
    enforce_file: &Path,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let enforcing = read_enforcing(enforce_file).await?;
    if !enforcing {
        info!("SELinux is not enforcing");
        return body().await;
    }

    runner.run_streaming(&setenforce("0")).await?;
    let outcome = body().await;
    let restored = runner.run_streaming(&setenforce("1")).await;

    match (outcome, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_err)) => {
            error!(error = %restore_err, "failed to restore SELinux enforcement");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use mockall::Sequence;

    fn enforce_file(contents: Option<&str>) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enforce");
        if let Some(c) = contents {
            std::fs::write(&path, c).unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn missing_file_is_not_enforcing() {
        let (_dir, path) = enforce_file(None);
        assert!(!read_enforcing(&path).await.unwrap());
    }

    #[tokio::test]
    async fn garbage_enforce_value_is_an_error() {
        let (_dir, path) = enforce_file(Some("maybe\n"));
        assert!(read_enforcing(&path).await.is_err());
    }

    #[tokio::test]
    async fn not_enforcing_never_toggles() {
        let (_dir, path) = enforce_file(Some("0\n"));
        let mut runner = MockCommandRunner::new();
        runner.expect_run_streaming().never();

        let out = with_permissive(&runner, &path, || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn enforcement_restored_after_body_failure() {
        let (_dir, path) = enforce_file(Some("1\n"));
        let mut seq = Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .withf(|cmd| cmd.to_string() == "setenforce 0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_run_streaming()
            .withf(|cmd| cmd.to_string() == "setenforce 1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let out: Result<()> = with_permissive(&runner, &path, || async {
            Err(Error::command("podman run", "exit status: 1"))
        })
        .await;

        assert!(matches!(out, Err(Error::Command { .. })));
    }

    #[tokio::test]
    async fn restore_failure_surfaces_when_body_succeeds() {
        let (_dir, path) = enforce_file(Some("1"));
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streaming()
            .returning(|cmd| match cmd.args[0].as_str() {
                "0" => Ok(()),
                _ => Err(Error::command(cmd.to_string(), "exit status: 1")),
            });

        let err = with_permissive(&runner, &path, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("setenforce 1"));
    }
}
