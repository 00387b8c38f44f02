//! `chroot`-based sandbox for Linux hosts.
//!
//! Each RUN gets a fresh temporary directory holding a materialized copy of
//! the snapshot. The command runs under `chroot --userspec`, the directory
//! is captured and diffed against the input, then deleted. Dropping the
//! future (e.g. on timeout) kills the child and removes the directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use strata_core::error::{Result, StrataError};

use super::{ExecOutcome, RunRequest, Sandbox, DEFAULT_PATH};
use crate::fs::Snapshot;

/// Sandbox that runs commands with `chroot(8)`. Requires root.
#[derive(Debug, Clone)]
pub struct ChrootSandbox {
    scratch_dir: PathBuf,
}

impl ChrootSandbox {
    /// Use the system temp directory for scratch roots.
    pub fn new() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Place scratch roots under `dir`.
    pub fn with_scratch_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: dir.into(),
        }
    }

    fn command(&self, root: &Path, request: &RunRequest) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("chroot");
        cmd.arg(format!("--userspec={}:{}", request.uid, request.gid));
        cmd.arg(root);
        cmd.arg("/bin/sh");
        cmd.arg("-c");
        cmd.arg(format!(
            "cd {} && {}",
            shell_quote(&request.workdir),
            request.command
        ));

        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", if request.uid == 0 { "/root" } else { "/" });
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for ChrootSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ChrootSandbox {
    async fn execute(&self, request: &RunRequest, snapshot: &Snapshot) -> Result<ExecOutcome> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix("strata-run-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| StrataError::SandboxError(format!("failed to create scratch root: {}", e)))?;
        let root = workspace.path().join("rootfs");

        let input = snapshot.clone();
        let target = root.clone();
        let workdir = request.workdir.clone();
        blocking(move || {
            input.materialize(&target)?;
            std::fs::create_dir_all(target.join(workdir.trim_start_matches('/')))?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            command = %request.command,
            root = %root.display(),
            uid = request.uid,
            gid = request.gid,
            "Executing RUN in chroot"
        );

        let output = self
            .command(&root, request)
            .output()
            .await
            .map_err(|e| StrataError::SandboxError(format!("failed to spawn chroot: {}", e)))?;

        let target = root.clone();
        let mut after = blocking(move || Snapshot::capture(&target)).await?;
        if unsafe { libc::geteuid() } != 0 {
            reattribute(snapshot, &mut after, request);
        }

        Ok(ExecOutcome {
            diff: snapshot.diff(&after),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StrataError::SandboxError(format!("sandbox task failed: {}", e)))?
}

/// Without root, every captured node is owned by the invoking user. Put
/// back the recorded owners of pre-existing paths and give new paths the
/// requested identity.
fn reattribute(before: &Snapshot, after: &mut Snapshot, request: &RunRequest) {
    let fixed: Vec<(String, crate::fs::Node)> = after
        .iter()
        .map(|(path, node)| {
            let mut node = node.clone();
            match before.get(path) {
                Some(prev) => {
                    node.uid = prev.uid;
                    node.gid = prev.gid;
                }
                None => {
                    node.uid = request.uid;
                    node.gid = request.gid;
                }
            }
            (path.clone(), node)
        })
        .collect();
    for (path, node) in fixed {
        after.insert(&path, node);
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Node;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/app"), "'/app'");
        assert_eq!(shell_quote("/it's"), r"'/it'\''s'");
    }

    #[test]
    fn test_command_line() {
        let sandbox = ChrootSandbox::with_scratch_dir("/tmp");
        let mut request = RunRequest::new("echo hi > /f");
        request.workdir = "/usr/share/search".to_string();
        request.uid = 1000;
        request.gid = 1000;
        request.env.push(("X".to_string(), "1".to_string()));

        let cmd = sandbox.command(Path::new("/tmp/root"), &request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--userspec=1000:1000");
        assert_eq!(args[1], "/tmp/root");
        assert_eq!(args[4], "cd '/usr/share/search' && echo hi > /f");
    }

    #[test]
    fn test_reattribute() {
        let mut before = Snapshot::new();
        before.insert("/etc/passwd", Node::file("root:x:0:0::/root:/bin/sh\n"));

        let mut after = Snapshot::new();
        after.insert("/etc/passwd", Node::file("root:x:0:0::/root:/bin/sh\n").with_owner(501, 20));
        after.insert("/f", Node::file("hi\n").with_owner(501, 20));

        let mut request = RunRequest::new("echo hi > /f");
        request.uid = 1000;
        request.gid = 1000;
        reattribute(&before, &mut after, &request);

        assert_eq!(after.get("/etc/passwd").unwrap().uid, 0);
        assert_eq!(after.get("/f").unwrap().uid, 1000);
        assert!(before.diff(&after).get("/etc/passwd").is_none());
    }
}
