//! Sandboxed execution of RUN commands.
//!
//! A sandbox receives a private copy of the build snapshot, runs one shell
//! command against it and reports the filesystem diff it produced. Nothing
//! it does is visible to the host or to other builds.

mod chroot;

pub use chroot::ChrootSandbox;

use async_trait::async_trait;

use strata_core::error::Result;

use crate::fs::{FsDiff, Snapshot};

/// Default PATH for RUN when the image does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One RUN invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Shell command, run as `/bin/sh -c <command>`.
    pub command: String,
    /// Full environment (image env plus declared build args).
    pub env: Vec<(String, String)>,
    /// Absolute working directory inside the snapshot.
    pub workdir: String,
    /// Numeric identity to run as.
    pub uid: u32,
    pub gid: u32,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            workdir: "/".to_string(),
            uid: 0,
            gid: 0,
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Result of running a command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Changes relative to the input snapshot.
    pub diff: FsDiff,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for RUN execution backends.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `request` against `snapshot`. A non-zero exit is reported in the
    /// outcome, not as an error; errors mean the sandbox itself failed.
    async fn execute(&self, request: &RunRequest, snapshot: &Snapshot) -> Result<ExecOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_value_last_wins() {
        let mut req = RunRequest::new("true");
        req.env.push(("HEAP".to_string(), "1g".to_string()));
        req.env.push(("HEAP".to_string(), "2g".to_string()));
        assert_eq!(req.env_value("HEAP"), Some("2g"));
        assert_eq!(req.env_value("PATH"), None);
    }

    #[test]
    fn test_outcome_success() {
        let ok = ExecOutcome::default();
        assert!(ok.success());
        let failed = ExecOutcome {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
