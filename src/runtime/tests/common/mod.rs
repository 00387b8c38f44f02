//! Shared fixtures: a scripted in-process sandbox and a seeded registry.
//!
//! The sandbox understands a tiny shell subset joined by `&&` or `;`:
//! `echo <words> > <path>`, `echo <words> >> <path>`, `mkdir -p <path>`,
//! `rm [-rf] <path>`, `sleep <ms>`, `exit <code>` and `true`. `$NAME` words
//! expand from the request environment.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_core::error::Result;
use strata_runtime::fs::normalize_path;
use strata_runtime::{
    ExecOutcome, ImageConfig, MemoryRegistry, Node, RunRequest, Sandbox, Snapshot,
};

#[derive(Default)]
pub struct ScriptedSandbox {
    executions: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution first waits `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(&self, request: &RunRequest, snapshot: &Snapshot) -> Result<ExecOutcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut after = snapshot.clone();
        let mut stderr = String::new();
        let mut exit_code = 0;

        for command in request.command.split(['&', ';']).map(str::trim).filter(|c| !c.is_empty()) {
            let words: Vec<String> = command
                .split_whitespace()
                .map(|w| expand(w.trim_matches(|c| c == '"' || c == '\''), request))
                .collect();
            let resolve = |p: &str| normalize_path(&request.workdir, p);

            match words.first().map(String::as_str) {
                Some("echo") => {
                    let (append, split) = match words.iter().position(|w| w == ">>") {
                        Some(pos) => (true, pos),
                        None => match words.iter().position(|w| w == ">") {
                            Some(pos) => (false, pos),
                            None => continue,
                        },
                    };
                    let Some(target) = words.get(split + 1) else {
                        stderr.push_str("missing redirect target\n");
                        exit_code = 2;
                        break;
                    };
                    let path = resolve(target);
                    let mut data = if append {
                        after.read_file(&path).unwrap_or_default().to_vec()
                    } else {
                        Vec::new()
                    };
                    data.extend_from_slice(words[1..split].join(" ").as_bytes());
                    data.push(b'\n');
                    after.insert(&path, Node::file(data).with_owner(request.uid, request.gid));
                }
                Some("mkdir") => {
                    for dir in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
                        after.insert(&resolve(dir), Node::dir().with_owner(request.uid, request.gid));
                    }
                }
                Some("rm") => {
                    for path in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
                        after.remove(&resolve(path));
                    }
                }
                Some("sleep") => {
                    let ms = words.get(1).and_then(|w| w.parse().ok()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Some("exit") => {
                    exit_code = words.get(1).and_then(|w| w.parse().ok()).unwrap_or(1);
                    if exit_code != 0 {
                        stderr.push_str(&format!("exited with {}\n", exit_code));
                    }
                    break;
                }
                Some("true") => {}
                Some(other) => {
                    stderr.push_str(&format!("{}: command not found\n", other));
                    exit_code = 127;
                    break;
                }
                None => {}
            }
        }

        Ok(ExecOutcome {
            diff: snapshot.diff(&after),
            exit_code,
            stdout: String::new(),
            stderr,
        })
    }
}

fn expand(word: &str, request: &RunRequest) -> String {
    match word.strip_prefix('$') {
        Some(name) => request.env_value(name).unwrap_or("").to_string(),
        None => word.to_string(),
    }
}

/// `base:1`: a tiny root filesystem with a `search` user (1000:1000).
pub fn registry() -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new();
    let mut rootfs = Snapshot::new();
    rootfs.insert("/bin", Node::dir());
    rootfs.insert("/tmp", Node::dir().with_mode(0o1777));
    rootfs.insert(
        "/etc/passwd",
        Node::file("root:x:0:0:root:/root:/bin/sh\nsearch:x:1000:1000::/usr/share/search:/bin/sh\n"),
    );
    rootfs.insert("/etc/group", Node::file("root:x:0:\nsearch:x:1000:\n"));
    let mut config = ImageConfig::default();
    config
        .env
        .insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
    registry.insert("base", "1", rootfs, config);
    Arc::new(registry)
}
