//! Layer executor: applies one instruction to a snapshot.
//!
//! Filesystem effects are computed on a private copy of the input snapshot
//! and returned as a diff; metadata instructions only update the config.
//! The executor never touches the layer cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use strata_core::error::{Result, StrataError};

use crate::build::context::BuildContext;
use crate::build::identity::resolve_ids;
use crate::build::recipe::{split_reference, Instruction, Step};
use crate::fs::{normalize_path, FsDiff, Node, Snapshot};
use crate::image::{BaseImage, ImageConfig, ImageRegistry};
use crate::sandbox::{RunRequest, Sandbox};

/// Everything a step needs besides the snapshot.
pub struct StepContext<'a> {
    pub step: &'a Step,
    /// The step's instruction after build-argument expansion.
    pub instruction: &'a Instruction,
    pub context: &'a BuildContext,
    /// Declared build arguments and their values.
    pub args: &'a BTreeMap<String, String>,
}

/// Inputs resolved before the cache lookup.
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    /// `(name, digest)` pairs folded into the cache key.
    pub digests: Vec<(String, String)>,
    /// Resolved FROM image.
    pub base: Option<BaseImage>,
}

/// What applying a step produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub diff: FsDiff,
    /// Cumulative config after the step.
    pub config: ImageConfig,
    pub from_base: bool,
}

/// Applies instructions using a registry for FROM and a sandbox for RUN.
#[derive(Clone)]
pub struct LayerExecutor {
    registry: Arc<dyn ImageRegistry>,
    sandbox: Arc<dyn Sandbox>,
    run_timeout: Option<Duration>,
}

impl LayerExecutor {
    pub fn new(registry: Arc<dyn ImageRegistry>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            registry,
            sandbox,
            run_timeout: None,
        }
    }

    /// Fail any RUN that takes longer than `timeout`.
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    /// Resolve the inputs the instruction text does not capture.
    pub async fn prepare(&self, cx: &StepContext<'_>) -> Result<StepInputs> {
        let mut inputs = StepInputs::default();
        match cx.instruction {
            Instruction::From { reference, .. } => {
                let base = self.resolve_base(cx.step, reference).await?;
                inputs.digests.push(("base".to_string(), base.id.clone()));
                inputs.base = Some(base);
            }
            Instruction::Copy { sources, .. } => {
                for source in sources {
                    let digests = cx.context.source_digests(source);
                    if digests.is_empty() {
                        return Err(StrataError::SourceNotFound {
                            step: cx.step.index,
                            line: cx.step.line,
                            path: source.clone(),
                        });
                    }
                    inputs.digests.extend(
                        digests
                            .into_iter()
                            .map(|(path, digest)| (format!("{}:{}", source, path), digest)),
                    );
                }
            }
            Instruction::Run { .. } => {
                inputs.digests.extend(
                    cx.args
                        .iter()
                        .map(|(name, value)| (format!("arg:{}", name), value.clone())),
                );
            }
            _ => {}
        }
        Ok(inputs)
    }

    /// Apply the step to `snapshot` whose config is `config`.
    pub async fn apply(
        &self,
        snapshot: &Snapshot,
        config: &ImageConfig,
        cx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutput> {
        let mut config = config.clone();
        let step = cx.step;

        let diff = match cx.instruction {
            Instruction::From { reference, .. } => {
                let base = match inputs.base {
                    Some(base) => base,
                    None => self.resolve_base(step, reference).await?,
                };
                tracing::debug!(
                    step = step.index,
                    base = %base.reference,
                    entries = base.rootfs.len(),
                    "Using base image"
                );
                let diff = snapshot.diff(&base.rootfs);
                return Ok(StepOutput {
                    diff,
                    config: base.config,
                    from_base: true,
                });
            }
            Instruction::Run { command, .. } => self.run(snapshot, &config, cx, command).await?,
            Instruction::Copy {
                sources,
                dest,
                chown,
            } => copy(snapshot, &config, cx, sources, dest, chown.as_deref())?,
            Instruction::Env { vars } => {
                for (key, value) in vars {
                    config.env.insert(key.clone(), value.clone());
                }
                FsDiff::new()
            }
            Instruction::Workdir { path } => {
                config.workdir = normalize_path(&config.workdir, path);
                FsDiff::new()
            }
            Instruction::User { user } => {
                config.user = Some(user.clone());
                FsDiff::new()
            }
            Instruction::Cmd { exec } => {
                config.cmd = Some(exec.clone());
                FsDiff::new()
            }
            Instruction::Entrypoint { exec } => {
                config.entrypoint = Some(exec.clone());
                FsDiff::new()
            }
            Instruction::Expose { ports } => {
                config.exposed_ports.extend(ports.iter().copied());
                FsDiff::new()
            }
            Instruction::Label { labels } => {
                for (key, value) in labels {
                    config.labels.insert(key.clone(), value.clone());
                }
                FsDiff::new()
            }
            Instruction::Arg { .. } => FsDiff::new(),
        };

        Ok(StepOutput {
            diff,
            config,
            from_base: false,
        })
    }

    async fn resolve_base(&self, step: &Step, reference: &str) -> Result<BaseImage> {
        if reference == "scratch" {
            return Ok(BaseImage::new(
                "scratch",
                Snapshot::new(),
                ImageConfig::default(),
            ));
        }
        let (name, tag) = split_reference(reference);
        self.registry
            .resolve(&name, &tag)
            .await?
            .ok_or_else(|| StrataError::BaseImageNotFound {
                step: step.index,
                line: step.line,
                reference: reference.to_string(),
            })
    }

    async fn run(
        &self,
        snapshot: &Snapshot,
        config: &ImageConfig,
        cx: &StepContext<'_>,
        command: &str,
    ) -> Result<FsDiff> {
        let step = cx.step;
        let user = config.user.as_deref().unwrap_or("root");
        let (uid, gid) = resolve_ids(user, snapshot).map_err(|reason| StrataError::UnknownIdentity {
            step: step.index,
            line: step.line,
            spec: user.to_string(),
            reason,
        })?;

        // ENV wins over ARG with the same name.
        let mut env: BTreeMap<&str, &str> = cx
            .args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (k, v) in &config.env {
            env.insert(k, v);
        }

        let request = RunRequest {
            command: command.to_string(),
            env: env
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            workdir: config.workdir.clone(),
            uid,
            gid,
        };

        let execution = self.sandbox.execute(&request, snapshot);
        let outcome = match self.run_timeout {
            Some(timeout) => tokio::time::timeout(timeout, execution)
                .await
                .map_err(|_| {
                    tracing::warn!(step = step.index, command, ?timeout, "RUN timed out");
                    StrataError::Timeout {
                        step: step.index,
                        line: step.line,
                        command: command.to_string(),
                        timeout,
                    }
                })??,
            None => execution.await?,
        };

        if !outcome.success() {
            return Err(StrataError::RunCommandFailed {
                step: step.index,
                line: step.line,
                command: command.to_string(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr.trim().to_string(),
            });
        }

        let (upserts, deletes) = outcome.diff.counts();
        tracing::debug!(step = step.index, upserts, deletes, "RUN completed");
        Ok(outcome.diff)
    }
}

/// COPY with Docker destination rules: a destination ending in `/`, an
/// existing directory, or several sources means "copy into"; a single
/// named file otherwise lands exactly at the destination.
fn copy(
    snapshot: &Snapshot,
    config: &ImageConfig,
    cx: &StepContext<'_>,
    sources: &[String],
    dest: &str,
    chown: Option<&str>,
) -> Result<FsDiff> {
    let step = cx.step;
    let (uid, gid) = match chown {
        Some(spec) => resolve_ids(spec, snapshot).map_err(|reason| StrataError::UnknownIdentity {
            step: step.index,
            line: step.line,
            spec: spec.to_string(),
            reason,
        })?,
        None => (0, 0),
    };

    let target = normalize_path(&config.workdir, dest);
    let into_dir = dest.ends_with('/')
        || sources.len() > 1
        || snapshot.get(&target).map(|n| n.is_dir()).unwrap_or(false);

    let mut after = snapshot.clone();
    for source in sources {
        let files = cx.context.resolve_source(source);
        if files.is_empty() {
            return Err(StrataError::SourceNotFound {
                step: step.index,
                line: step.line,
                path: source.clone(),
            });
        }
        if files.iter().any(|f| f.from_dir) {
            after.insert(&target, Node::dir().with_owner(uid, gid));
        }
        for file in files {
            let path = if file.from_dir || into_dir {
                format!("{}/{}", target, file.relative)
            } else {
                target.clone()
            };
            after.insert(&path, Node::file(file.data).with_owner(uid, gid));
        }
    }

    Ok(snapshot.diff(&after))
}
