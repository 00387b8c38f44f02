//! Per-run container configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// A named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name.
    pub volume: String,
    /// Absolute path inside the container.
    pub mount_path: String,
}

impl std::str::FromStr for VolumeMount {
    type Err = StrataError;

    /// Parse the `name:/path` form.
    fn from_str(s: &str) -> Result<Self> {
        let (volume, mount_path) = s.split_once(':').ok_or_else(|| {
            StrataError::InvalidRunConfig(format!("volume mount '{}' must be name:/path", s))
        })?;
        if volume.is_empty() || !mount_path.starts_with('/') {
            return Err(StrataError::InvalidRunConfig(format!(
                "volume mount '{}' must be name:/absolute/path",
                s
            )));
        }
        Ok(Self {
            volume: volume.to_string(),
            mount_path: mount_path.to_string(),
        })
    }
}

/// Ephemeral configuration for one container run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRunConfig {
    /// Identifier of this run.
    pub container_id: String,
    /// Image tag or image id.
    pub image: String,
    /// Volumes to attach.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Memory ceiling in bytes. Enforced by the execution environment.
    pub memory_limit_bytes: i64,
    /// Environment overrides applied over the image environment.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Run-as override (`user[:group]`), otherwise the image user.
    #[serde(default)]
    pub user: Option<String>,
}

impl ContainerRunConfig {
    pub fn new(container_id: &str, image: &str, memory_limit_bytes: i64) -> Self {
        Self {
            container_id: container_id.to_string(),
            image: image.to_string(),
            volumes: Vec::new(),
            memory_limit_bytes,
            env: Vec::new(),
            user: None,
        }
    }

    pub fn with_volume(mut self, volume: &str, mount_path: &str) -> Self {
        self.volumes.push(VolumeMount {
            volume: volume.to_string(),
            mount_path: mount_path.to_string(),
        });
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Reject configurations the engine cannot hand to a runtime.
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_bytes <= 0 {
            return Err(StrataError::InvalidRunConfig(format!(
                "memory limit must be positive, got {}",
                self.memory_limit_bytes
            )));
        }
        if self.image.trim().is_empty() {
            return Err(StrataError::InvalidRunConfig(
                "image reference is empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for mount in &self.volumes {
            if !mount.mount_path.starts_with('/') {
                return Err(StrataError::InvalidRunConfig(format!(
                    "mount path '{}' must be absolute",
                    mount.mount_path
                )));
            }
            if !seen.insert(mount.mount_path.as_str()) {
                return Err(StrataError::InvalidRunConfig(format!(
                    "mount path '{}' used twice",
                    mount.mount_path
                )));
            }
        }
        Ok(())
    }
}

/// Parse a human-readable memory size (e.g., "512m", "2g", "1024") into bytes.
///
/// Negative and zero values parse successfully; `validate` rejects them.
pub fn parse_memory(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }
    let (num, mult) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024i64 * 1024 * 1024)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024i64 * 1024)
    } else if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024i64)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1i64)
    } else {
        return Err(StrataError::InvalidRunConfig(format!(
            "unrecognized memory size: {}",
            s
        )));
    };
    let n: i64 = num
        .parse()
        .map_err(|_| StrataError::InvalidRunConfig(format!("invalid number: {}", num)))?;
    n.checked_mul(mult)
        .ok_or_else(|| StrataError::InvalidRunConfig(format!("memory size overflows: {}", s)))
}
