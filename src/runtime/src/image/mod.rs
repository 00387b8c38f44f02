//! Finalized images and their run metadata.
//!
//! - `store`: persisted image records and the tag index
//! - `registry`: base-image resolution for FROM

pub mod registry;
pub mod store;

pub use registry::{BaseImage, ChainRegistry, ImageRegistry, MemoryRegistry, StoreRegistry};
pub use store::ImageStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::digest::{ImageId, LayerId};

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// An exposed `port/protocol` pair.
///
/// The port is kept wide so out-of-range values survive parsing and are
/// rejected when the image is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u32,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u32) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=65535).contains(&self.port)
    }
}

impl std::str::FromStr for PortSpec {
    type Err = String;

    /// Parse `9200`, `9200/tcp`, `53/udp`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse::<u32>()
            .map_err(|_| format!("invalid port '{}'", port))?;
        Ok(Self { port, protocol })
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Run metadata accumulated by ENV, WORKDIR, USER, CMD, ENTRYPOINT,
/// EXPOSE and LABEL. Later instructions override earlier ones per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    pub workdir: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<PortSpec>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            workdir: "/".to_string(),
            user: None,
            exposed_ports: BTreeSet::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl ImageConfig {
    /// Environment as `KEY=value` strings in key order.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Numeric identity a USER spec resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUser {
    /// The USER value as written, or `root` when undeclared.
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl ResolvedUser {
    pub fn root() -> Self {
        Self {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
        }
    }
}

/// A finalized, immutable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    /// Layer ids, base first, in instruction order.
    pub layers: Vec<LayerId>,
    pub config: ImageConfig,
    pub user: ResolvedUser,
    pub created_at: String,
}

impl Image {
    pub fn top_layer(&self) -> Option<&LayerId> {
        self.layers.last()
    }
}
