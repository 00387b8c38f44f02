//! Content addressing: SHA-256 helpers and the id newtypes built on them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Incremental SHA-256 over length-prefixed fields.
///
/// Every hasher starts with a domain tag so ids of different kinds never
/// collide, and every field is length-prefixed so `("ab", "c")` and
/// `("a", "bc")` hash differently.
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new(domain: &str) -> Self {
        let mut hasher = Self {
            inner: Sha256::new(),
        };
        hasher.field(domain.as_bytes());
        hasher
    }

    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_be_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.field(s.as_bytes())
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing hex digest.
            pub fn from_hex(hex: impl Into<String>) -> Self {
                Self(hex.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 12 hex characters, for logs.
            pub fn short(&self) -> &str {
                &self.0[..self.0.len().min(12)]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "sha256:{}", self.0)
            }
        }
    };
}

content_id!(
    /// Identity of a layer record.
    LayerId
);
content_id!(
    /// Identity of a finalized image.
    ImageId
);
content_id!(
    /// Layer cache key: hash of parent id, normalized instruction and inputs.
    CacheKey
);
