//! SHA-256 content digests.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::errors::CasError;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Number of leading hex characters used as the on-disk shard directory.
pub const SHARD_PREFIX_LEN: usize = 2;

/// Identity of a content object: SHA-256 of its uncompressed bytes, as
/// 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Borrow the hex text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the shard directory name and the file name.
    #[must_use]
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(SHARD_PREFIX_LEN)
    }

    /// First twelve characters, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    fn is_valid(raw: &str) -> bool {
        raw.len() == DIGEST_HEX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(raw) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(CasError::InvalidDigest(raw.to_owned()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = CasError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(CasError::InvalidDigest(raw))
        }
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
