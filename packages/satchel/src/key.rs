//! Identities for cached items.
//!
//! Entries are addressed logically by [`CacheKey`] (owner + item) and their
//! bytes are stored content-addressed by [`BlobKey`]. The [`Locator`] records
//! where an item came from; it is a secondary lookup signal only.

use std::str::FromStr;

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Serialize};
use tap::Pipe;

/// The logical parent grouping of cached items, e.g. an assignment.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
#[debug("{_0:?}")]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OwnerId {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("owner id cannot be empty");
        }
        Ok(Self::new(s))
    }
}

/// A single cacheable unit under an owner, e.g. a submission.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
#[debug("{_0:?}")]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ItemId {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("item id cannot be empty");
        }
        Ok(Self::new(s))
    }
}

/// The primary identity of a cache entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{owner}/{item}")]
#[debug("{owner}/{item}")]
pub struct CacheKey {
    pub owner: OwnerId,
    pub item: ItemId,
}

impl CacheKey {
    pub fn new(owner: impl Into<OwnerId>, item: impl Into<ItemId>) -> Self {
        Self {
            owner: owner.into(),
            item: item.into(),
        }
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&OwnerId> for OwnerId {
    fn from(id: &OwnerId) -> Self {
        id.clone()
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&ItemId> for ItemId {
    fn from(id: &ItemId) -> Self {
        id.clone()
    }
}

/// Where an item's document is fetched from.
///
/// Opaque to the cache: only the transfer capability interprets it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
#[debug("{_0:?}")]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Locator {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("locator cannot be empty");
        }
        Ok(Self::new(s))
    }
}

impl From<&str> for Locator {
    fn from(locator: &str) -> Self {
        Self::new(locator)
    }
}

/// The content address of a stored blob: the blake3 hash of its bytes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct BlobKey(blake3::Hash);

impl BlobKey {
    /// Hash the contents of a buffer to create a key.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        blake3::hash(buffer.as_ref()).pipe(Self)
    }

    /// View the key as a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Attempt to parse the key from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let hex = hex.as_ref();
        blake3::Hash::from_hex(hex)
            .with_context(|| format!("decode blob key {hex:?}"))
            .map(Self)
    }
}

impl PartialEq<blake3::Hash> for BlobKey {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.0 == *other
    }
}
