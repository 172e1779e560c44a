//! Sample instances used for scanning and verification
//!
//! A sample is a disposable instance of the target structure tagged by the
//! variation axes it represents. Samples are produced by a
//! [`SampleProvider`] and memoized for the lifetime of a [`SamplePool`].

mod pool;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::Result;
use crate::memory::Address;

pub use pool::SamplePool;

/// Where the sample's backing image was loaded from
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Storage {
    /// Loaded from a file on disk
    File,
    /// Loaded from an in-memory buffer
    Memory,
}

/// Encoding of the sample's payload
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Format {
    Compressed,
    Uncompressed,
}

/// Variation axes a sample represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub storage: Storage,
    pub format: Format,
    pub replicate: u8,
}

impl SampleKey {
    pub const fn new(storage: Storage, format: Format, replicate: u8) -> Self {
        Self {
            storage,
            format,
            replicate,
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.storage, self.format, self.replicate)
    }
}

/// Independently known value for a sample, obtained from a trusted accessor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorValue {
    Address(Address),
    Int(u64),
    Text(String),
}

impl AnchorValue {
    /// Numeric view of address and integer anchors
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AnchorValue::Address(v) | AnchorValue::Int(v) => Some(*v),
            AnchorValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AnchorValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// One concrete instance of the target, never mutated once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub variant: String,
    pub key: SampleKey,
    pub base: Address,
    #[serde(default)]
    pub anchors: BTreeMap<String, AnchorValue>,
}

impl Sample {
    pub fn new(variant: impl Into<String>, key: SampleKey, base: Address) -> Self {
        Self {
            variant: variant.into(),
            key,
            base,
            anchors: BTreeMap::new(),
        }
    }

    pub fn with_anchor(mut self, name: &str, value: AnchorValue) -> Self {
        self.anchors.insert(name.to_string(), value);
        self
    }

    pub fn anchor(&self, name: &str) -> Option<&AnchorValue> {
        self.anchors.get(name)
    }
}

/// Source of sample instances.
///
/// Producing a sample may be expensive; callers go through a [`SamplePool`]
/// which asks for each key at most once.
pub trait SampleProvider {
    fn sample(&self, variant: &str, key: SampleKey) -> Result<Sample>;
}

impl<T: SampleProvider + ?Sized> SampleProvider for &T {
    fn sample(&self, variant: &str, key: SampleKey) -> Result<Sample> {
        (**self).sample(variant, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_sample_key_display() {
        let key = SampleKey::new(Storage::Memory, Format::Uncompressed, 3);
        assert_eq!(key.to_string(), "memory/uncompressed#3");
    }

    #[test]
    fn test_axes_parse() {
        assert_eq!("file".parse::<Storage>().unwrap(), Storage::File);
        assert_eq!("compressed".parse::<Format>().unwrap(), Format::Compressed);
        assert_eq!(Storage::iter().count(), 2);
    }

    #[test]
    fn test_anchor_views() {
        let sample = Sample::new("v", SampleKey::new(Storage::File, Format::Compressed, 0), 0x1000)
            .with_anchor("image_base", AnchorValue::Address(0x40_0000))
            .with_anchor("path", AnchorValue::Text("a.dll".into()));

        assert_eq!(sample.anchor("image_base").and_then(AnchorValue::as_u64), Some(0x40_0000));
        assert_eq!(sample.anchor("path").and_then(AnchorValue::as_text), Some("a.dll"));
        assert_eq!(sample.anchor("path").and_then(AnchorValue::as_u64), None);
        assert!(sample.anchor("missing").is_none());
    }
}
