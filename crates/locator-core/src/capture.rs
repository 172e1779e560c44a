//! Captured runtime state
//!
//! A capture bundles a memory snapshot with the samples built in it, the
//! discriminators a trusted accessor reported, and the live instances to
//! query. It is the offline stand-in for an attached process.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::locator::RuntimeAccessor;
use crate::memory::{Address, MemorySnapshot, PointerWidth, ReadMemory};
use crate::sample::{Sample, SampleKey, SampleProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureFile {
    pub memory: MemorySnapshot,
    #[serde(default)]
    pub samples: Vec<Sample>,
    /// Discriminator of each known instance, by base address
    #[serde(default)]
    pub discriminators: BTreeMap<Address, Address>,
    /// Base addresses of the live instances to query
    #[serde(default)]
    pub instances: Vec<Address>,
}

impl CaptureFile {
    pub fn new(memory: MemorySnapshot) -> Self {
        Self {
            memory,
            samples: Vec::new(),
            discriminators: BTreeMap::new(),
            instances: Vec::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let capture: CaptureFile = serde_json::from_str(&content)?;
        debug!(
            "Loaded capture {}: {} regions, {} samples, {} instances",
            path.display(),
            capture.memory.region_count(),
            capture.samples.len(),
            capture.instances.len()
        );
        Ok(capture)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Record a sample and the discriminator its accessor reported
    pub fn add_sample(&mut self, sample: Sample, discriminator: Option<Address>) {
        if let Some(discriminator) = discriminator {
            self.discriminators.insert(sample.base, discriminator);
        }
        self.samples.push(sample);
    }

    /// Record a live instance to query
    pub fn add_instance(&mut self, base: Address, discriminator: Option<Address>) {
        if let Some(discriminator) = discriminator {
            self.discriminators.insert(base, discriminator);
        }
        self.instances.push(base);
    }
}

impl ReadMemory for CaptureFile {
    fn pointer_width(&self) -> PointerWidth {
        self.memory.pointer_width()
    }

    fn is_readable(&self, address: Address, len: usize) -> bool {
        self.memory.is_readable(address, len)
    }

    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        self.memory.read_bytes(address, len)
    }
}

impl SampleProvider for CaptureFile {
    fn sample(&self, variant: &str, key: SampleKey) -> Result<Sample> {
        self.samples
            .iter()
            .find(|s| s.variant == variant && s.key == key)
            .cloned()
            .ok_or_else(|| Error::SampleUnavailable {
                variant: variant.to_string(),
                key,
                message: "not present in capture".to_string(),
            })
    }
}

impl RuntimeAccessor for CaptureFile {
    fn discriminator<R: ReadMemory + ?Sized>(&self, _memory: &R, base: Address) -> Option<Address> {
        self.discriminators.get(&base).copied()
    }
}
