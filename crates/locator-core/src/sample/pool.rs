use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use tracing::debug;

use super::{Format, Sample, SampleKey, SampleProvider, Storage};
use crate::error::Result;

type SampleCell = Arc<OnceCell<Arc<Sample>>>;

/// Memoizing front of a [`SampleProvider`].
///
/// Each (variant, key) is requested from the provider at most once, even
/// when several threads ask for it concurrently; losers of the race wait
/// for the winner's result. A failed request is not cached.
pub struct SamplePool<P> {
    provider: P,
    cells: Mutex<HashMap<(String, SampleKey), SampleCell>>,
}

impl<P: SampleProvider> SamplePool<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn get(&self, variant: &str, key: SampleKey) -> Result<Arc<Sample>> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells
                .entry((variant.to_string(), key))
                .or_default()
                .clone()
        };

        cell.get_or_try_init(|| {
            debug!("Building sample {} for variant '{}'", key, variant);
            let sample = self.provider.sample(variant, key)?;
            debug!("  sample {} base: 0x{:X}", key, sample.base);
            Ok(Arc::new(sample))
        })
        .cloned()
    }

    /// Every combination of the given axes, `replicates` times, in a fixed order
    pub fn pool(
        &self,
        variant: &str,
        storages: &[Storage],
        formats: &[Format],
        replicates: u8,
    ) -> Result<Vec<Arc<Sample>>> {
        let mut samples = Vec::with_capacity(storages.len() * formats.len() * replicates as usize);
        for replicate in 0..replicates {
            for &storage in storages {
                for &format in formats {
                    samples.push(self.get(variant, SampleKey::new(storage, format, replicate))?);
                }
            }
        }
        Ok(samples)
    }

    /// Number of samples built so far
    pub fn cached(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.values().filter(|cell| cell.get().is_some()).count()
    }
}
