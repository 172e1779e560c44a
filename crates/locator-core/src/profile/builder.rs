use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::plan::{DiscoveryPlan, Step, VariantPlan};
use super::{FieldChain, Profile, ReadAs};
use crate::error::{Error, Result};
use crate::locator::{LocatorConfig, RuntimeAccessor};
use crate::memory::{Address, CompiledLayout, ReadMemory};
use crate::offset::{Candidates, Chain, CrossSampleVerifier, ExpandContext, LeafCheck, OffsetSearcher};
use crate::sample::{Sample, SampleProvider, SamplePool};

/// Fields discovered so far for one variant
#[derive(Default)]
struct Discovered {
    fields: BTreeMap<String, FieldChain>,
    /// Final offset of every discovered field, for `Around` candidates
    last_offsets: BTreeMap<String, u32>,
}

impl Discovered {
    fn get(&self, name: &str) -> Result<&FieldChain> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::InvalidPlan(format!("field '{}' has not been discovered", name)))
    }

    fn insert(&mut self, name: &str, field: FieldChain) {
        if let Some(last) = field.chain.last() {
            self.last_offsets.insert(name.to_string(), last);
        }
        self.fields.insert(name.to_string(), field);
    }
}

/// Runs a variant's plan against its sample pool.
///
/// Each step scans the primary sample for candidates, then keeps the first
/// candidate, in scan order, that every sample of the pool accepts.
pub struct ProfileBuilder<'a, R: ReadMemory + ?Sized, P, A> {
    memory: &'a R,
    pool: &'a SamplePool<P>,
    accessor: &'a A,
    plan: &'a DiscoveryPlan,
    config: &'a LocatorConfig,
}

impl<'a, R, P, A> ProfileBuilder<'a, R, P, A>
where
    R: ReadMemory + ?Sized,
    P: SampleProvider,
    A: RuntimeAccessor,
{
    pub fn new(
        memory: &'a R,
        pool: &'a SamplePool<P>,
        accessor: &'a A,
        plan: &'a DiscoveryPlan,
        config: &'a LocatorConfig,
    ) -> Self {
        Self {
            memory,
            pool,
            accessor,
            plan,
            config,
        }
    }

    /// Discriminator of `variant`, read from its primary sample
    pub fn discriminator(&self, variant: &VariantPlan) -> Result<Address> {
        let primary = self.pool.get(&variant.name, variant.primary)?;
        self.accessor
            .discriminator(self.memory, primary.base)
            .ok_or_else(|| Error::DiscriminatorUnavailable {
                variant: variant.name.clone(),
            })
    }

    pub fn build(&self, variant: &VariantPlan, discriminator: Address) -> Result<Profile> {
        info!("Building profile for variant '{}'...", variant.name);

        let primary = self.pool.get(&variant.name, variant.primary)?;
        let samples = self.pool.pool(
            &variant.name,
            &self.config.storages,
            &variant.formats,
            self.config.replicates,
        )?;
        if samples.len() < self.config.min_pool_size {
            return Err(Error::PoolTooSmall {
                required: self.config.min_pool_size,
                actual: samples.len(),
            });
        }
        debug!(
            "  primary sample {} at 0x{:X}, pool of {} samples",
            primary.key,
            primary.base,
            samples.len()
        );

        let verifier = CrossSampleVerifier::new(self.memory)
            .with_limits(self.config.min_pool_size, self.config.max_string_len);

        let mut discovered = Discovered::default();
        for (index, step) in variant.steps.iter().enumerate() {
            debug!("Step {}/{}: {}", index + 1, variant.steps.len(), step.name());
            match self.run_step(variant, step, &primary, &samples, &verifier, &discovered)? {
                Some(chain) => {
                    info!("  {}: {}", step.name(), chain);
                    discovered.insert(
                        step.name(),
                        FieldChain {
                            chain,
                            read: step.read().clone(),
                        },
                    );
                }
                None => warn!("  {}: not found, omitted from profile", step.name()),
            }
        }

        let layouts = self.compiled_layouts(&discovered);
        info!(
            "Profile for variant '{}' built: {} fields, discriminator 0x{:X}",
            variant.name,
            discovered.fields.len(),
            discriminator
        );

        Ok(Profile {
            variant: variant.name.clone(),
            discriminator,
            pointer_width: self.plan.pointer_width,
            fields: discovered.fields,
            layouts,
        })
    }

    fn run_step(
        &self,
        variant: &VariantPlan,
        step: &Step,
        primary: &Sample,
        samples: &[Arc<Sample>],
        verifier: &CrossSampleVerifier<'_, R>,
        discovered: &Discovered,
    ) -> Result<Option<Chain>> {
        let expand = |candidates: &Candidates| {
            candidates.expand(&ExpandContext {
                width: self.plan.pointer_width,
                layouts: &self.plan.layouts,
                known: &discovered.last_offsets,
            })
        };
        let failed = |reason: String| Error::build_failed(&variant.name, step.name(), reason);

        match step {
            Step::Template {
                prefix, levels, leaf, ..
            } => {
                let (scan_base, prefix_chain) = match prefix {
                    Some(prefix) => {
                        let field = discovered.get(prefix)?;
                        let object = self.object_of(&field.chain, primary).ok_or_else(|| {
                            failed(format!("'{}' does not lead to an object on the primary sample", prefix))
                        })?;
                        (object, field.chain.clone())
                    }
                    None => (primary.base, Chain::default()),
                };

                let levels = levels.iter().map(expand).collect::<Result<Vec<_>>>()?;
                let ctx = verifier.context(primary);
                let mut searcher = OffsetSearcher::new(self.memory);
                let found = searcher.scan_templates(scan_base, &levels, |slot| leaf.evaluate(&ctx, slot));
                let count = found.len();
                let candidates = found.into_iter().map(|c| prefix_chain.join(&c.offsets));

                verifier
                    .first_verified(candidates, samples, leaf)?
                    .map(Some)
                    .ok_or_else(|| failed(no_survivor(count)))
            }
            Step::Anchor {
                object, range, anchor, ..
            } => {
                let field = discovered.get(object)?;
                let object_address = self.object_of(&field.chain, primary).ok_or_else(|| {
                    failed(format!("'{}' does not lead to an object on the primary sample", object))
                })?;
                let target = primary
                    .anchor(anchor)
                    .and_then(|a| a.as_u64())
                    .ok_or_else(|| failed(format!("primary sample has no numeric anchor '{}'", anchor)))?;

                let offsets = expand(range)?;
                let mut searcher = OffsetSearcher::new(self.memory);
                let found = searcher.scan_value(object_address, &offsets, target);
                let count = found.len();
                let candidates = found.iter().map(|&offset| field.chain.join(&[offset]));

                verifier
                    .first_verified(candidates, samples, &LeafCheck::anchor_ptr(anchor))?
                    .map(Some)
                    .ok_or_else(|| failed(no_survivor(count)))
            }
            Step::Sibling {
                of,
                delta,
                verify,
                required,
                ..
            } => {
                let base = discovered.get(of)?;
                let chain = base
                    .chain
                    .sibling(*delta)
                    .ok_or_else(|| failed(format!("'{}' shifted by {} leaves the object", of, delta)))?;

                let Some(check) = verify else {
                    return Ok(Some(chain));
                };
                let verdict = verifier.verify(&chain, samples, check)?;
                if verdict.is_accepted() {
                    Ok(Some(chain))
                } else if *required {
                    Err(failed(format!("{} rejected: {}", chain, verdict)))
                } else {
                    debug!("  optional {} rejected: {}", chain, verdict);
                    Ok(None)
                }
            }
        }
    }

    /// Non-null object pointed to by the slot `chain` resolves to on `sample`
    fn object_of(&self, chain: &Chain, sample: &Sample) -> Option<Address> {
        chain
            .rebase(sample.base)
            .resolve(self.memory)
            .address()
            .and_then(|slot| self.memory.try_read_ptr(slot))
            .filter(|&object| object != 0)
    }

    fn compiled_layouts(&self, discovered: &Discovered) -> BTreeMap<String, CompiledLayout> {
        discovered
            .fields
            .values()
            .filter_map(|field| match &field.read {
                ReadAs::Record { layout } => self.plan.layouts.get_key_value(layout),
                _ => None,
            })
            .map(|(name, layout)| (name.clone(), layout.compile(self.plan.pointer_width)))
            .collect()
    }
}

fn no_survivor(count: usize) -> String {
    if count == 0 {
        "scan found no candidate on the primary sample".to_string()
    } else {
        format!("none of {} candidates verified across the pool", count)
    }
}
