//! Registry front end and query dispatch
//!
//! A [`Locator`] owns the memory being inspected, the sample provider, the
//! trusted accessor, and one profile slot per plan variant. Queries read the
//! live instance's discriminator, pick the variant that claims it, build that
//! variant's profile on first use, and replay it.
//!
//! ## Example
//!
//! ```ignore
//! use locator_core::{Locator, LocatorConfig, Outcome, builtin_plan};
//!
//! let capture = CaptureFile::load(path)?;
//! let plan = builtin_plan(capture.memory.pointer_width());
//! let config = LocatorConfig::builder().replicates(5).build();
//! let locator = Locator::new(&capture, &capture, &capture, plan, config)?;
//!
//! match locator.locate(base)? {
//!     Outcome::Located(record) => println!("{:?}", record.get("metadata")),
//!     Outcome::Unsupported { .. } => println!("unsupported instance"),
//! }
//! ```

mod config;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::{Address, ReadMemory};
use crate::profile::{DiscoveryPlan, Profile, ProfileBuilder, ProfileRegistry, SlotState, VariantPlan};
use crate::record::ResultRecord;
use crate::sample::{SamplePool, SampleProvider};

pub use config::{LocatorConfig, LocatorConfigBuilder};

/// Trusted view of a runtime instance, independent of any discovered chain
pub trait RuntimeAccessor {
    /// Value identifying the structural variant of the instance at `base`.
    ///
    /// `None` when the instance cannot be identified.
    fn discriminator<R: ReadMemory + ?Sized>(&self, memory: &R, base: Address) -> Option<Address>;
}

impl<T: RuntimeAccessor + ?Sized> RuntimeAccessor for &T {
    fn discriminator<R: ReadMemory + ?Sized>(&self, memory: &R, base: Address) -> Option<Address> {
        (**self).discriminator(memory, base)
    }
}

/// Result of a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Located(ResultRecord),
    /// No variant claims the instance's discriminator, or it has none
    Unsupported { discriminator: Option<Address> },
}

pub struct Locator<M, P, A> {
    memory: M,
    pool: SamplePool<P>,
    accessor: A,
    plan: DiscoveryPlan,
    config: LocatorConfig,
    registry: ProfileRegistry,
}

impl<M, P, A> Locator<M, P, A>
where
    M: ReadMemory,
    P: SampleProvider,
    A: RuntimeAccessor,
{
    pub fn new(memory: M, provider: P, accessor: A, plan: DiscoveryPlan, config: LocatorConfig) -> Result<Self> {
        plan.validate()?;
        if memory.pointer_width() != plan.pointer_width {
            return Err(Error::InvalidPlan(format!(
                "plan '{}' targets {} but memory is {}",
                plan.name,
                plan.pointer_width,
                memory.pointer_width()
            )));
        }

        let registry = ProfileRegistry::new(plan.variants.iter().map(|v| v.name.clone()));
        Ok(Self {
            memory,
            pool: SamplePool::new(provider),
            accessor,
            plan,
            config,
            registry,
        })
    }

    pub fn plan(&self) -> &DiscoveryPlan {
        &self.plan
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn pool(&self) -> &SamplePool<P> {
        &self.pool
    }

    pub fn state(&self, variant: &str) -> Option<SlotState> {
        self.registry.state(variant)
    }

    /// Discriminator of one variant, computed from its primary sample once
    pub fn discriminator(&self, variant: &str) -> Result<Address> {
        let plan = self.variant_plan(variant)?;
        self.registry
            .discriminator(variant, || self.builder().discriminator(plan))
    }

    /// Every variant's discriminator, in plan order.
    ///
    /// Fails when two variants share a discriminator, since dispatch could
    /// not tell them apart.
    pub fn discriminators(&self) -> Result<Vec<(String, Address)>> {
        let mut seen: Vec<(String, Address)> = Vec::with_capacity(self.plan.variants.len());
        for variant in &self.plan.variants {
            let discriminator = self.discriminator(&variant.name)?;
            if let Some((first, _)) = seen.iter().find(|(_, d)| *d == discriminator) {
                return Err(Error::AmbiguousDiscriminator {
                    discriminator,
                    first: first.clone(),
                    second: variant.name.clone(),
                });
            }
            seen.push((variant.name.clone(), discriminator));
        }
        Ok(seen)
    }

    /// The variant's profile, built on first request
    pub fn profile(&self, variant: &str) -> Result<Arc<Profile>> {
        let plan = self.variant_plan(variant)?;
        self.registry.profile(variant, || {
            let discriminator = self.discriminator(variant)?;
            self.builder().build(plan, discriminator)
        })
    }

    /// Build every variant's profile
    pub fn profiles(&self) -> Result<Vec<Arc<Profile>>> {
        self.discriminators()?;
        self.plan
            .variants
            .iter()
            .map(|variant| self.profile(&variant.name))
            .collect()
    }

    /// Profiles built so far
    pub fn built_profiles(&self) -> Vec<Arc<Profile>> {
        self.registry.built()
    }

    /// Install a previously built profile instead of building it.
    ///
    /// The variant's discriminator is computed through the accessor first; a
    /// profile recorded under a different discriminator is skipped and the
    /// variant is discovered again on demand. Returns `false` when skipped or
    /// when the variant already has a build outcome.
    pub fn preload(&self, profile: Profile) -> Result<bool> {
        if profile.pointer_width != self.plan.pointer_width {
            return Err(Error::InvalidPlan(format!(
                "profile for '{}' targets {}",
                profile.variant, profile.pointer_width
            )));
        }

        let current = self.discriminator(&profile.variant)?;
        if current != profile.discriminator {
            warn!(
                "Stored profile for '{}' has discriminator 0x{:X}, runtime reports 0x{:X}; ignoring it",
                profile.variant, profile.discriminator, current
            );
            return Ok(false);
        }
        self.registry.preload(profile)
    }

    /// Read every field of the instance at `base`
    pub fn locate(&self, base: Address) -> Result<Outcome> {
        let Some(live) = self.accessor.discriminator(&self.memory, base) else {
            debug!("No discriminator for instance at 0x{:X}", base);
            return Ok(Outcome::Unsupported { discriminator: None });
        };

        let discriminators = self.discriminators()?;
        let Some((variant, _)) = discriminators.iter().find(|(_, d)| *d == live) else {
            info!(
                "Instance at 0x{:X} has discriminator 0x{:X}, claimed by no variant",
                base, live
            );
            return Ok(Outcome::Unsupported {
                discriminator: Some(live),
            });
        };

        debug!("Instance at 0x{:X} is variant '{}'", base, variant);
        let profile = self.profile(variant)?;
        Ok(Outcome::Located(profile.replay(
            &self.memory,
            base,
            self.config.max_string_len,
        )))
    }

    fn builder(&self) -> ProfileBuilder<'_, M, P, A> {
        ProfileBuilder::new(&self.memory, &self.pool, &self.accessor, &self.plan, &self.config)
    }

    fn variant_plan(&self, variant: &str) -> Result<&VariantPlan> {
        self.plan
            .variant(variant)
            .ok_or_else(|| Error::InvalidPlan(format!("unknown variant '{}'", variant)))
    }
}
