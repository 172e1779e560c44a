use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use once_cell::sync::OnceCell;
use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};

use super::Profile;
use crate::error::{Error, Result};
use crate::memory::Address;

/// Lifecycle of one variant's profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotState {
    Unbuilt,
    Building,
    Built,
    /// Terminal: the build is never retried
    BuildFailed,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Building,
            2 => SlotState::Built,
            3 => SlotState::BuildFailed,
            _ => SlotState::Unbuilt,
        }
    }
}

/// Field used for failures outside any plan step
const SETUP_FIELD: &str = "(setup)";

#[derive(Debug, Clone)]
struct BuildFailure {
    field: String,
    reason: String,
}

impl BuildFailure {
    fn from_error(error: Error) -> Self {
        match error {
            Error::ProfileBuildFailed { field, reason, .. } => Self { field, reason },
            other => Self {
                field: SETUP_FIELD.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn to_error(&self, variant: &str) -> Error {
        Error::build_failed(variant, &self.field, &self.reason)
    }
}

struct Slot {
    variant: String,
    state: AtomicU8,
    discriminator: OnceCell<Address>,
    profile: OnceCell<std::result::Result<Arc<Profile>, BuildFailure>>,
}

impl Slot {
    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One lazily built profile per variant.
///
/// The first caller asking for a variant's profile builds it; concurrent
/// callers block until that build finishes and share its outcome. The
/// outcome, success or failure, is kept for the registry's lifetime.
pub struct ProfileRegistry {
    slots: Vec<Slot>,
}

impl ProfileRegistry {
    pub fn new<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = variants
            .into_iter()
            .map(|variant| Slot {
                variant: variant.into(),
                state: AtomicU8::new(SlotState::Unbuilt as u8),
                discriminator: OnceCell::new(),
                profile: OnceCell::new(),
            })
            .collect();
        Self { slots }
    }

    pub fn variants(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.variant.as_str())
    }

    pub fn state(&self, variant: &str) -> Option<SlotState> {
        self.find(variant)
            .map(|slot| SlotState::from_u8(slot.state.load(Ordering::Acquire)))
    }

    /// The variant's discriminator, computed once on first request.
    ///
    /// A failed computation is not cached.
    pub fn discriminator<F>(&self, variant: &str, compute: F) -> Result<Address>
    where
        F: FnOnce() -> Result<Address>,
    {
        self.slot(variant)?.discriminator.get_or_try_init(compute).copied()
    }

    pub fn cached_discriminator(&self, variant: &str) -> Option<Address> {
        self.find(variant).and_then(|slot| slot.discriminator.get().copied())
    }

    /// The variant's profile, built by `build` on first request
    pub fn profile<F>(&self, variant: &str, build: F) -> Result<Arc<Profile>>
    where
        F: FnOnce() -> Result<Profile>,
    {
        let slot = self.slot(variant)?;
        let outcome = slot.profile.get_or_init(|| {
            slot.set_state(SlotState::Building);
            match build() {
                Ok(profile) => {
                    slot.set_state(SlotState::Built);
                    Ok(Arc::new(profile))
                }
                Err(e) => {
                    warn!("Profile build for variant '{}' failed: {}", variant, e);
                    slot.set_state(SlotState::BuildFailed);
                    Err(BuildFailure::from_error(e))
                }
            }
        });

        match outcome {
            Ok(profile) => Ok(Arc::clone(profile)),
            Err(failure) => Err(failure.to_error(variant)),
        }
    }

    /// Install a profile built elsewhere, e.g. loaded from a store.
    ///
    /// Returns `false` if the variant's slot already holds an outcome.
    pub fn preload(&self, profile: Profile) -> Result<bool> {
        let slot = self.slot(&profile.variant)?;
        let discriminator = *slot.discriminator.get_or_init(|| profile.discriminator);
        if discriminator != profile.discriminator {
            return Err(Error::InvalidPlan(format!(
                "stored profile for '{}' has discriminator 0x{:X}, expected 0x{:X}",
                profile.variant, profile.discriminator, discriminator
            )));
        }

        let variant = profile.variant.clone();
        if slot.profile.set(Ok(Arc::new(profile))).is_err() {
            return Ok(false);
        }
        slot.set_state(SlotState::Built);
        debug!("Preloaded profile for variant '{}'", variant);
        Ok(true)
    }

    /// Profiles built successfully so far, in variant order
    pub fn built(&self) -> Vec<Arc<Profile>> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.profile.get() {
                Some(Ok(profile)) => Some(Arc::clone(profile)),
                _ => None,
            })
            .collect()
    }

    fn find(&self, variant: &str) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.variant == variant)
    }

    fn slot(&self, variant: &str) -> Result<&Slot> {
        self.find(variant)
            .ok_or_else(|| Error::InvalidPlan(format!("unknown variant '{}'", variant)))
    }
}
