//! Profile store for skipping discovery on later runs
//!
//! Built profiles are saved together with the plan that produced them and
//! reused only while that plan is unchanged.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Profile;
use super::plan::DiscoveryPlan;
use crate::error::Result;

/// Default store file name
pub const STORE_FILE: &str = ".locator-profiles.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileStore {
    /// Plan the profiles were built from
    pub plan: DiscoveryPlan,
    pub created_at: DateTime<Utc>,
    pub profiles: Vec<Profile>,
}

impl ProfileStore {
    pub fn new(plan: DiscoveryPlan, profiles: Vec<Profile>) -> Self {
        Self {
            plan,
            created_at: Utc::now(),
            profiles,
        }
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                debug!("Profile store not found or unreadable: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<ProfileStore>(&content) {
            Ok(store) => {
                debug!(
                    "Loaded profile store: plan={}, profiles={}, created_at={}",
                    store.plan.name,
                    store.profiles.len(),
                    store.created_at
                );
                Some(store)
            }
            Err(e) => {
                warn!("Failed to parse profile store: {}", e);
                None
            }
        }
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved {} profiles to {}", self.profiles.len(), path.as_ref().display());
        Ok(())
    }

    /// Whether the stored profiles can stand in for a fresh build of `plan`
    pub fn is_valid_for(&self, plan: &DiscoveryPlan, max_age: Option<Duration>) -> bool {
        if &self.plan != plan {
            debug!(
                "Profile store plan mismatch: stored={}, current={}",
                self.plan.name, plan.name
            );
            return false;
        }

        if let Some(max_age) = max_age {
            let age = Utc::now().signed_duration_since(self.created_at);
            if age > max_age {
                debug!("Profile store expired: age={}s", age.num_seconds());
                return false;
            }
        }

        if let Some(stray) = self
            .profiles
            .iter()
            .find(|p| plan.variant(&p.variant).is_none() || p.pointer_width != plan.pointer_width)
        {
            debug!("Stored profile '{}' does not belong to the plan", stray.variant);
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PointerWidth;
    use crate::offset::Chain;
    use crate::profile::plan::builtin_plan;
    use crate::profile::{FieldChain, ReadAs};
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn profile(variant: &str) -> Profile {
        let mut fields = BTreeMap::new();
        fields.insert(
            "metadata".to_string(),
            FieldChain {
                chain: Chain::template([0x10, 0x28, 0x5C8]),
                read: ReadAs::Pointer,
            },
        );
        Profile {
            variant: variant.to_string(),
            discriminator: 0x7FF0_0000_1000,
            pointer_width: PointerWidth::Bit64,
            fields,
            layouts: BTreeMap::new(),
        }
    }

    #[test]
    fn test_store_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        let store = ProfileStore::new(builtin_plan(PointerWidth::Bit64), vec![profile("compressed")]);
        store.save_to_path(&path).unwrap();

        let loaded = ProfileStore::load_from_path(&path).unwrap();
        assert_eq!(loaded.profiles, store.profiles);
        assert_eq!(loaded.created_at, store.created_at);
    }

    #[test]
    fn test_store_rejects_changed_plan() {
        let plan = builtin_plan(PointerWidth::Bit64);
        let store = ProfileStore::new(plan.clone(), vec![profile("compressed")]);
        assert!(store.is_valid_for(&plan, None));

        let mut widened = plan.clone();
        widened.variants[0].formats.push(crate::sample::Format::Uncompressed);
        assert!(!store.is_valid_for(&widened, None));
        assert!(!store.is_valid_for(&builtin_plan(PointerWidth::Bit32), None));
    }

    #[test]
    fn test_store_expiry() {
        let plan = builtin_plan(PointerWidth::Bit64);
        let mut store = ProfileStore::new(plan.clone(), vec![profile("compressed")]);
        store.created_at = Utc::now() - Duration::hours(48);

        assert!(store.is_valid_for(&plan, None));
        assert!(!store.is_valid_for(&plan, Some(Duration::hours(24))));
    }

    #[test]
    fn test_store_rejects_unknown_variant() {
        let plan = builtin_plan(PointerWidth::Bit64);
        let store = ProfileStore::new(plan.clone(), vec![profile("legacy")]);
        assert!(!store.is_valid_for(&plan, None));
    }

    #[test]
    fn test_load_missing_or_corrupt_store() {
        assert!(ProfileStore::load_from_path("/nonexistent/profiles.json").is_none());

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "{not json").unwrap();
        assert!(ProfileStore::load_from_path(temp_file.path()).is_none());
    }
}
