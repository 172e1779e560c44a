//! Discovery plans
//!
//! A plan is the static knowledge a profile build starts from: per variant,
//! an ordered list of steps, each naming a field, the bounded candidate sets
//! to scan, and the check every sample must pass. Plans are plain data so
//! ranges can be widened for a new runtime without recompiling.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ReadAs;
use crate::error::{Error, Result};
use crate::memory::layout::runtime;
use crate::memory::{PointerWidth, RecordLayout, ScalarKind, StringEncoding};
use crate::offset::searcher::constants::{IMAGE_BASE_ALIGNMENT, MIN_POOL_SIZE, SCAN_STRIDE};
use crate::offset::{Candidates, LeafCheck};
use crate::sample::{Format, SampleKey, Storage};

/// Everything needed to build profiles for a family of variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPlan {
    pub name: String,
    pub pointer_width: PointerWidth,
    /// Record layouts referenced by `Field` candidates and `Record` reads
    #[serde(default)]
    pub layouts: BTreeMap<String, RecordLayout>,
    pub variants: Vec<VariantPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantPlan {
    pub name: String,
    /// Sample scanned for candidates and used to compute the discriminator
    pub primary: SampleKey,
    /// Formats pooled for verification
    pub formats: Vec<Format>,
    pub steps: Vec<Step>,
}

/// One field to discover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Multi-level template scan from the sample base, or from the object
    /// a previous field points to
    Template {
        name: String,
        #[serde(default)]
        prefix: Option<String>,
        levels: Vec<Candidates>,
        leaf: LeafCheck,
        read: ReadAs,
    },
    /// Value scan inside the object a previous field points to, for a slot
    /// holding the sample's anchor
    Anchor {
        name: String,
        object: String,
        range: Candidates,
        anchor: String,
        read: ReadAs,
    },
    /// Fixed displacement from a previous field's final offset
    Sibling {
        name: String,
        of: String,
        delta: i64,
        read: ReadAs,
        #[serde(default)]
        verify: Option<LeafCheck>,
        #[serde(default = "default_required")]
        required: bool,
    },
}

fn default_required() -> bool {
    true
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Template { name, .. } | Step::Anchor { name, .. } | Step::Sibling { name, .. } => name,
        }
    }

    pub fn read(&self) -> &ReadAs {
        match self {
            Step::Template { read, .. } | Step::Anchor { read, .. } | Step::Sibling { read, .. } => read,
        }
    }

    /// Fields that must be discovered before this one
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            Step::Template { prefix, levels, .. } => prefix
                .as_deref()
                .into_iter()
                .chain(levels.iter().filter_map(Candidates::depends_on))
                .collect(),
            Step::Anchor { object, range, .. } => std::iter::once(object.as_str())
                .chain(range.depends_on())
                .collect(),
            Step::Sibling { of, .. } => vec![of.as_str()],
        }
    }
}

impl DiscoveryPlan {
    pub fn variant(&self, name: &str) -> Option<&VariantPlan> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Structural checks; a plan that passes can be built step by step
    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(invalid(format!("plan '{}' has no variants", self.name)));
        }

        let mut variants = HashSet::new();
        for variant in &self.variants {
            if !variants.insert(variant.name.as_str()) {
                return Err(invalid(format!("duplicate variant '{}'", variant.name)));
            }
            if variant.formats.is_empty() {
                return Err(invalid(format!("variant '{}' pools no formats", variant.name)));
            }
            if variant.steps.is_empty() {
                return Err(invalid(format!("variant '{}' has no steps", variant.name)));
            }

            let mut seen = HashSet::new();
            for step in &variant.steps {
                for dependency in step.dependencies() {
                    if !seen.contains(dependency) {
                        return Err(invalid(format!(
                            "step '{}' of variant '{}' depends on '{}' which is not discovered before it",
                            step.name(),
                            variant.name,
                            dependency
                        )));
                    }
                }
                self.validate_step(&variant.name, step)?;
                if !seen.insert(step.name()) {
                    return Err(invalid(format!(
                        "duplicate step '{}' in variant '{}'",
                        step.name(),
                        variant.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_step(&self, variant: &str, step: &Step) -> Result<()> {
        if let ReadAs::Record { layout } = step.read() {
            self.require_layout(layout)?;
        }
        match step {
            Step::Template { levels, .. } => {
                if levels.is_empty() {
                    return Err(invalid(format!(
                        "template step '{}' of variant '{}' has no levels",
                        step.name(),
                        variant
                    )));
                }
                for level in levels {
                    self.validate_candidates(level)?;
                }
            }
            Step::Anchor { range, .. } => self.validate_candidates(range)?,
            Step::Sibling { .. } => {}
        }
        Ok(())
    }

    fn validate_candidates(&self, candidates: &Candidates) -> Result<()> {
        candidates.check()?;
        if let Candidates::Field { layout, field } = candidates {
            self.require_layout(layout)?
                .compile(self.pointer_width)
                .offset_of(field)?;
        }
        Ok(())
    }

    fn require_layout(&self, name: &str) -> Result<&RecordLayout> {
        self.layouts
            .get(name)
            .ok_or_else(|| invalid(format!("unknown layout '{}'", name)))
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidPlan(message)
}

pub fn load_plan(path: &Path) -> Result<DiscoveryPlan> {
    let content = fs::read_to_string(path)?;
    let plan: DiscoveryPlan = serde_json::from_str(&content)?;
    plan.validate()?;
    debug!(
        "Loaded plan '{}' ({} variants) from {:?}",
        plan.name,
        plan.variants.len(),
        path
    );
    Ok(plan)
}

pub fn save_plan(plan: &DiscoveryPlan, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(plan)?;
    fs::write(path, content)?;
    Ok(())
}

/// Plan for a loaded managed module's internal state.
///
/// Walks from the module object to its IL image, the image's file path and
/// metadata import object, the three image layouts, the CLR header, and the
/// metadata root with its size. Variants are told apart by the virtual
/// table of the metadata import object, which differs between compressed
/// and uncompressed table formats.
pub fn builtin_plan(width: PointerWidth) -> DiscoveryPlan {
    let layouts: BTreeMap<String, RecordLayout> = [
        runtime::sstring(),
        runtime::pe_image_layout(),
        runtime::cor20_header(),
    ]
    .into_iter()
    .map(|layout| (layout.name.clone(), layout))
    .collect();

    let variants = [
        ("compressed", Format::Compressed),
        ("uncompressed", Format::Uncompressed),
    ]
    .into_iter()
    .map(|(name, format)| VariantPlan {
        name: name.to_string(),
        primary: SampleKey::new(Storage::File, format, 0),
        formats: vec![format],
        steps: module_steps(width, &layouts),
    })
    .collect();

    DiscoveryPlan {
        name: "clr-module".to_string(),
        pointer_width: width,
        layouts,
        variants,
    }
}

fn module_steps(width: PointerWidth, layouts: &BTreeMap<String, RecordLayout>) -> Vec<Step> {
    let w = width.bytes() as u32;
    let wi = w as i64;
    let offset_in = |layout: &str, path: &str| -> u32 {
        layouts
            .get(layout)
            .and_then(|l| l.compile(width).field(path).map(|f| f.offset))
            .unwrap_or_default()
    };
    let buffer = offset_in("sstring", "buffer");
    let image_base = offset_in("pe_image_layout", "decoder.base");
    let (metadata_start, metadata_end) = match width {
        PointerWidth::Bit32 => (0x350, 0x39C),
        PointerWidth::Bit64 => (0x5B0, 0x5FC),
    };
    let file_path = || LeafCheck::Text {
        anchor: "file_path".to_string(),
        encoding: StringEncoding::Utf16,
    };

    vec![
        Step::Template {
            name: "il_image".to_string(),
            prefix: None,
            levels: vec![Candidates::list([w, 2 * w]), Candidates::list([2 * w])],
            leaf: LeafCheck::deref(LeafCheck::at(buffer as i64, LeafCheck::deref(file_path()))),
            read: ReadAs::Pointer,
        },
        Step::Template {
            name: "file_path".to_string(),
            prefix: Some("il_image".to_string()),
            levels: vec![Candidates::field("sstring", "buffer"), Candidates::list([0])],
            leaf: file_path(),
            read: ReadAs::Text {
                encoding: StringEncoding::Utf16,
            },
        },
        Step::Anchor {
            name: "md_import".to_string(),
            object: "il_image".to_string(),
            range: Candidates::range(0x40, 0xD0, SCAN_STRIDE),
            anchor: "md_import".to_string(),
            read: ReadAs::Pointer,
        },
        Step::Template {
            name: "loaded_layout".to_string(),
            prefix: Some("il_image".to_string()),
            levels: vec![Candidates::Around {
                field: "md_import".to_string(),
                min_delta: -(4 + 5 * wi),
                max_delta: -(4 + wi),
                stride: SCAN_STRIDE,
                reverse: true,
            }],
            leaf: LeafCheck::deref(LeafCheck::All {
                checks: vec![
                    LeafCheck::deref(LeafCheck::Readable { len: w as usize }),
                    LeafCheck::at(
                        image_base as i64,
                        LeafCheck::All {
                            checks: vec![
                                LeafCheck::Aligned {
                                    align: IMAGE_BASE_ALIGNMENT,
                                },
                                LeafCheck::anchor_ptr("image_base"),
                            ],
                        },
                    ),
                ],
            }),
            read: ReadAs::Record {
                layout: "pe_image_layout".to_string(),
            },
        },
        Step::Sibling {
            name: "mapped_layout".to_string(),
            of: "loaded_layout".to_string(),
            delta: -wi,
            read: ReadAs::Record {
                layout: "pe_image_layout".to_string(),
            },
            verify: None,
            required: false,
        },
        Step::Sibling {
            name: "flat_layout".to_string(),
            of: "loaded_layout".to_string(),
            delta: -2 * wi,
            read: ReadAs::Record {
                layout: "pe_image_layout".to_string(),
            },
            verify: None,
            required: false,
        },
        Step::Template {
            name: "cor_header".to_string(),
            prefix: Some("loaded_layout".to_string()),
            levels: vec![Candidates::field("pe_image_layout", "decoder.cor_header")],
            leaf: LeafCheck::deref(LeafCheck::equals_u32(runtime::COR20_HEADER_SIZE)),
            read: ReadAs::Record {
                layout: "cor20_header".to_string(),
            },
        },
        Step::Template {
            name: "metadata".to_string(),
            prefix: None,
            levels: vec![
                Candidates::list([w, 2 * w]),
                Candidates::range(0x10, 0x3C, SCAN_STRIDE),
                Candidates::range(metadata_start, metadata_end, SCAN_STRIDE),
            ],
            leaf: LeafCheck::deref(LeafCheck::equals_u32(runtime::METADATA_SIGNATURE)),
            read: ReadAs::Pointer,
        },
        Step::Sibling {
            name: "metadata_size".to_string(),
            of: "metadata".to_string(),
            delta: wi,
            read: ReadAs::U32,
            verify: Some(LeafCheck::EqualsAnchor {
                anchor: "metadata_size".to_string(),
                scalar: ScalarKind::U32,
            }),
            required: true,
        },
    ]
}

/// Smallest replicate count that still fills a pool of `MIN_POOL_SIZE`
/// for every variant of `plan` when pooling `storages`
pub fn min_replicates(plan: &DiscoveryPlan, storages: usize) -> u8 {
    let axes = plan
        .variants
        .iter()
        .map(|v| v.formats.len() * storages)
        .min()
        .unwrap_or(1)
        .max(1);
    MIN_POOL_SIZE.div_ceil(axes) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtin_plan_is_valid() {
        for width in [PointerWidth::Bit32, PointerWidth::Bit64] {
            let plan = builtin_plan(width);
            plan.validate().unwrap();
            assert_eq!(plan.variants.len(), 2);
            assert!(plan.variant("compressed").is_some());
            assert!(plan.variant("unknown").is_none());
        }
    }

    #[test]
    fn test_builtin_plan_width_specific_offsets() {
        let plan = builtin_plan(PointerWidth::Bit32);
        let steps = &plan.variants[0].steps;
        let Step::Template { levels, leaf, .. } = &steps[0] else {
            panic!("first step should be a template scan");
        };
        assert_eq!(levels[0], Candidates::list([4, 8]));
        // SString buffer pointer follows three u32 fields
        assert_eq!(
            leaf,
            &LeafCheck::deref(LeafCheck::at(
                0xC,
                LeafCheck::deref(LeafCheck::Text {
                    anchor: "file_path".into(),
                    encoding: StringEncoding::Utf16
                })
            ))
        );

        let metadata = steps.iter().find(|s| s.name() == "metadata").unwrap();
        let Step::Template { levels, .. } = metadata else {
            panic!("metadata should be a template scan");
        };
        assert_eq!(levels[2], Candidates::range(0x350, 0x39C, 4));
    }

    #[test]
    fn test_validate_rejects_forward_dependency() {
        let mut plan = builtin_plan(PointerWidth::Bit64);
        plan.variants[0].steps.swap(0, 1);
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(ref m) if m.contains("il_image")));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_missing_layouts() {
        let mut plan = builtin_plan(PointerWidth::Bit64);
        plan.variants[1].name = "compressed".to_string();
        assert!(plan.validate().is_err());

        let mut plan = builtin_plan(PointerWidth::Bit64);
        plan.layouts.remove("pe_image_layout");
        assert!(plan.validate().is_err());

        let mut plan = builtin_plan(PointerWidth::Bit64);
        let first = plan.variants[0].steps[0].clone();
        plan.variants[0].steps.push(first);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_checks_anchor_ranges() {
        let set_md_import_range = |plan: &mut DiscoveryPlan, candidates: Candidates| {
            for step in &mut plan.variants[0].steps {
                if let Step::Anchor { range, .. } = step {
                    *range = candidates.clone();
                }
            }
        };

        let mut plan = builtin_plan(PointerWidth::Bit64);
        set_md_import_range(&mut plan, Candidates::field("pe_image_layout", "decoder.missing"));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(ref m) if m.contains("decoder.missing")));

        let mut plan = builtin_plan(PointerWidth::Bit64);
        set_md_import_range(&mut plan, Candidates::field("pe_image_layout", "decoder.base"));
        plan.validate().unwrap();

        let mut plan = builtin_plan(PointerWidth::Bit64);
        set_md_import_range(&mut plan, Candidates::range(0, u32::MAX, SCAN_STRIDE));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_plan() {
        let mut plan = builtin_plan(PointerWidth::Bit64);
        plan.variants.clear();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = builtin_plan(PointerWidth::Bit64);

        save_plan(&plan, &path).unwrap();
        let loaded = load_plan(&path).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_load_missing_plan() {
        let dir = tempdir().unwrap();
        let err = load_plan(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_min_replicates() {
        let plan = builtin_plan(PointerWidth::Bit64);
        assert_eq!(min_replicates(&plan, 2), 3);
        assert_eq!(min_replicates(&plan, 1), 5);
    }
}
