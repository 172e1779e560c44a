//! Bounded candidate offset sets for one chain level

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::{PointerWidth, RecordLayout};
use crate::offset::searcher::constants::MAX_CANDIDATES;

/// Offsets to try at one level of a chain.
///
/// Sets are derived from coarse knowledge of the surrounding structure and
/// are always finite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Candidates {
    /// Explicit offsets, tried in order
    List { offsets: Vec<u32> },
    /// `start..end` (end exclusive) by `stride`
    Range {
        start: u32,
        end: u32,
        stride: u32,
        #[serde(default)]
        reverse: bool,
    },
    /// Window around the final offset of an already discovered field,
    /// `[last + min_delta, last + max_delta]` inclusive
    Around {
        field: String,
        min_delta: i64,
        max_delta: i64,
        stride: u32,
        #[serde(default)]
        reverse: bool,
    },
    /// Exact offset of a field in a named record layout
    Field { layout: String, field: String },
}

/// What candidate expansion may refer to
pub struct ExpandContext<'a> {
    pub width: PointerWidth,
    pub layouts: &'a BTreeMap<String, RecordLayout>,
    /// Final offset of every field discovered so far
    pub known: &'a BTreeMap<String, u32>,
}

impl Candidates {
    pub fn list(offsets: impl Into<Vec<u32>>) -> Self {
        Candidates::List {
            offsets: offsets.into(),
        }
    }

    pub fn range(start: u32, end: u32, stride: u32) -> Self {
        Candidates::Range {
            start,
            end,
            stride,
            reverse: false,
        }
    }

    pub fn field(layout: &str, field: &str) -> Self {
        Candidates::Field {
            layout: layout.to_string(),
            field: field.to_string(),
        }
    }

    /// Name of the discovered field this set depends on, if any
    pub fn depends_on(&self) -> Option<&str> {
        match self {
            Candidates::Around { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Reject sets that cannot be expanded: a zero stride, or more than
    /// [`MAX_CANDIDATES`] offsets
    pub fn check(&self) -> Result<()> {
        let (span, stride) = match self {
            Candidates::List { .. } | Candidates::Field { .. } => return Ok(()),
            Candidates::Range {
                start, end, stride, ..
            } => (u64::from(end.saturating_sub(*start)), *stride),
            Candidates::Around {
                min_delta,
                max_delta,
                stride,
                ..
            } => {
                let span = max_delta.checked_sub(*min_delta).ok_or_else(|| {
                    Error::InvalidPlan(format!(
                        "candidate window {}..={} overflows",
                        min_delta, max_delta
                    ))
                })?;
                (u64::try_from(span).unwrap_or(0), *stride)
            }
        };
        let stride = checked_stride(stride)?;
        let count = span.div_ceil(stride as u64);
        if count > MAX_CANDIDATES as u64 {
            return Err(Error::InvalidPlan(format!(
                "candidate set expands to {} offsets, limit is {}",
                count, MAX_CANDIDATES
            )));
        }
        Ok(())
    }

    /// Materialize the offsets in scan order
    pub fn expand(&self, ctx: &ExpandContext<'_>) -> Result<Vec<u32>> {
        self.check()?;
        match self {
            Candidates::List { offsets } => Ok(offsets.clone()),
            Candidates::Range {
                start,
                end,
                stride,
                reverse,
            } => {
                let stride = checked_stride(*stride)?;
                let mut offsets: Vec<u32> = (*start..*end).step_by(stride).collect();
                if *reverse {
                    offsets.reverse();
                }
                Ok(offsets)
            }
            Candidates::Around {
                field,
                min_delta,
                max_delta,
                stride,
                reverse,
            } => {
                let stride = checked_stride(*stride)?;
                let anchor = ctx.known.get(field).copied().ok_or_else(|| {
                    Error::InvalidPlan(format!("candidates depend on unknown field '{}'", field))
                })?;
                let shifted = |delta: i64| {
                    i64::from(anchor).checked_add(delta).ok_or_else(|| {
                        Error::InvalidPlan(format!("offset 0x{:X} shifted by {} overflows", anchor, delta))
                    })
                };
                let low = shifted(*min_delta)?.max(0);
                let high = shifted(*max_delta)?.min(i64::from(u32::MAX));
                let mut offsets: Vec<u32> = (low..=high)
                    .step_by(stride)
                    .filter_map(|o| u32::try_from(o).ok())
                    .collect();
                if *reverse {
                    offsets.reverse();
                }
                Ok(offsets)
            }
            Candidates::Field { layout, field } => {
                let layout = ctx.layouts.get(layout).ok_or_else(|| {
                    Error::InvalidPlan(format!("unknown layout '{}'", layout))
                })?;
                Ok(vec![layout.compile(ctx.width).offset_of(field)?])
            }
        }
    }
}

fn checked_stride(stride: u32) -> Result<usize> {
    if stride == 0 {
        return Err(Error::InvalidPlan("candidate stride must be non-zero".into()));
    }
    Ok(stride as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::runtime;

    fn expand(candidates: &Candidates, known: &[(&str, u32)]) -> Result<Vec<u32>> {
        let mut layouts = BTreeMap::new();
        layouts.insert("pe_image_layout".to_string(), runtime::pe_image_layout());
        let known = known
            .iter()
            .map(|(name, offset)| (name.to_string(), *offset))
            .collect();
        candidates.expand(&ExpandContext {
            width: PointerWidth::Bit64,
            layouts: &layouts,
            known: &known,
        })
    }

    #[test]
    fn test_range_is_end_exclusive() {
        let offsets = expand(&Candidates::range(0x20, 0x2C, 4), &[]).unwrap();
        assert_eq!(offsets, vec![0x20, 0x24, 0x28]);
    }

    #[test]
    fn test_reverse_range() {
        let candidates = Candidates::Range {
            start: 0x10,
            end: 0x20,
            stride: 8,
            reverse: true,
        };
        assert_eq!(expand(&candidates, &[]).unwrap(), vec![0x18, 0x10]);
    }

    #[test]
    fn test_zero_stride_is_rejected() {
        assert!(matches!(
            expand(&Candidates::range(0, 0x10, 0), &[]),
            Err(Error::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_around_known_field() {
        // Downward window below a previously found field, as used for image layouts
        let candidates = Candidates::Around {
            field: "md_import".to_string(),
            min_delta: -(4 + 5 * 8),
            max_delta: -(4 + 8),
            stride: 4,
            reverse: true,
        };
        let offsets = expand(&candidates, &[("md_import", 0xA0)]).unwrap();
        assert_eq!(offsets.first(), Some(&0x94));
        assert_eq!(offsets.last(), Some(&0x74));
        assert_eq!(offsets.len(), 9);
        assert!(offsets.contains(&0x90));
    }

    #[test]
    fn test_around_clamps_below_zero() {
        let candidates = Candidates::Around {
            field: "a".to_string(),
            min_delta: -0x10,
            max_delta: 0,
            stride: 4,
            reverse: false,
        };
        assert_eq!(expand(&candidates, &[("a", 4)]).unwrap(), vec![0, 4]);
    }

    #[test]
    fn test_extreme_deltas_are_rejected() {
        let candidates = Candidates::Around {
            field: "a".to_string(),
            min_delta: i64::MAX - 4,
            max_delta: i64::MAX,
            stride: 4,
            reverse: false,
        };
        assert!(matches!(
            expand(&candidates, &[("a", 0x10)]),
            Err(Error::InvalidPlan(_))
        ));

        let candidates = Candidates::Around {
            field: "a".to_string(),
            min_delta: i64::MIN,
            max_delta: 0,
            stride: 4,
            reverse: false,
        };
        assert!(matches!(candidates.check(), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn test_oversized_range_is_rejected() {
        let huge = Candidates::range(0, u32::MAX, 4);
        assert!(matches!(huge.check(), Err(Error::InvalidPlan(_))));
        assert!(expand(&huge, &[]).is_err());

        let limit = (MAX_CANDIDATES * 4) as u32;
        assert!(Candidates::range(0, limit, 4).check().is_ok());
        assert!(Candidates::range(0, limit + 4, 4).check().is_err());
    }

    #[test]
    fn test_around_unknown_field() {
        let candidates = Candidates::Around {
            field: "missing".to_string(),
            min_delta: 0,
            max_delta: 8,
            stride: 4,
            reverse: false,
        };
        assert!(expand(&candidates, &[]).is_err());
    }

    #[test]
    fn test_layout_field_offset() {
        let candidates = Candidates::field("pe_image_layout", "decoder.cor_header");
        assert_eq!(expand(&candidates, &[]).unwrap(), vec![0x20]);
        assert!(expand(&Candidates::field("nope", "x"), &[]).is_err());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{"type":"range","start":16,"end":60,"stride":4}"#;
        let parsed: Candidates = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, Candidates::range(0x10, 0x3C, 4));
    }
}
