//! Profiles: verified chains for one structural variant
//!
//! A [`Profile`] is built once per variant by [`ProfileBuilder`], memoized
//! in the [`ProfileRegistry`], and replayed against live instances.

mod builder;
pub mod plan;
mod registry;
mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::memory::{Address, CompiledLayout, PointerWidth, ReadMemory, ScalarKind, StringEncoding};
use crate::offset::Chain;
use crate::record::{FieldValue, ResultRecord};

pub use builder::ProfileBuilder;
pub use plan::{DiscoveryPlan, Step, VariantPlan, builtin_plan, load_plan, save_plan};
pub use registry::{ProfileRegistry, SlotState};
pub use store::{ProfileStore, STORE_FILE};

/// How to turn a resolved chain address into a field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "as", rename_all = "snake_case")]
pub enum ReadAs {
    /// The resolved address itself
    Slot,
    /// The pointer stored at the resolved address
    Pointer,
    U32,
    U64,
    /// A null-terminated string starting at the resolved address
    Text { encoding: StringEncoding },
    /// The pointer stored at the resolved address, read through a record layout
    Record { layout: String },
}

/// One discovered field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChain {
    /// Template chain; base is replaced by the live instance's base
    pub chain: Chain,
    pub read: ReadAs,
}

/// Immutable set of verified chains for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub variant: String,
    pub discriminator: Address,
    pub pointer_width: PointerWidth,
    pub fields: BTreeMap<String, FieldChain>,
    /// Layouts needed by `ReadAs::Record` fields
    #[serde(default)]
    pub layouts: BTreeMap<String, CompiledLayout>,
}

impl Profile {
    pub fn chain(&self, field: &str) -> Option<&Chain> {
        self.fields.get(field).map(|f| &f.chain)
    }

    /// Resolve every chain against `base` and read its value.
    ///
    /// A chain that does not resolve, or a read that fails, makes only that
    /// field [`FieldValue::Absent`].
    pub fn replay<R: ReadMemory + ?Sized>(
        &self,
        memory: &R,
        base: Address,
        max_string_len: usize,
    ) -> ResultRecord {
        let fields = self
            .fields
            .iter()
            .map(|(name, field)| {
                let value = field
                    .chain
                    .rebase(base)
                    .resolve(memory)
                    .address()
                    .and_then(|address| self.read(memory, address, &field.read, max_string_len))
                    .unwrap_or(FieldValue::Absent);
                (name.clone(), value)
            })
            .collect();

        ResultRecord {
            variant: self.variant.clone(),
            discriminator: self.discriminator,
            base,
            fields,
        }
    }

    fn read<R: ReadMemory + ?Sized>(
        &self,
        memory: &R,
        address: Address,
        read: &ReadAs,
        max_string_len: usize,
    ) -> Option<FieldValue> {
        match read {
            ReadAs::Slot => Some(FieldValue::Address(address)),
            ReadAs::Pointer => memory
                .try_read_ptr(address)
                .filter(|&ptr| ptr != 0)
                .map(FieldValue::Address),
            ReadAs::U32 => memory
                .try_read_scalar(address, ScalarKind::U32)
                .map(FieldValue::Int),
            ReadAs::U64 => memory
                .try_read_scalar(address, ScalarKind::U64)
                .map(FieldValue::Int),
            ReadAs::Text { encoding } => memory
                .try_read_string(address, *encoding, max_string_len)
                .map(FieldValue::Text),
            ReadAs::Record { layout } => {
                let layout = self.layouts.get(layout)?;
                let record = memory.try_read_ptr(address).filter(|&ptr| ptr != 0)?;
                let mut values = BTreeMap::new();
                for (field, scalar) in layout.scalar_fields() {
                    let value = memory.try_read_scalar(record + field.offset as u64, scalar)?;
                    values.insert(field.path.clone(), value);
                }
                Some(FieldValue::Record(values))
            }
        }
    }
}
