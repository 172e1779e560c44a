//! Query results

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::memory::Address;

/// Value of one field read from a live instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// The chain did not resolve on this instance, or led to a null pointer
    Absent,
    Address(Address),
    Int(u64),
    Text(String),
    /// Scalar fields of a record layout by dotted path
    Record(BTreeMap<String, u64>),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Address(v) | FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, u64>> {
        match self {
            FieldValue::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Every field of one profile replayed against one live base address.
///
/// Fields are independent: an absent field never hides the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub variant: String,
    pub discriminator: Address,
    pub base: Address,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ResultRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn is_present(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_absent())
    }

    pub fn absent_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, v)| v.is_absent())
            .map(|(name, _)| name.as_str())
    }
}
