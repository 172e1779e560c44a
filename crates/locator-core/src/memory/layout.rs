//! Explicit record layouts for target data structures
//!
//! A [`RecordLayout`] is an ordered list of field widths. Compiling it for a
//! [`PointerWidth`] yields field offsets and the total size under natural
//! alignment, the same rules the target's compiler applied. Nothing here
//! aliases raw memory as a typed struct; offsets are derived, then read
//! through [`ReadMemory`](super::ReadMemory).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Address width of the inspected process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PointerWidth {
    Bit32,
    Bit64,
}

impl PointerWidth {
    /// Size of one pointer in bytes
    pub const fn bytes(self) -> usize {
        match self {
            PointerWidth::Bit32 => 4,
            PointerWidth::Bit64 => 8,
        }
    }

    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            4 => Some(PointerWidth::Bit32),
            8 => Some(PointerWidth::Bit64),
            _ => None,
        }
    }

    /// Highest representable address
    pub const fn mask(self) -> u64 {
        match self {
            PointerWidth::Bit32 => u32::MAX as u64,
            PointerWidth::Bit64 => u64::MAX,
        }
    }

    /// `base + offset`, wrapping at this width like the target's own pointer arithmetic
    pub fn offset(self, base: u64, offset: u32) -> u64 {
        base.wrapping_add(offset as u64) & self.mask()
    }
}

impl fmt::Display for PointerWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

impl TryFrom<u8> for PointerWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        PointerWidth::from_bytes(value as usize)
            .ok_or_else(|| format!("pointer width must be 4 or 8, got {}", value))
    }
}

impl From<PointerWidth> for u8 {
    fn from(width: PointerWidth) -> Self {
        width.bytes() as u8
    }
}

/// Width of a single scalar value in target memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    U8,
    U16,
    U32,
    U64,
    /// Native pointer, 4 or 8 bytes
    Ptr,
}

impl ScalarKind {
    pub const fn size(self, width: PointerWidth) -> usize {
        match self {
            ScalarKind::U8 => 1,
            ScalarKind::U16 => 2,
            ScalarKind::U32 => 4,
            ScalarKind::U64 => 8,
            ScalarKind::Ptr => width.bytes(),
        }
    }
}

/// Kind of one field inside a [`RecordLayout`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar { scalar: ScalarKind },
    Array { element: Box<FieldKind>, count: u32 },
    Record { layout: RecordLayout },
}

impl FieldKind {
    pub fn scalar(scalar: ScalarKind) -> Self {
        FieldKind::Scalar { scalar }
    }

    pub fn array(element: FieldKind, count: u32) -> Self {
        FieldKind::Array {
            element: Box::new(element),
            count,
        }
    }

    pub fn record(layout: RecordLayout) -> Self {
        FieldKind::Record { layout }
    }

    /// (size, alignment) under natural alignment
    fn size_align(&self, width: PointerWidth) -> (u32, u32) {
        match self {
            FieldKind::Scalar { scalar } => {
                let size = scalar.size(width) as u32;
                (size, size)
            }
            FieldKind::Array { element, count } => {
                let (size, align) = element.size_align(width);
                (size * count, align)
            }
            FieldKind::Record { layout } => {
                let compiled = layout.compile(width);
                (compiled.size, compiled.align)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutField {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// Ordered field list describing one native structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub name: String,
    pub fields: Vec<LayoutField>,
}

impl RecordLayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(LayoutField {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn u8(self, name: &str) -> Self {
        self.field(name, FieldKind::scalar(ScalarKind::U8))
    }

    pub fn u16(self, name: &str) -> Self {
        self.field(name, FieldKind::scalar(ScalarKind::U16))
    }

    pub fn u32(self, name: &str) -> Self {
        self.field(name, FieldKind::scalar(ScalarKind::U32))
    }

    pub fn u64(self, name: &str) -> Self {
        self.field(name, FieldKind::scalar(ScalarKind::U64))
    }

    pub fn ptr(self, name: &str) -> Self {
        self.field(name, FieldKind::scalar(ScalarKind::Ptr))
    }

    pub fn array(self, name: &str, element: ScalarKind, count: u32) -> Self {
        self.field(name, FieldKind::array(FieldKind::scalar(element), count))
    }

    pub fn record(self, name: &str, layout: RecordLayout) -> Self {
        self.field(name, FieldKind::record(layout))
    }

    /// Compute offsets and size for the given pointer width
    pub fn compile(&self, width: PointerWidth) -> CompiledLayout {
        let mut compiled = CompiledLayout {
            name: self.name.clone(),
            width,
            size: 0,
            align: 1,
            fields: Vec::new(),
        };

        let mut cursor = 0u32;
        for field in &self.fields {
            let (size, align) = field.kind.size_align(width);
            cursor = align_up(cursor, align);
            compiled.align = compiled.align.max(align);

            match &field.kind {
                FieldKind::Scalar { scalar } => compiled.fields.push(CompiledField {
                    path: field.name.clone(),
                    offset: cursor,
                    size,
                    scalar: Some(*scalar),
                }),
                FieldKind::Array { .. } => compiled.fields.push(CompiledField {
                    path: field.name.clone(),
                    offset: cursor,
                    size,
                    scalar: None,
                }),
                FieldKind::Record { layout } => {
                    // Nested record fields are addressable as "outer.inner"
                    compiled.fields.push(CompiledField {
                        path: field.name.clone(),
                        offset: cursor,
                        size,
                        scalar: None,
                    });
                    for inner in layout.compile(width).fields {
                        compiled.fields.push(CompiledField {
                            path: format!("{}.{}", field.name, inner.path),
                            offset: cursor + inner.offset,
                            size: inner.size,
                            scalar: inner.scalar,
                        });
                    }
                }
            }
            cursor += size;
        }

        compiled.size = align_up(cursor, compiled.align);
        compiled
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledField {
    /// Dotted path, e.g. `decoder.cor_header`
    pub path: String,
    pub offset: u32,
    pub size: u32,
    /// Scalar kind for directly readable fields, `None` for arrays and records
    pub scalar: Option<ScalarKind>,
}

/// A [`RecordLayout`] resolved for one pointer width
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledLayout {
    pub name: String,
    pub width: PointerWidth,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<CompiledField>,
}

impl CompiledLayout {
    pub fn field(&self, path: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|f| f.path == path)
    }

    pub fn offset_of(&self, path: &str) -> Result<u32> {
        self.field(path).map(|f| f.offset).ok_or_else(|| {
            Error::InvalidPlan(format!("layout '{}' has no field '{}'", self.name, path))
        })
    }

    /// Fields that can be read as a single scalar
    pub fn scalar_fields(&self) -> impl Iterator<Item = (&CompiledField, ScalarKind)> {
        self.fields
            .iter()
            .filter_map(|f| f.scalar.map(|scalar| (f, scalar)))
    }
}

/// Layouts of the managed runtime structures the built-in plan walks
pub mod runtime {
    use super::RecordLayout;

    pub fn sstring() -> RecordLayout {
        RecordLayout::new("sstring")
            .u32("size")
            .u32("allocation")
            .u32("flags")
            .ptr("buffer")
    }

    pub fn pe_decoder() -> RecordLayout {
        RecordLayout::new("pe_decoder")
            .ptr("base")
            .u32("size")
            .u32("flags")
            .ptr("nt_headers")
            .ptr("cor_header")
            .ptr("native_header")
    }

    pub fn pe_image_layout() -> RecordLayout {
        RecordLayout::new("pe_image_layout")
            .ptr("vfptr")
            .record("decoder", pe_decoder())
    }

    pub fn cor20_header() -> RecordLayout {
        let directory = RecordLayout::new("image_data_directory")
            .u32("virtual_address")
            .u32("size");
        RecordLayout::new("cor20_header")
            .u32("cb")
            .u16("major_runtime_version")
            .u16("minor_runtime_version")
            .record("metadata", directory.clone())
            .u32("flags")
            .u32("entry_point")
            .record("resources", directory.clone())
            .record("strong_name_signature", directory.clone())
            .record("code_manager_table", directory.clone())
            .record("vtable_fixups", directory.clone())
            .record("export_address_table_jumps", directory.clone())
            .record("managed_native_header", directory)
    }

    /// Expected value of `cor20_header.cb`
    pub const COR20_HEADER_SIZE: u32 = 0x48;

    /// "BSJB", the metadata root signature
    pub const METADATA_SIGNATURE: u32 = 0x424A_5342;
}

#[cfg(test)]
mod tests {
    use super::runtime::*;
    use super::*;

    fn sizes(layout: RecordLayout) -> (u32, u32) {
        (
            layout.compile(PointerWidth::Bit32).size,
            layout.compile(PointerWidth::Bit64).size,
        )
    }

    #[test]
    fn test_runtime_layout_sizes() {
        assert_eq!(sizes(sstring()), (0x10, 0x18));
        assert_eq!(sizes(pe_decoder()), (0x18, 0x28));
        assert_eq!(sizes(cor20_header()), (0x48, 0x48));
    }

    #[test]
    fn test_nested_field_offsets() {
        let x86 = pe_image_layout().compile(PointerWidth::Bit32);
        let x64 = pe_image_layout().compile(PointerWidth::Bit64);

        assert_eq!(x86.offset_of("decoder.base").unwrap(), 0x4);
        assert_eq!(x86.offset_of("decoder.cor_header").unwrap(), 0x14);
        assert_eq!(x64.offset_of("decoder.base").unwrap(), 0x8);
        assert_eq!(x64.offset_of("decoder.cor_header").unwrap(), 0x20);
        assert!(x64.offset_of("decoder.missing").is_err());
    }

    #[test]
    fn test_sstring_buffer_is_padded_on_64bit() {
        assert_eq!(sstring().compile(PointerWidth::Bit32).offset_of("buffer").unwrap(), 0xC);
        assert_eq!(sstring().compile(PointerWidth::Bit64).offset_of("buffer").unwrap(), 0x10);
    }

    #[test]
    fn test_scalar_fields_skip_arrays_and_records() {
        let schema = RecordLayout::new("schema")
            .u64("mask")
            .u8("major")
            .u8("minor")
            .record("image", pe_image_layout())
            .array("record_counts", ScalarKind::U32, 45)
            .u32("extra");
        let compiled = schema.compile(PointerWidth::Bit64);
        let names: Vec<_> = compiled.scalar_fields().map(|(f, _)| f.path.as_str()).collect();
        assert!(names.contains(&"major"));
        assert!(names.contains(&"image.decoder.cor_header"));
        assert!(names.contains(&"extra"));
        assert!(!names.contains(&"record_counts"));
        assert!(!names.contains(&"image"));
        assert_eq!(compiled.offset_of("image").unwrap(), 0x10);
        assert_eq!(compiled.offset_of("extra").unwrap(), 0x10 + 0x30 + 45 * 4);
    }

    #[test]
    fn test_pointer_width_wraps() {
        assert_eq!(PointerWidth::Bit32.offset(0xFFFF_FFF0, 0x20), 0x10);
        assert_eq!(PointerWidth::Bit64.offset(0xFFFF_FFF0, 0x20), 0x1_0000_0010);
    }

    #[test]
    fn test_pointer_width_serde() {
        let json = serde_json::to_string(&PointerWidth::Bit64).unwrap();
        assert_eq!(json, "8");
        let parsed: PointerWidth = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, PointerWidth::Bit32);
        assert!(serde_json::from_str::<PointerWidth>("2").is_err());
    }

    #[test]
    fn test_layout_json_roundtrip_keeps_offsets() {
        let json = serde_json::to_string(&pe_image_layout()).unwrap();
        let parsed: RecordLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.compile(PointerWidth::Bit64),
            pe_image_layout().compile(PointerWidth::Bit64)
        );
    }
}
