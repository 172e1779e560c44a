//! In-memory address space made of captured regions
//!
//! Used as the backing store for capture files and as the mock memory in
//! tests. Regions are non-overlapping; reads never cross a region boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::layout::PointerWidth;
use super::reader::{Address, ReadMemory, StringEncoding};
use crate::error::{Error, Result};

const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotRepr", into = "SnapshotRepr")]
pub struct MemorySnapshot {
    width: PointerWidth,
    regions: BTreeMap<Address, Vec<u8>>,
    next_alloc: Address,
}

impl MemorySnapshot {
    pub fn new(width: PointerWidth) -> Self {
        let next_alloc = match width {
            PointerWidth::Bit32 => 0x0100_0000,
            PointerWidth::Bit64 => 0x0000_0200_0000_0000,
        };
        Self {
            width,
            regions: BTreeMap::new(),
            next_alloc,
        }
    }

    /// Map a zero-filled region
    pub fn map(&mut self, base: Address, len: usize) {
        self.regions.insert(base, vec![0; len]);
        let end = base.saturating_add(len as u64);
        if end >= self.next_alloc {
            self.next_alloc = align_up(end, PAGE_SIZE) + PAGE_SIZE;
        }
    }

    /// Map a fresh zero-filled region of `len` bytes followed by an unmapped guard page
    pub fn alloc(&mut self, len: usize) -> Address {
        self.alloc_aligned(len, 0x10)
    }

    pub fn alloc_aligned(&mut self, len: usize, align: u64) -> Address {
        let base = align_up(self.next_alloc, align.max(0x10));
        self.map(base, len);
        base
    }

    pub fn write(&mut self, address: Address, bytes: &[u8]) -> Result<()> {
        let (start, data) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(Error::Unmapped {
                address,
                len: bytes.len(),
            })?;
        let from = (address - *start) as usize;
        let to = from + bytes.len();
        if to > data.len() {
            return Err(Error::Unmapped {
                address,
                len: bytes.len(),
            });
        }
        data[from..to].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u16(&mut self, address: Address, value: u16) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: Address, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: Address, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Write a native-width pointer
    pub fn write_ptr(&mut self, address: Address, value: Address) -> Result<()> {
        match self.width {
            PointerWidth::Bit32 => self.write_u32(address, value as u32),
            PointerWidth::Bit64 => self.write_u64(address, value),
        }
    }

    /// Allocate a null-terminated string and return its address
    pub fn alloc_string(&mut self, text: &str, encoding: StringEncoding) -> Result<Address> {
        let mut bytes: Vec<u8> = match encoding {
            StringEncoding::Utf16 => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            StringEncoding::Utf8 => text.as_bytes().to_vec(),
            StringEncoding::Ansi => {
                let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode(text);
                encoded.into_owned()
            }
        };
        bytes.extend(std::iter::repeat_n(0, encoding.unit_size()));
        // Keep at least one pointer of slack so pointer-sized probes succeed
        let len = bytes.len().max(self.width.bytes());
        let address = self.alloc(len);
        self.write(address, &bytes)?;
        Ok(address)
    }

    pub fn regions(&self) -> impl Iterator<Item = (Address, &[u8])> {
        self.regions.iter().map(|(base, data)| (*base, data.as_slice()))
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_of(&self, address: Address, len: usize) -> Option<&[u8]> {
        let (start, data) = self.regions.range(..=address).next_back()?;
        let from = usize::try_from(address - *start).ok()?;
        let to = from.checked_add(len)?;
        data.get(from..to)
    }
}

impl ReadMemory for MemorySnapshot {
    fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    fn is_readable(&self, address: Address, len: usize) -> bool {
        self.region_of(address, len).is_some()
    }

    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        self.region_of(address, len).map(<[u8]>::to_vec)
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[derive(Serialize, Deserialize)]
struct SnapshotRepr {
    pointer_width: PointerWidth,
    regions: Vec<RegionRepr>,
}

#[derive(Serialize, Deserialize)]
struct RegionRepr {
    base: Address,
    /// Hex-encoded region contents
    bytes: String,
}

impl From<MemorySnapshot> for SnapshotRepr {
    fn from(snapshot: MemorySnapshot) -> Self {
        Self {
            pointer_width: snapshot.width,
            regions: snapshot
                .regions
                .into_iter()
                .map(|(base, data)| RegionRepr {
                    base,
                    bytes: hex::encode(data),
                })
                .collect(),
        }
    }
}

impl TryFrom<SnapshotRepr> for MemorySnapshot {
    type Error = String;

    fn try_from(repr: SnapshotRepr) -> std::result::Result<Self, Self::Error> {
        let mut snapshot = MemorySnapshot::new(repr.pointer_width);
        for region in repr.regions {
            let data = hex::decode(&region.bytes)
                .map_err(|e| format!("region {:#x}: {}", region.base, e))?;
            snapshot.map(region.base, data.len());
            snapshot.regions.insert(region.base, data);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_outside_region_fails() {
        let mut mem = MemorySnapshot::new(PointerWidth::Bit64);
        mem.map(0x1000, 0x10);

        assert!(mem.write_u64(0x1008, 1).is_ok());
        assert!(mem.write_u64(0x100C, 1).is_err());
        assert!(mem.write_u32(0x0FFC, 1).is_err());
    }

    #[test]
    fn test_alloc_leaves_guard_gap() {
        let mut mem = MemorySnapshot::new(PointerWidth::Bit64);
        let a = mem.alloc(0x20);
        let b = mem.alloc(0x20);

        assert!(b > a + 0x20);
        assert!(mem.is_readable(a, 0x20));
        assert!(!mem.is_readable(a, 0x21));
        assert!(!mem.is_readable(a + 0x20, 1));
    }

    #[test]
    fn test_alloc_aligned() {
        let mut mem = MemorySnapshot::new(PointerWidth::Bit32);
        let image = mem.alloc_aligned(0x100, 0x10000);
        assert_eq!(image % 0x10000, 0);
        assert!(image <= u32::MAX as u64);
    }

    #[test]
    fn test_alloc_string_is_pointer_readable() {
        let mut mem = MemorySnapshot::new(PointerWidth::Bit64);
        let empty = mem.alloc_string("", StringEncoding::Utf16).unwrap();
        assert!(mem.try_read_ptr(empty).is_some());
        assert_eq!(
            mem.try_read_string(empty, StringEncoding::Utf16, 64).as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_snapshot_json_preserves_contents() {
        let mut mem = MemorySnapshot::new(PointerWidth::Bit32);
        let addr = mem.alloc(8);
        mem.write_ptr(addr, 0xDEAD_BEEF).unwrap();

        let json = serde_json::to_string(&mem).unwrap();
        assert!(json.contains("efbeadde"));

        let loaded: MemorySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.try_read_ptr(addr), Some(0xDEAD_BEEF));
        assert_eq!(loaded.pointer_width(), PointerWidth::Bit32);
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        let json = r#"{"pointer_width":8,"regions":[{"base":4096,"bytes":"zz"}]}"#;
        assert!(serde_json::from_str::<MemorySnapshot>(json).is_err());
    }
}
