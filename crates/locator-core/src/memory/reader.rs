//! Bounded, non-failing reads from a raw address space

use encoding_rs::{UTF_16LE, UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::layout::{PointerWidth, ScalarKind};

/// Opaque address in the inspected process, zero-extended to 64 bits
pub type Address = u64;

/// Chunk size used when scanning for a string terminator
const STRING_CHUNK: usize = 256;

/// Encoding of a null-terminated string in target memory
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StringEncoding {
    /// Single-byte code page (Windows-1252)
    Ansi,
    Utf8,
    /// UTF-16LE, terminated by a zero code unit
    Utf16,
}

impl StringEncoding {
    /// Size of one code unit in bytes
    pub const fn unit_size(self) -> usize {
        match self {
            StringEncoding::Ansi | StringEncoding::Utf8 => 1,
            StringEncoding::Utf16 => 2,
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        let encoding = match self {
            StringEncoding::Ansi => WINDOWS_1252,
            StringEncoding::Utf8 => UTF_8,
            StringEncoding::Utf16 => UTF_16LE,
        };
        let (decoded, _) = encoding.decode_without_bom_handling(bytes);
        decoded.into_owned()
    }

    /// Position of the terminator within `bytes`, which starts on a unit boundary
    fn find_terminator(self, bytes: &[u8]) -> Option<usize> {
        match self {
            StringEncoding::Ansi | StringEncoding::Utf8 => memchr::memchr(0, bytes),
            StringEncoding::Utf16 => bytes
                .chunks_exact(2)
                .position(|unit| unit == [0, 0])
                .map(|i| i * 2),
        }
    }
}

/// Fixed-width little-endian integer readable from target memory
pub trait Scalar: Copy {
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    let raw: [u8; std::mem::size_of::<$ty>()] =
                        bytes.get(..Self::SIZE)?.try_into().ok()?;
                    Some(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, i32, i64);

/// Raw access to an address space.
///
/// Implementors supply a readability probe and a raw read. Every typed read
/// is a provided method built on those two: address zero fails without a
/// probe, any other address is probed first, and every failure is `None`.
pub trait ReadMemory {
    /// Address width of the inspected process
    fn pointer_width(&self) -> PointerWidth;

    /// Whether `len` bytes starting at `address` can be read
    fn is_readable(&self, address: Address, len: usize) -> bool;

    /// Read `len` bytes without probing first
    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>>;

    /// Probed read of `len` bytes
    fn try_read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        if address == 0 || !self.is_readable(address, len) {
            return None;
        }
        self.read_bytes(address, len)
            .filter(|bytes| bytes.len() == len)
    }

    fn try_read<T: Scalar>(&self, address: Address) -> Option<T>
    where
        Self: Sized,
    {
        self.try_read_bytes(address, T::SIZE)
            .and_then(|bytes| T::from_le_slice(&bytes))
    }

    /// Read a native-width pointer, zero-extended to 64 bits
    fn try_read_ptr(&self, address: Address) -> Option<Address> {
        self.try_read_scalar(address, ScalarKind::Ptr)
    }

    /// Read a scalar of the given kind, zero-extended to 64 bits
    fn try_read_scalar(&self, address: Address, kind: ScalarKind) -> Option<u64> {
        let size = kind.size(self.pointer_width());
        let bytes = self.try_read_bytes(address, size)?;
        Some(match size {
            1 => bytes[0] as u64,
            2 => u16::from_le_slice(&bytes)? as u64,
            4 => u32::from_le_slice(&bytes)? as u64,
            _ => u64::from_le_slice(&bytes)?,
        })
    }

    /// Read a null-terminated string of at most `max_len` bytes.
    ///
    /// Returns `None` if the first unit is unreadable or no terminator is
    /// found before `max_len` bytes or before memory stops being readable.
    fn try_read_string(
        &self,
        address: Address,
        encoding: StringEncoding,
        max_len: usize,
    ) -> Option<String> {
        if address == 0 {
            return None;
        }

        let unit = encoding.unit_size();
        let max_len = max_len - max_len % unit;
        let mut buffer: Vec<u8> = Vec::new();

        while buffer.len() < max_len {
            let cursor = address.checked_add(buffer.len() as u64)?;
            let want = (max_len - buffer.len()).min(STRING_CHUNK);
            // A chunk may straddle the end of a readable region; fall back to
            // one code unit at a time before giving up
            let chunk = match self.try_read_bytes(cursor, want) {
                Some(chunk) => chunk,
                None => self.try_read_bytes(cursor, unit)?,
            };

            if let Some(end) = encoding.find_terminator(&chunk) {
                buffer.extend_from_slice(&chunk[..end]);
                return Some(encoding.decode(&buffer));
            }
            buffer.extend_from_slice(&chunk);
        }

        None
    }
}

impl<T: ReadMemory + ?Sized> ReadMemory for &T {
    fn pointer_width(&self) -> PointerWidth {
        (**self).pointer_width()
    }

    fn is_readable(&self, address: Address, len: usize) -> bool {
        (**self).is_readable(address, len)
    }

    fn read_bytes(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        (**self).read_bytes(address, len)
    }
}
