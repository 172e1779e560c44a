pub mod layout;
mod reader;
mod snapshot;

pub use layout::{CompiledLayout, PointerWidth, RecordLayout, ScalarKind};
pub use reader::{Address, ReadMemory, Scalar, StringEncoding};
pub use snapshot::MemorySnapshot;
