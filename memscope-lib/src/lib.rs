pub mod memory;
pub mod pointer;
pub mod process;
pub mod value;

mod platform;

pub use memory::io::{MemoryAccessError, ProcessMemory};
pub use memory::native::{Context64, ContextFlags};
pub use memory::pattern::{Pattern, PatternByte, PatternError, ScanError, SignatureScanner};
pub use memory::protection::{PageState, PageType, ProcessAccess, Protection};
pub use memory::query::{PageInfo, QueryError};
pub use memory::region::MemoryRegion;
pub use pointer::{ParseAddressError, RawPointer};
pub use process::{Module, ProcessError, ProcessHandle};
pub use value::{Value, ValueKind, ValueParseError};
