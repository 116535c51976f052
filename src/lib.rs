pub mod constants;
pub mod error;
pub mod io;
pub mod memory;
pub mod page_table;
pub mod stats;
pub mod translation;
pub mod vm_manager;

// Re-export commonly used items for convenience
pub use constants::*;
pub use error::{Access, VmError};
pub use page_table::{PageTableEntry, PteFlags};
pub use stats::Statistics;
pub use translation::VirtualAddress;
pub use vm_manager::VMManager;
