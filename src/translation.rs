use log::{error, trace, warn};

use crate::constants::*;
use crate::error::{Access, Result, VmError};
use crate::page_table::PageTable;

/// Represents the decomposed components of a Virtual Address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress {
    pub va: u32,
    pub l1: usize,
    pub l2: usize,
    pub offset: usize,
}

impl VirtualAddress {
    /// Decompose a raw VA into its components
    pub fn from_raw(va: u32) -> Self {
        let l1 = ((va >> L1_SHIFT) & L1_MASK) as usize;
        let l2 = ((va >> L2_SHIFT) & L2_MASK) as usize;
        let offset = (va & OFFSET_MASK) as usize;

        VirtualAddress { va, l1, l2, offset }
    }

    /// Virtual page number containing this address
    #[inline]
    pub fn page(&self) -> usize {
        (self.va as usize) / PAGE_SIZE
    }
}

impl std::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VA({:#08x}) = (l1={}, l2={}, offset={:#05x})",
            self.va, self.l1, self.l2, self.offset
        )
    }
}

/// Translate a virtual address to a physical address.
///
/// A missing second-level table and an invalid entry are both reported as
/// [`VmError::TranslationMiss`]; a mapping that forbids `access` is
/// [`VmError::PermissionDenied`]. Counting failures is left to the caller.
pub fn translate(va: u32, access: Access, pt: &PageTable) -> Result<usize> {
    if va as usize >= RAM_SIZE {
        warn!("virtual address {va:#x} exceeds the address space");
        return Err(VmError::virtual_address(va));
    }
    let addr = VirtualAddress::from_raw(va);

    let Some(entry) = pt.walk(addr.l1, addr.l2) else {
        trace!("{addr}: no second-level table");
        return Err(VmError::TranslationMiss { address: va });
    };
    let Some(frame) = entry.mapped_frame() else {
        trace!("{addr}: entry not valid");
        return Err(VmError::TranslationMiss { address: va });
    };

    let permitted = match access {
        Access::Write => entry.writable(),
        Access::Read => entry.readable(),
    };
    if !permitted {
        warn!("{access} permission denied at {va:#x}");
        return Err(VmError::PermissionDenied {
            address: va,
            access,
        });
    }

    let physical = frame * PAGE_SIZE + addr.offset;
    if physical >= RAM_SIZE {
        error!("physical address {physical:#x} for {va:#x} is out of range");
        return Err(VmError::InternalInconsistency {
            address: va,
            physical,
        });
    }
    trace!("{addr} -> PA({physical:#x})");
    Ok(physical)
}
