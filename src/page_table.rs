//! Two-level page table.
//!
//! A virtual page number is split into a first-level index (bits [7:4]) that
//! selects a second-level table, and a second-level index (bits [3:0]) that
//! selects the entry. Second-level tables are allocated on first use and only
//! released all at once by [`PageTable::clear`].

use bitflags::bitflags;
use log::{debug, warn};

use crate::constants::*;
use crate::error::{Result, VmError};
use crate::memory::FrameAllocator;

bitflags! {
    /// Permission bits carried by a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u8 {
        const VALID = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl PteFlags {
    pub const RW: PteFlags = PteFlags::READ.union(PteFlags::WRITE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub frame: Option<usize>,
    pub flags: PteFlags,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry {
            frame: None,
            flags: PteFlags::empty(),
        }
    }

    pub fn new(frame: usize, flags: PteFlags) -> Self {
        PageTableEntry {
            frame: Some(frame),
            flags: flags | PteFlags::VALID,
        }
    }

    /// The frame backing this entry, if the entry is valid.
    #[inline]
    pub fn mapped_frame(&self) -> Option<usize> {
        self.frame.filter(|_| self.flags.contains(PteFlags::VALID))
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.mapped_frame().is_some()
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.flags.contains(PteFlags::READ)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITE)
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Split a virtual page number into (first-level, second-level) indices.
#[inline]
pub fn split_vpn(vpage: usize) -> (usize, usize) {
    let l1 = (vpage >> VPN_L1_SHIFT) & L1_MASK as usize;
    let l2 = vpage & L2_MASK as usize;
    (l1, l2)
}

#[inline]
pub fn join_vpn(l1: usize, l2: usize) -> usize {
    (l1 << VPN_L1_SHIFT) | l2
}

/// One second-level table of `L2_ENTRIES` entries.
pub struct SecondLevelTable {
    entries: Box<[PageTableEntry]>,
}

impl SecondLevelTable {
    /// Allocate a table with every entry unmapped.
    fn try_new() -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(L2_ENTRIES)
            .map_err(|_| VmError::AllocationFailure)?;
        entries.resize(L2_ENTRIES, PageTableEntry::empty());
        Ok(SecondLevelTable {
            entries: entries.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn get(&self, l2: usize) -> &PageTableEntry {
        &self.entries[l2]
    }

    #[inline]
    fn get_mut(&mut self, l2: usize) -> &mut PageTableEntry {
        &mut self.entries[l2]
    }
}

pub struct PageTable {
    tables: [Option<SecondLevelTable>; L1_ENTRIES],
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            tables: Default::default(),
        }
    }

    fn check_vpn(vpage: usize) -> Result<()> {
        if vpage >= NUM_PAGES {
            return Err(VmError::virtual_page(vpage));
        }
        Ok(())
    }

    /// Look up the entry at (l1, l2); `None` if its second-level table is absent.
    #[inline]
    pub fn walk(&self, l1: usize, l2: usize) -> Option<&PageTableEntry> {
        self.tables.get(l1)?.as_ref().map(|table| table.get(l2))
    }

    /// Copy of the entry for `vpage`, if its second-level table exists.
    pub fn entry(&self, vpage: usize) -> Option<PageTableEntry> {
        if vpage >= NUM_PAGES {
            return None;
        }
        let (l1, l2) = split_vpn(vpage);
        self.walk(l1, l2).copied()
    }

    fn entry_create(&mut self, vpage: usize) -> Result<&mut PageTableEntry> {
        let (l1, l2) = split_vpn(vpage);
        let slot = &mut self.tables[l1];
        if slot.is_none() {
            debug!("allocating second-level table {l1}");
            *slot = Some(SecondLevelTable::try_new()?);
        }
        match slot {
            Some(table) => Ok(table.get_mut(l2)),
            None => Err(VmError::AllocationFailure),
        }
    }

    /// Install `vpage -> frame` with `flags | VALID` and mark the frame used.
    ///
    /// An existing mapping is overwritten and its frame is *not* released.
    /// A frame already backing another live page is accepted as an alias.
    /// Both cases are logged. Returns the entry that was replaced.
    pub fn map(
        &mut self,
        vpage: usize,
        frame: usize,
        flags: PteFlags,
        frames: &mut FrameAllocator,
    ) -> Result<PageTableEntry> {
        Self::check_vpn(vpage)?;
        if frame >= NUM_FRAMES {
            return Err(VmError::physical_frame(frame));
        }
        if let Some(other) = self.frame_referenced_by_other(frame, vpage) {
            warn!("frame {frame} already backs virtual page {other:#x}; aliasing it at {vpage:#x}");
        }

        let entry = self.entry_create(vpage)?;
        let previous = *entry;
        *entry = PageTableEntry::new(frame, flags);
        frames.mark_used(frame)?;

        if let Some(old) = previous.mapped_frame().filter(|&old| old != frame) {
            warn!("remapping virtual page {vpage:#x}: frame {old} stays marked used");
        }
        debug!("mapped virtual page {vpage:#x} -> frame {frame} ({flags:?})");
        Ok(previous)
    }

    /// Clear the entry for `vpage`, freeing the frame it referenced.
    ///
    /// Unmapping a page whose second-level table was never allocated is a
    /// no-op. Returns the freed frame, if any.
    pub fn unmap(&mut self, vpage: usize, frames: &mut FrameAllocator) -> Result<Option<usize>> {
        Self::check_vpn(vpage)?;
        let (l1, l2) = split_vpn(vpage);
        let Some(table) = self.tables[l1].as_mut() else {
            return Ok(None);
        };

        let entry = table.get_mut(l2);
        let freed = entry.frame;
        if let Some(frame) = freed {
            frames.free(frame);
        }
        *entry = PageTableEntry::empty();
        debug!("unmapped virtual page {vpage:#x} (frame {freed:?})");
        Ok(freed)
    }

    /// Every valid mapping as (virtual page, entry), in ascending page order.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.tables.iter().enumerate().flat_map(|(l1, table)| {
            table.iter().flat_map(move |table| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_valid())
                    .map(move |(l2, entry)| (join_vpn(l1, l2), *entry))
            })
        })
    }

    /// Another live page backed by `frame`, ignoring `except`.
    pub fn frame_referenced_by_other(&self, frame: usize, except: usize) -> Option<usize> {
        self.mappings()
            .find(|&(vpage, entry)| vpage != except && entry.mapped_frame() == Some(frame))
            .map(|(vpage, _)| vpage)
    }

    pub fn allocated_tables(&self) -> usize {
        self.tables.iter().filter(|table| table.is_some()).count()
    }

    /// Release every second-level table.
    pub fn clear(&mut self) {
        for table in self.tables.iter_mut() {
            table.take();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
