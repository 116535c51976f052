//! The address space: page table, frame allocator, physical store and
//! counters, plus the fault handler and the byte access routines.

use log::{debug, info};

use crate::constants::*;
use crate::error::{Access, Result, VmError};
use crate::memory::{FrameAllocator, PhysicalMemory};
use crate::page_table::{PageTable, PageTableEntry, PteFlags};
use crate::stats::{Counters, Statistics};
use crate::translation;

pub struct VMManager {
    pt: PageTable,
    frames: FrameAllocator,
    pm: PhysicalMemory,
    counters: Counters,
}

impl VMManager {
    pub fn new() -> Self {
        VMManager {
            pt: PageTable::new(),
            frames: FrameAllocator::new(),
            pm: PhysicalMemory::new(),
            counters: Counters::default(),
        }
    }

    /// Unmap everything, free every frame and zero the counters.
    ///
    /// Physical memory is not scrubbed; frames are zeroed when allocated.
    pub fn init(&mut self) {
        self.pt.clear();
        self.frames.reset();
        self.counters = Counters::default();
    }

    /// Release all second-level tables. The frame bitmap is left as is, so
    /// call [`VMManager::init`] before reusing the address space.
    pub fn teardown(&mut self) {
        self.pt.clear();
    }

    /// Map `vpage` onto `frame` with the given permissions.
    ///
    /// Overwriting a live mapping does not free its old frame, and a frame
    /// that already backs another page is aliased rather than rejected.
    pub fn map_page(&mut self, vpage: usize, frame: usize, flags: PteFlags) -> Result<()> {
        self.pt.map(vpage, frame, flags, &mut self.frames)?;
        Ok(())
    }

    pub fn unmap_page(&mut self, vpage: usize) -> Result<()> {
        self.pt.unmap(vpage, &mut self.frames)?;
        Ok(())
    }

    /// Translate `va` for the given access, counting any failure.
    pub fn translate(&mut self, va: u32, access: Access) -> Result<usize> {
        translation::translate(va, access, &self.pt).inspect_err(|_| {
            self.counters.translation_failures =
                self.counters.translation_failures.wrapping_add(1);
        })
    }

    /// Back `vpage` with a fresh zeroed frame, mapped read-write.
    pub fn handle_fault(&mut self, vpage: usize) -> Result<()> {
        if vpage >= NUM_PAGES {
            return Err(VmError::virtual_page(vpage));
        }
        self.counters.page_faults = self.counters.page_faults.wrapping_add(1);
        info!("page fault: virtual page {vpage:#x}");

        let frame = self.frames.allocate(&mut self.pm)?;
        info!("  -> allocated physical frame {frame}");
        self.map_page(vpage, frame, PteFlags::RW).inspect_err(|_| {
            self.frames.free(frame);
        })
    }

    /// Translate, and on a miss service one fault and translate once more.
    fn resolve(&mut self, va: u32, access: Access) -> Result<usize> {
        match self.translate(va, access) {
            Err(err) if err.is_retriable() => {
                let vpage = va as usize / PAGE_SIZE;
                self.handle_fault(vpage)?;
                self.translate(va, access)
            }
            other => other,
        }
    }

    pub fn write_vmem(&mut self, va: u32, value: u8) -> Result<()> {
        let pa = self.resolve(va, Access::Write)?;
        self.pm.write(pa, value);
        self.counters.writes = self.counters.writes.wrapping_add(1);
        debug!("write {value:#04x} -> VA {va:#x} (PA {pa:#x})");
        Ok(())
    }

    pub fn read_vmem(&mut self, va: u32) -> Result<u8> {
        let pa = self.resolve(va, Access::Read)?;
        let value = self.pm.read(pa);
        self.counters.reads = self.counters.reads.wrapping_add(1);
        debug!("read {value:#04x} <- VA {va:#x} (PA {pa:#x})");
        Ok(value)
    }

    pub fn statistics_snapshot(&self) -> Statistics {
        Statistics::new(self.counters, self.frames.used_count(), NUM_FRAMES)
    }

    /// Copy of the entry for `vpage`; `None` if its second-level table is absent.
    pub fn entry(&self, vpage: usize) -> Option<PageTableEntry> {
        self.pt.entry(vpage)
    }

    pub fn page_table(&self) -> &PageTable {
        &self.pt
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn physical(&self) -> &PhysicalMemory {
        &self.pm
    }

    pub fn physical_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.pm
    }
}

impl Default for VMManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RW: PteFlags = PteFlags::RW;

    #[test]
    fn test_basic_read_write() {
        let mut vm = VMManager::new();
        vm.map_page(0x00, 10, RW).unwrap();

        vm.write_vmem(0x000100, 0xaa).unwrap();
        assert_eq!(vm.read_vmem(0x000100), Ok(0xaa));
        assert_eq!(vm.physical().read(10 * PAGE_SIZE + 0x100), 0xaa);

        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, 0);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.translation_failures, 0);
    }

    #[test]
    fn test_demand_paging_faults_once_per_page() {
        let mut vm = VMManager::new();

        vm.write_vmem(0x005000, 0xbb).unwrap();
        assert_eq!(vm.statistics_snapshot().page_faults, 1);
        // the initial miss is counted as a failed translation
        assert_eq!(vm.statistics_snapshot().translation_failures, 1);

        assert_eq!(vm.read_vmem(0x005000), Ok(0xbb));
        vm.write_vmem(0x005fff, 0x01).unwrap();
        assert_eq!(vm.read_vmem(0x005abc), Ok(0));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);

        let entry = vm.entry(0x05).unwrap();
        assert_eq!(entry.flags, PteFlags::RW | PteFlags::VALID);
        assert_eq!(entry.mapped_frame(), Some(0));
    }

    #[test]
    fn test_read_of_unmapped_page_faults_in_zeroes() {
        let mut vm = VMManager::new();
        vm.physical_mut().frame_mut(0).fill(0xee);

        assert_eq!(vm.read_vmem(0x0c0123), Ok(0));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);
        assert_eq!(vm.statistics_snapshot().reads, 1);
    }

    #[test]
    fn test_read_only_page() {
        let mut vm = VMManager::new();
        vm.map_page(0x01, 20, PteFlags::READ).unwrap();
        vm.physical_mut().write(20 * PAGE_SIZE + 0x32, 0xcc);

        assert_eq!(vm.read_vmem(0x001032), Ok(0xcc));
        assert_eq!(
            vm.write_vmem(0x001032, 0xdd),
            Err(VmError::PermissionDenied {
                address: 0x001032,
                access: Access::Write
            })
        );
        assert_eq!(vm.physical().read(20 * PAGE_SIZE + 0x32), 0xcc);

        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, 0);
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.translation_failures, 1);
    }

    #[test]
    fn test_write_only_page() {
        let mut vm = VMManager::new();
        vm.map_page(0x02, 21, PteFlags::WRITE).unwrap();

        vm.write_vmem(0x002100, 0xee).unwrap();
        assert_eq!(
            vm.read_vmem(0x002100),
            Err(VmError::PermissionDenied {
                address: 0x002100,
                access: Access::Read
            })
        );
        assert_eq!(vm.statistics_snapshot().page_faults, 0);
    }

    #[test]
    fn test_bounds() {
        let mut vm = VMManager::new();

        assert!(matches!(
            vm.write_vmem(0x200000, 0x11),
            Err(VmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            vm.read_vmem(RAM_SIZE as u32),
            Err(VmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            vm.map_page(0x04, 999, RW),
            Err(VmError::OutOfBounds { what: "physical frame", .. })
        ));
        assert!(matches!(
            vm.map_page(0xfff, 30, RW),
            Err(VmError::OutOfBounds { what: "virtual page", .. })
        ));
        assert!(matches!(
            vm.unmap_page(NUM_PAGES),
            Err(VmError::OutOfBounds { .. })
        ));

        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, 0);
        assert_eq!(stats.translation_failures, 2);
        assert_eq!(stats.frames_used, 0);
    }

    #[test]
    fn test_multiple_pages() {
        let mut vm = VMManager::new();
        for i in 0..10u32 {
            vm.write_vmem(i * PAGE_SIZE as u32, i as u8).unwrap();
        }
        for i in 0..10u32 {
            assert_eq!(vm.read_vmem(i * PAGE_SIZE as u32), Ok(i as u8));
        }
        assert_eq!(vm.statistics_snapshot().page_faults, 10);
        assert_eq!(vm.statistics_snapshot().frames_used, 10);
    }

    #[test]
    fn test_page_boundaries() {
        let mut vm = VMManager::new();
        vm.map_page(0x05, 30, RW).unwrap();

        vm.write_vmem(0x005000, 0x11).unwrap();
        assert_eq!(vm.read_vmem(0x005000), Ok(0x11));
        vm.write_vmem(0x005fff, 0x22).unwrap();
        assert_eq!(vm.read_vmem(0x005fff), Ok(0x22));
        assert_eq!(vm.statistics_snapshot().page_faults, 0);

        // the next byte belongs to page 6 and is faulted in separately
        vm.write_vmem(0x006000, 0x33).unwrap();
        assert_eq!(vm.statistics_snapshot().page_faults, 1);
        assert_eq!(vm.read_vmem(0x005fff), Ok(0x22));
    }

    #[test]
    fn test_unmap_then_access_faults_again() {
        let mut vm = VMManager::new();
        vm.map_page(0x06, 40, RW).unwrap();
        vm.write_vmem(0x006100, 0x44).unwrap();
        assert_eq!(vm.read_vmem(0x006100), Ok(0x44));

        vm.unmap_page(0x06).unwrap();
        assert!(!vm.frames().is_used(40));
        assert!(matches!(
            vm.translate(0x006100, Access::Read),
            Err(VmError::TranslationMiss { .. })
        ));

        // the lowest free frame is 0, and it comes back zeroed
        assert_eq!(vm.read_vmem(0x006100), Ok(0));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);
        assert_eq!(vm.entry(0x06).and_then(|e| e.mapped_frame()), Some(0));
    }

    #[test]
    fn test_refault_after_unmap_does_not_reuse_data() {
        let mut vm = VMManager::new();
        vm.write_vmem(0x007123, 0x5c).unwrap();
        assert_eq!(vm.entry(0x07).and_then(|e| e.mapped_frame()), Some(0));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);

        vm.unmap_page(0x07).unwrap();
        // frame 0 still holds 0x5c but is handed out again zeroed
        assert_eq!(vm.physical().read(0x123), 0x5c);
        assert_eq!(vm.read_vmem(0x007123), Ok(0));

        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, 2);
        assert_eq!(stats.translation_failures, 2);
        assert_eq!(stats.frames_used, 1);
    }

    #[test]
    fn test_counters_wrap_at_u32_max() {
        let mut vm = VMManager::new();
        vm.counters = Counters {
            page_faults: u32::MAX,
            reads: u32::MAX,
            writes: u32::MAX,
            translation_failures: u32::MAX,
        };

        vm.write_vmem(0x003000, 0x11).unwrap();
        assert_eq!(vm.read_vmem(0x003000), Ok(0x11));

        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, 0);
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.reads, 0);
        assert_eq!(stats.translation_failures, 0);
    }

    #[test]
    fn test_unmap_unallocated_table_is_ok() {
        let mut vm = VMManager::new();
        assert_eq!(vm.unmap_page(0x42), Ok(()));
    }

    #[test]
    fn test_large_data_transfer() {
        let mut vm = VMManager::new();
        for addr in (0..0x10000u32).step_by(256) {
            vm.write_vmem(addr, ((addr / 256) & 0xff) as u8).unwrap();
        }
        for addr in (0..0x10000u32).step_by(256) {
            assert_eq!(vm.read_vmem(addr), Ok(((addr / 256) & 0xff) as u8));
        }
        assert_eq!(vm.statistics_snapshot().page_faults, 16);
    }

    #[test]
    fn test_faulting_every_page_uses_every_frame() {
        let mut vm = VMManager::new();
        for i in 0..NUM_PAGES {
            vm.write_vmem((i * PAGE_SIZE) as u32, i as u8).unwrap();
        }
        let stats = vm.statistics_snapshot();
        assert_eq!(stats.page_faults, NUM_PAGES as u32);
        assert_eq!(stats.frames_used, NUM_FRAMES);

        for i in 0..NUM_PAGES {
            let va = (i * PAGE_SIZE) as u32;
            assert_eq!(vm.read_vmem(va), Ok(i as u8));
            vm.write_vmem(va + 1, 0x5a).unwrap();
        }
        assert_eq!(vm.statistics_snapshot().page_faults, NUM_PAGES as u32);
        assert!(matches!(
            vm.write_vmem((NUM_PAGES * PAGE_SIZE) as u32, 0x99),
            Err(VmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_exhaustion_reports_allocation_failure() {
        let mut vm = VMManager::new();
        // remapping page 0 leaks frame 0, leaving one page short of frames
        vm.map_page(0x00, 0, RW).unwrap();
        vm.map_page(0x00, 1, RW).unwrap();
        for i in 1..NUM_PAGES - 1 {
            vm.write_vmem((i * PAGE_SIZE) as u32, i as u8).unwrap();
        }
        assert_eq!(vm.statistics_snapshot().frames_used, NUM_FRAMES);

        let last = ((NUM_PAGES - 1) * PAGE_SIZE) as u32;
        assert_eq!(vm.write_vmem(last, 0x99), Err(VmError::AllocationFailure));
        assert_eq!(vm.read_vmem(last), Err(VmError::AllocationFailure));
        assert!(!vm.entry(NUM_PAGES - 1).is_some_and(|e| e.is_valid()));

        // everything mapped before the failure still works
        for i in 1..NUM_PAGES - 1 {
            let va = (i * PAGE_SIZE) as u32;
            assert_eq!(vm.read_vmem(va), Ok(i as u8));
            vm.write_vmem(va, 0).unwrap();
        }
        vm.write_vmem(0x000010, 0x77).unwrap();
        assert_eq!(vm.read_vmem(0x000010), Ok(0x77));

        // freeing one page lets the faulting access succeed
        vm.unmap_page(0x10).unwrap();
        vm.write_vmem(last, 0x99).unwrap();
        assert_eq!(vm.read_vmem(last), Ok(0x99));
    }

    #[test]
    fn test_two_level_independence() {
        let mut vm = VMManager::new();
        vm.map_page(0x00, 50, RW).unwrap();
        vm.map_page(0x1f, 51, RW).unwrap();
        vm.map_page(0xab, 52, RW).unwrap();
        assert_eq!(vm.page_table().allocated_tables(), 3);

        vm.write_vmem(0x000100, 0xaa).unwrap();
        vm.write_vmem(0x01f200, 0xbb).unwrap();
        vm.write_vmem(0x0ab300, 0xcc).unwrap();

        assert_eq!(vm.read_vmem(0x000100), Ok(0xaa));
        assert_eq!(vm.read_vmem(0x01f200), Ok(0xbb));
        assert_eq!(vm.read_vmem(0x0ab300), Ok(0xcc));
        assert_eq!(vm.statistics_snapshot().page_faults, 0);
    }

    #[test]
    fn test_handle_fault_directly() {
        let mut vm = VMManager::new();
        vm.handle_fault(0x30).unwrap();
        assert_eq!(vm.entry(0x30).and_then(|e| e.mapped_frame()), Some(0));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);

        assert!(matches!(
            vm.handle_fault(NUM_PAGES),
            Err(VmError::OutOfBounds { .. })
        ));
        assert_eq!(vm.statistics_snapshot().page_faults, 1);
        assert_eq!(vm.statistics_snapshot().frames_used, 1);
    }

    #[test]
    fn test_translate_counts_failures() {
        let mut vm = VMManager::new();
        assert!(vm.translate(0x1000, Access::Read).is_err());
        assert!(vm.translate(0x1000, Access::Write).is_err());
        assert_eq!(vm.statistics_snapshot().translation_failures, 2);
        // translate never faults
        assert_eq!(vm.statistics_snapshot().page_faults, 0);
    }

    #[test]
    fn test_init_resets_everything() {
        let mut vm = VMManager::new();
        vm.write_vmem(0x1000, 1).unwrap();
        vm.map_page(0x80, 100, PteFlags::READ).unwrap();
        let _ = vm.write_vmem(0x80000, 1);

        vm.init();
        let stats = vm.statistics_snapshot();
        assert_eq!(
            (stats.page_faults, stats.reads, stats.writes, stats.translation_failures),
            (0, 0, 0, 0)
        );
        assert_eq!(stats.frames_used, 0);
        assert_eq!(vm.page_table().allocated_tables(), 0);

        // init is idempotent
        vm.init();
        assert_eq!(vm.statistics_snapshot(), stats);
    }

    #[test]
    fn test_teardown_keeps_bitmap() {
        let mut vm = VMManager::new();
        vm.write_vmem(0x1000, 1).unwrap();
        vm.write_vmem(0xf0000, 1).unwrap();

        vm.teardown();
        assert_eq!(vm.page_table().allocated_tables(), 0);
        assert_eq!(vm.statistics_snapshot().frames_used, 2);
    }

    #[test]
    fn test_independent_instances() {
        let mut a = VMManager::new();
        let mut b = VMManager::new();
        a.write_vmem(0x1000, 0x12).unwrap();
        b.write_vmem(0x1000, 0x34).unwrap();
        assert_eq!(a.read_vmem(0x1000), Ok(0x12));
        assert_eq!(b.read_vmem(0x1000), Ok(0x34));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn mapped_round_trip(vpage in 0usize..NUM_PAGES, frame in 0usize..NUM_FRAMES, offset in 0usize..PAGE_SIZE, value: u8) {
            let mut vm = VMManager::new();
            vm.map_page(vpage, frame, RW).unwrap();
            let va = (vpage * PAGE_SIZE + offset) as u32;
            vm.write_vmem(va, value).unwrap();
            prop_assert_eq!(vm.read_vmem(va), Ok(value));
            prop_assert_eq!(vm.statistics_snapshot().page_faults, 0);
        }

        #[test]
        fn permission_denied_never_faults(vpage in 0usize..NUM_PAGES, offset in 0usize..PAGE_SIZE, readable: bool) {
            let mut vm = VMManager::new();
            let flags = if readable { PteFlags::READ } else { PteFlags::WRITE };
            vm.map_page(vpage, 0, flags).unwrap();
            let va = (vpage * PAGE_SIZE + offset) as u32;
            let denied = if readable {
                vm.write_vmem(va, 1).err()
            } else {
                vm.read_vmem(va).err()
            };
            prop_assert!(
                matches!(denied, Some(VmError::PermissionDenied { .. })),
                "expected PermissionDenied, got {:?}",
                denied
            );
            prop_assert_eq!(vm.statistics_snapshot().page_faults, 0);
        }
    }
}
