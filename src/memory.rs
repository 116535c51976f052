use log::{trace, warn};

use crate::constants::*;
use crate::error::{Result, VmError};

/// The physical store: `RAM_SIZE` bytes split into `NUM_FRAMES` frames.
pub struct PhysicalMemory {
    data: Box<[u8]>,
}

impl PhysicalMemory {
    /// Create a new physical memory initialized to all zeros
    pub fn new() -> Self {
        PhysicalMemory {
            data: vec![0u8; RAM_SIZE].into_boxed_slice(),
        }
    }

    /// Read a byte from physical memory
    #[inline]
    pub fn read(&self, address: usize) -> u8 {
        self.data[address]
    }

    /// Write a byte to physical memory
    #[inline]
    pub fn write(&mut self, address: usize, value: u8) {
        self.data[address] = value;
    }

    /// Calculate the starting address of a frame
    #[inline]
    pub fn frame_to_address(frame: usize) -> usize {
        frame * PAGE_SIZE
    }

    /// Borrow the bytes of a single frame
    pub fn frame(&self, frame: usize) -> &[u8] {
        let start = Self::frame_to_address(frame);
        &self.data[start..start + PAGE_SIZE]
    }

    /// Mutably borrow the bytes of a single frame
    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        let start = Self::frame_to_address(frame);
        &mut self.data[start..start + PAGE_SIZE]
    }

    pub fn zero_frame(&mut self, frame: usize) {
        self.frame_mut(frame).fill(0);
    }

    /// Get direct access to the underlying data
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks which frames are available for allocation
pub struct FrameAllocator {
    used: [bool; NUM_FRAMES],
}

impl FrameAllocator {
    pub fn new() -> Self {
        FrameAllocator {
            used: [false; NUM_FRAMES],
        }
    }

    /// Hand out the lowest free frame, zero-filled.
    pub fn allocate(&mut self, pm: &mut PhysicalMemory) -> Result<usize> {
        let Some(frame) = self.used.iter().position(|used| !used) else {
            warn!("no free physical frame left ({NUM_FRAMES} in use)");
            return Err(VmError::AllocationFailure);
        };
        self.used[frame] = true;
        pm.zero_frame(frame);
        trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Return a frame to the pool. Contents are left as they are.
    ///
    /// An out-of-range index is ignored.
    pub fn free(&mut self, frame: usize) {
        match self.used.get_mut(frame) {
            Some(slot) => {
                *slot = false;
                trace!("freed frame {frame}");
            }
            None => warn!("ignoring free of out-of-range frame {frame}"),
        }
    }

    /// Mark a frame used without zeroing it (explicit mappings).
    pub fn mark_used(&mut self, frame: usize) -> Result<()> {
        let slot = self
            .used
            .get_mut(frame)
            .ok_or(VmError::physical_frame(frame))?;
        *slot = true;
        Ok(())
    }

    #[inline]
    pub fn is_used(&self, frame: usize) -> bool {
        self.used.get(frame).copied().unwrap_or(false)
    }

    pub fn used_count(&self) -> usize {
        self.used.iter().filter(|&&used| used).count()
    }

    pub fn free_count(&self) -> usize {
        NUM_FRAMES - self.used_count()
    }

    pub fn reset(&mut self) {
        self.used = [false; NUM_FRAMES];
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}
