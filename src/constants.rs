pub const OFFSET_BITS: u32 = 12;
pub const L2_BITS: u32 = 4;
pub const L1_BITS: u32 = 4;

pub const PAGE_SIZE: usize = 1 << OFFSET_BITS;
pub const L1_ENTRIES: usize = 1 << L1_BITS;
pub const L2_ENTRIES: usize = 1 << L2_BITS;
pub const NUM_PAGES: usize = L1_ENTRIES * L2_ENTRIES;

pub const RAM_SIZE: usize = 1 << 20;
pub const NUM_FRAMES: usize = RAM_SIZE / PAGE_SIZE;

pub const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;
pub const L2_MASK: u32 = (1 << L2_BITS) - 1;
pub const L1_MASK: u32 = (1 << L1_BITS) - 1;

// shifts within a full virtual address
pub const L2_SHIFT: u32 = OFFSET_BITS;
pub const L1_SHIFT: u32 = OFFSET_BITS + L2_BITS;

// shift within a virtual page number
pub const VPN_L1_SHIFT: u32 = L2_BITS;

const _: () = assert!(NUM_PAGES == NUM_FRAMES);
const _: () = assert!(NUM_FRAMES * PAGE_SIZE == RAM_SIZE);
