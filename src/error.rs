use thiserror::Error;

/// Result alias used throughout the simulator.
pub type Result<T> = core::result::Result<T, VmError>;

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Write => f.write_str("write"),
        }
    }
}

/// Failures surfaced by the page table, allocator, translator and access routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// A page number, frame index or address lies outside its legal range.
    #[error("{what} {value:#x} out of bounds (limit {limit:#x})")]
    OutOfBounds {
        what: &'static str,
        value: usize,
        limit: usize,
    },
    /// No free physical frame, or no memory for a second-level table.
    #[error("out of physical memory")]
    AllocationFailure,
    /// No valid mapping exists for the address.
    #[error("no mapping for virtual address {address:#x}")]
    TranslationMiss { address: u32 },
    /// A mapping exists but forbids this direction of access.
    #[error("{access} permission denied at virtual address {address:#x}")]
    PermissionDenied { address: u32, access: Access },
    /// A broken invariant; a valid entry produced an impossible physical address.
    #[error("internal inconsistency: {address:#x} translated to {physical:#x}")]
    InternalInconsistency { address: u32, physical: usize },
}

impl VmError {
    /// Only a miss can be recovered by servicing a page fault.
    pub fn is_retriable(&self) -> bool {
        matches!(self, VmError::TranslationMiss { .. })
    }

    /// Short stable name used in trace output.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::OutOfBounds { .. } => "out-of-bounds",
            VmError::AllocationFailure => "allocation-failure",
            VmError::TranslationMiss { .. } => "translation-miss",
            VmError::PermissionDenied { .. } => "permission-denied",
            VmError::InternalInconsistency { .. } => "internal-inconsistency",
        }
    }

    pub(crate) fn virtual_page(value: usize) -> Self {
        VmError::OutOfBounds {
            what: "virtual page",
            value,
            limit: crate::constants::NUM_PAGES,
        }
    }

    pub(crate) fn physical_frame(value: usize) -> Self {
        VmError::OutOfBounds {
            what: "physical frame",
            value,
            limit: crate::constants::NUM_FRAMES,
        }
    }

    pub(crate) fn virtual_address(value: u32) -> Self {
        VmError::OutOfBounds {
            what: "virtual address",
            value: value as usize,
            limit: crate::constants::RAM_SIZE,
        }
    }
}

/// Errors raised while loading or parsing a trace file.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("failed to write results: {0}")]
    Write(#[from] std::io::Error),
}

impl TraceError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        TraceError::Parse {
            line,
            message: message.into(),
        }
    }
}
