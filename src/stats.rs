use std::fmt;

/// Monotonic event counters kept by an address space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub page_faults: u32,
    pub reads: u32,
    pub writes: u32,
    pub translation_failures: u32,
}

/// Point-in-time view of the counters plus frame usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub page_faults: u32,
    pub reads: u32,
    pub writes: u32,
    pub translation_failures: u32,
    pub frames_used: usize,
    pub frames_total: usize,
}

impl Statistics {
    pub fn new(counters: Counters, frames_used: usize, frames_total: usize) -> Self {
        Statistics {
            page_faults: counters.page_faults,
            reads: counters.reads,
            writes: counters.writes,
            translation_failures: counters.translation_failures,
            frames_used,
            frames_total,
        }
    }

    /// Fraction of physical frames currently in use.
    pub fn frame_usage(&self) -> f64 {
        if self.frames_total == 0 {
            return 0.0;
        }
        self.frames_used as f64 / self.frames_total as f64
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Virt Mem Stats ===")?;
        writeln!(f, "{:<12}:  {}", "Page faults", self.page_faults)?;
        writeln!(f, "{:<12}:  {}", "Reads", self.reads)?;
        writeln!(f, "{:<12}:  {}", "Writes", self.writes)?;
        writeln!(f, "{:<12}:  {}", "Trans fails", self.translation_failures)?;
        write!(
            f,
            "{:<12}:  {} / {}",
            "PHY used", self.frames_used, self.frames_total
        )
    }
}
