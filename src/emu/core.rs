//! Convolution core.
//!
//! A core is the smallest compute unit: one kernel row dotted with one
//! window of pixels, added to the partial sum carried from the previous
//! kernel row. Jobs are latched at dispatch and computed on the next tick;
//! the result is visible one tick after that.
//!
//! ```text
//!   tick D          tick D+1                 tick D+2
//!   dispatch ──►    step: carry + Σ k·p  ──► get_row_result()
//! ```

use smallvec::SmallVec;

use super::clock::{Clocked, Register};

/// Partial sums wrap at 18 bits.
pub const RESULT_MASK: u32 = 0x3FFFF;

/// Inline storage for one kernel row (max dimension 15).
pub type RowBytes = SmallVec<[u8; 16]>;

/// Multiply-accumulate of one kernel row against one pixel window.
///
/// Kernel bytes are two's-complement, pixels are unsigned. The result is
/// `carry + Σ kernel_row[i] * pixel_group[i]` masked to 18 bits.
pub fn row_mac(carry: u32, kernel_row: &[u8], pixel_group: &[u8]) -> u32 {
    let sum = kernel_row
        .iter()
        .zip(pixel_group)
        .fold(0i32, |acc, (&k, &p)| acc.wrapping_add(k as i8 as i32 * p as i32));
    carry.wrapping_add(sum as u32) & RESULT_MASK
}

/// One row job for a core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowJob {
    pub carry: u32,
    pub kernel_row: RowBytes,
    pub pixels: RowBytes,
}

/// Capability interface of a compute core.
pub trait ComputeCore: Clocked {
    /// Pure row multiply-accumulate.
    fn calculate_row_result(&self, carry: u32, kernel_row: &[u8], pixel_group: &[u8]) -> u32 {
        row_mac(carry, kernel_row, pixel_group)
    }

    /// Latch a job; it is computed on the next tick.
    fn dispatch(&mut self, job: RowJob);

    /// Evaluate one tick.
    fn step(&mut self);

    /// Result committed at the last clock edge, if the core produced one.
    fn get_row_result(&self) -> Option<u32>;

    fn reset(&mut self);
}

/// Registered convolution core.
#[derive(Debug, Clone)]
pub struct Core {
    /// Index within its cluster (for tracing).
    pub index: usize,
    job: Register<Option<RowJob>>,
    result: Register<Option<u32>>,
    /// Jobs computed since reset.
    pub jobs: u64,
}

impl Core {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            job: Register::new(None),
            result: Register::new(None),
            jobs: 0,
        }
    }

    /// True if no job is latched or being computed.
    pub fn is_idle(&self) -> bool {
        self.job.output().is_none() && !self.job.has_pending()
    }
}

impl ComputeCore for Core {
    fn dispatch(&mut self, job: RowJob) {
        self.job.assign(Some(job));
    }

    fn step(&mut self) {
        match self.job.output() {
            Some(job) => {
                let value = self.calculate_row_result(job.carry, &job.kernel_row, &job.pixels);
                log::trace!(
                    "core {}: {:05x} = {:05x} + {:02x?}.{:02x?}",
                    self.index,
                    value,
                    job.carry,
                    job.kernel_row.as_slice(),
                    job.pixels.as_slice()
                );
                self.result.assign(Some(value));
                self.job.assign(None);
                self.jobs += 1;
            }
            None => self.result.assign(None),
        }
    }

    fn get_row_result(&self) -> Option<u32> {
        *self.result.output()
    }

    fn reset(&mut self) {
        self.job.force(None);
        self.result.force(None);
        self.jobs = 0;
    }
}

impl Clocked for Core {
    fn update(&mut self) {
        self.job.update();
        self.result.update();
    }
}
