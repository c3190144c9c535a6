//! Host side of the accelerator link.
//!
//! The host stages matrices in host memory, streams command headers and
//! payload packets over the bus and reads acknowledge packets back after
//! each interrupt.
//!
//! ```text
//!   host memory                              accelerator
//!   ┌──────────┐   header / payload packets   ┌──────────┐
//!   │ ack      │ ───────────────────────────► │ FIFO     │
//!   │ kernel   │                              │ FSM      │
//!   │ subject  │ ◄─────────────────────────── │ clusters │
//!   │ output   │    ack + output words, IRQ   └──────────┘
//!   └──────────┘
//! ```

pub mod golden;
pub mod issuer;
pub mod matrix;

pub use issuer::{run_convolution, CommandIssuer, IssuerError};
pub use matrix::Matrix;

use crate::device::host_memory::{HostMemory, HostMemoryError};
use crate::device::protocol::HEADER_WORDS;
use crate::emu::AccelError;

/// Session interface between the host driver and an accelerator.
pub trait HostPort {
    /// Put one packet on the bus.
    fn transmit(&mut self, addr: u64, packet: u64) -> Result<(), AccelError>;

    fn memory(&self) -> &HostMemory;

    fn memory_mut(&mut self) -> &mut HostMemory;

    /// Consume a pending interrupt, if one was raised.
    fn take_interrupt(&mut self) -> bool;

    /// Run the accelerator until it raises an interrupt. Returns the number
    /// of cycles waited.
    fn wait_for_interrupt(&mut self, max_cycles: u64) -> Result<u64, AccelError>;
}

const PAGE: u64 = 0x1000;

/// Placement of the buffers of one convolution in host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub ack_addr: u32,
    pub kernel_addr: u64,
    pub subject_addr: u64,
    pub output_addr: u64,
    pub rows: u16,
    pub cols: u16,
}

impl MemoryLayout {
    /// Page-aligned layout for a `rows` x `cols` subject.
    pub fn new(rows: u16, cols: u16) -> Self {
        let bytes = rows as u64 * cols as u64;
        let subject_addr = 2 * PAGE;
        Self {
            ack_addr: 0x100,
            kernel_addr: PAGE,
            subject_addr,
            output_addr: (subject_addr + bytes).div_ceil(PAGE) * PAGE,
            rows,
            cols,
        }
    }

    /// Matrix size in bytes.
    pub fn subject_bytes(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// First byte past the output buffer.
    pub fn end(&self) -> u64 {
        self.output_addr + self.subject_bytes() as u64
    }

    /// Register the layout's buffers as named regions.
    pub fn allocate(&self, mem: &mut HostMemory) -> Result<(), HostMemoryError> {
        let ack_bytes = HEADER_WORDS * 4;
        mem.allocate_region("ack", self.ack_addr as u64, ack_bytes)?;
        mem.allocate_region("kernel", self.kernel_addr, PAGE as usize)?;
        mem.allocate_region("subject", self.subject_addr, self.subject_bytes())?;
        mem.allocate_region("output", self.output_addr, self.subject_bytes())?;
        Ok(())
    }
}
