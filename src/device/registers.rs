//! Bus address decoding and the accelerator's register set.
//!
//! # Address Encoding
//!
//! Only the low bits of a bus address are decoded. The masked offset
//! selects the command region or the payload region; the remaining bits are
//! free to wrap, so a sender may cycle through a small window of addresses:
//!
//! ```text
//! addr & ADDR_MASK (0x3F)
//!   0x00..=0x1F  command  (header packets)
//!   0x20..=0x3F  payload  (kernel / subject data)
//!
//! header packet i  -> OFFSET_COMMAND + ((i & WRAP_MASK) << 3)
//! payload packet n -> OFFSET_PAYLOAD + ((n & WRAP_MASK) << 3)
//! ```

use std::fmt;

use super::protocol::{CommandType, Status};

/// Decoded bits of a bus address.
pub const ADDR_MASK: u64 = 0x3F;

/// Start of the command region.
pub const OFFSET_COMMAND: u64 = 0x00;

/// Start of the payload region.
pub const OFFSET_PAYLOAD: u64 = 0x20;

/// Packet index bits used before the address wraps.
pub const WRAP_MASK: u64 = 0x3;

/// Region a bus packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketRegion {
    /// Command header words.
    Command,
    /// Kernel or subject payload bytes.
    Payload,
}

impl PacketRegion {
    /// Classify a bus address.
    #[inline]
    pub fn classify(addr: u64) -> Self {
        if (addr & ADDR_MASK) >= OFFSET_PAYLOAD {
            PacketRegion::Payload
        } else {
            PacketRegion::Command
        }
    }

    /// Bus address of the `index`-th packet sent to this region.
    #[inline]
    pub fn address(self, index: u64) -> u64 {
        let base = match self {
            PacketRegion::Command => OFFSET_COMMAND,
            PacketRegion::Payload => OFFSET_PAYLOAD,
        };
        base + ((index & WRAP_MASK) << 3)
    }
}

impl fmt::Display for PacketRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketRegion::Command => write!(f, "CMD"),
            PacketRegion::Payload => write!(f, "PAYLOAD"),
        }
    }
}

/// Status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReg {
    /// Status of the last completed header or transaction.
    pub error: Status,
    /// No payload outstanding; a new header may start.
    pub ready: bool,
    /// Compute pipeline still has work in flight.
    pub busy: bool,
}

/// Command type register, latched from the start-key packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdTypeReg {
    pub is_kern: bool,
    pub is_subj: bool,
}

impl CmdTypeReg {
    pub fn latch(&mut self, cmd_type: CommandType) {
        self.is_kern = cmd_type == CommandType::Kernel;
        self.is_subj = cmd_type == CommandType::Subject;
    }

    pub fn cmd_type(&self) -> Option<CommandType> {
        match (self.is_kern, self.is_subj) {
            (true, false) => Some(CommandType::Kernel),
            (false, true) => Some(CommandType::Subject),
            _ => None,
        }
    }
}

/// Registers mutated by the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    pub status: StatusReg,
    pub cmd_type: CmdTypeReg,
}

impl RegisterSet {
    /// Bit layout of the readable state word.
    ///
    /// ```text
    /// [ 4: 0] status
    /// [12: 5] packets still expected in the current subject row (saturating)
    /// [31:13] payload packets still expected in the transaction (saturating)
    /// ```
    pub const STATE_COLS_SHIFT: u32 = 5;
    pub const STATE_PACKETS_SHIFT: u32 = 13;

    /// Register values after reset.
    pub fn new() -> Self {
        Self {
            status: StatusReg {
                error: Status::OK,
                ready: true,
                busy: false,
            },
            cmd_type: CmdTypeReg::default(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Pack the state word from the register contents and the data-phase
    /// progress counters.
    pub fn state_word(&self, row_packets_left: u32, packets_left: u32) -> u32 {
        let status = self.status.error.bits() & ((1 << Status::BITS) - 1);
        let cols = row_packets_left.min(0xFF);
        let packets = packets_left.min((1 << 19) - 1);
        status | (cols << Self::STATE_COLS_SHIFT) | (packets << Self::STATE_PACKETS_SHIFT)
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.cmd_type.cmd_type() {
            Some(t) => t.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "status={} ready={} busy={} cmd={}",
            self.status.error, self.status.ready, self.status.busy, kind
        )
    }
}
