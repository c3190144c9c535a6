//! Device-facing definitions of the convolution accelerator.
//!
//! This module provides:
//! - Command/acknowledge packet formats and status bits
//! - The bus address map and the readable register set
//! - The command/acknowledge protocol state machine
//! - The host memory the accelerator reads from and writes into
//!
//! # Address Map
//!
//! Only the low six address bits of a bus packet are decoded:
//!
//! ```text
//!   0x00 ┌────────────────────┐
//!        │ command region     │  header packets 0..3 at 0x00, 0x08, 0x10, 0x18
//!   0x20 ├────────────────────┤
//!        │ payload region     │  payload packet n at 0x20 + (n & 3) * 8
//!   0x3F └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use matconv_emu::device::{CommandPacket, CommandType, PacketRegion};
//!
//! let cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);
//! assert!(cmd.checksum_ok());
//! assert_eq!(cmd.payload_packets(), 2);
//!
//! assert_eq!(PacketRegion::classify(0x28), PacketRegion::Payload);
//! assert_eq!(PacketRegion::Command.address(5), 0x08);
//! ```

pub mod fsm;
pub mod host_memory;
pub mod protocol;
pub mod registers;

pub use fsm::{HeaderEvent, PayloadEvent, ProtocolFsm, ProtocolState, SizeLimits};
pub use host_memory::{HostMemory, HostMemoryError, MemoryInterface, MemoryRegion};
pub use protocol::{AckPacket, CommandPacket, CommandType, Status, E_KEY, PACKET_BYTES, S_KEY};
pub use registers::{CmdTypeReg, PacketRegion, RegisterSet, StatusReg};
