//! Command/acknowledge handshake.
//!
//! ```text
//!            s_key,command   size,tx_addr   trans_id,rsvd   e_key,chksum
//! WAIT_SKEY ─────────────► WAIT_SIZE ─────► WAIT_TID ──────► WAIT_EKEY
//!     ▲                                                       │     │
//!     │                      errors: write ack ◄──────────────┘     │ ok: write ack
//!     │                                                             ▼
//!     └───────────────── completion ack ◄────────────────────── WAIT_DATA
//! ```
//!
//! Every header state advances unconditionally; validation failures are
//! OR-ed into the pending acknowledge status. Only `WAIT_EKEY` decides
//! whether the transaction enters the data phase. The state machine itself
//! never touches memory: it hands the acknowledge packet back to the
//! controller, which owns the memory interface.

use std::fmt;

use super::protocol::{
    split_packet, AckPacket, CommandPacket, CommandType, Status, E_KEY, PACKET_BYTES, S_KEY,
};
use super::registers::RegisterSet;

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    WaitSkey,
    WaitSize,
    WaitTid,
    WaitEkey,
    WaitData,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::WaitSkey => "WAIT_SKEY",
            ProtocolState::WaitSize => "WAIT_SIZE",
            ProtocolState::WaitTid => "WAIT_TID",
            ProtocolState::WaitEkey => "WAIT_EKEY",
            ProtocolState::WaitData => "WAIT_DATA",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a header packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEvent {
    /// Header still incomplete.
    Pending,
    /// Header complete and valid; the data phase has started.
    Accepted(AckPacket),
    /// Header complete but rejected; back in `WAIT_SKEY`.
    Rejected(AckPacket),
    /// Command packet arrived during the data phase and was dropped.
    Dropped,
}

/// Outcome of a payload packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEvent {
    /// Packet belongs to the current transaction. `last` is set on the
    /// packet that completes the announced element count.
    Accepted { last: bool },
    /// No transaction is receiving data; the packet is discarded.
    Dropped,
    /// Payload interleaved with a header; flagged as `ERR_ORD`.
    OutOfOrder,
}

/// Shape limits checked in `WAIT_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_kernel_dim: u16,
    pub max_subject_cols: u16,
}

/// Protocol state machine.
#[derive(Debug, Clone)]
pub struct ProtocolFsm {
    state: ProtocolState,
    limits: SizeLimits,
    /// Header being assembled (and, during the data phase, the active one).
    cmd: CommandPacket,
    /// Pending acknowledge.
    ack: AckPacket,
    loaded_elements: u32,
    expected_elements: u32,
    kernel_dim: Option<u16>,
}

impl ProtocolFsm {
    pub fn new(limits: SizeLimits) -> Self {
        Self {
            state: ProtocolState::WaitSkey,
            limits,
            cmd: CommandPacket::default(),
            ack: AckPacket::default(),
            loaded_elements: 0,
            expected_elements: 0,
            kernel_dim: None,
        }
    }

    /// Return to `WAIT_SKEY` and forget the loaded kernel.
    pub fn reset(&mut self) {
        *self = Self::new(self.limits);
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Header of the current (or last) transaction.
    pub fn command(&self) -> &CommandPacket {
        &self.cmd
    }

    /// Dimension of the kernel currently held by the clusters.
    pub fn kernel_dim(&self) -> Option<u16> {
        self.kernel_dim
    }

    pub fn loaded_elements(&self) -> u32 {
        self.loaded_elements
    }

    pub fn expected_elements(&self) -> u32 {
        self.expected_elements
    }

    /// Payload packets still expected in the data phase.
    pub fn packets_left(&self) -> u32 {
        if self.state != ProtocolState::WaitData {
            return 0;
        }
        let expected = self.expected_elements.div_ceil(PACKET_BYTES as u32);
        expected.saturating_sub(self.loaded_elements / PACKET_BYTES as u32)
    }

    /// Payload packets still expected in the current subject row.
    pub fn row_packets_left(&self) -> u32 {
        if self.state != ProtocolState::WaitData || self.cmd.cmd_type() != CommandType::Subject {
            return 0;
        }
        let row_packets = (self.cmd.cols() as u32 / PACKET_BYTES as u32).max(1);
        let received = self.loaded_elements / PACKET_BYTES as u32;
        if self.packets_left() == 0 {
            0
        } else {
            row_packets - received % row_packets
        }
    }

    /// Feed a packet from the command region.
    pub fn on_header_packet(&mut self, packet: u64, regs: &mut RegisterSet) -> HeaderEvent {
        let (lo, hi) = split_packet(packet);

        match self.state {
            ProtocolState::WaitSkey => {
                self.cmd = CommandPacket {
                    s_key: lo,
                    command: hi,
                    ..CommandPacket::default()
                };
                self.ack = AckPacket {
                    s_key: lo,
                    command: hi,
                    ..AckPacket::default()
                };

                if lo != S_KEY {
                    self.ack.status |= Status::ERR_KEY;
                }

                let cmd_type = CommandType::from_command_word(hi);
                regs.cmd_type.latch(cmd_type);
                if cmd_type == CommandType::Subject && self.kernel_dim.is_none() {
                    log::warn!("Subject command before any kernel was loaded");
                    self.ack.status |= Status::ERR_ORD;
                }

                log::debug!(
                    "WAIT_SKEY: received {:08x}, {:08x}, status {}",
                    lo,
                    hi,
                    self.ack.status
                );
                self.state = ProtocolState::WaitSize;
                HeaderEvent::Pending
            }
            ProtocolState::WaitSize => {
                self.cmd.size = lo;
                self.cmd.tx_addr = hi;
                self.ack.size = lo;
                self.ack.tx_addr = hi;

                if !self.size_ok() {
                    self.ack.status |= Status::ERR_SIZE;
                }
                self.expected_elements = self.cmd.expected_elements();

                log::debug!(
                    "WAIT_SIZE: {}x{} {}, status {}",
                    self.cmd.rows(),
                    self.cmd.cols(),
                    self.cmd.cmd_type(),
                    self.ack.status
                );
                self.state = ProtocolState::WaitTid;
                HeaderEvent::Pending
            }
            ProtocolState::WaitTid => {
                self.cmd.trans_id = lo;
                self.cmd.reserved = hi;
                self.ack.trans_id = lo;

                log::debug!("WAIT_TID: transaction {}", lo);
                self.state = ProtocolState::WaitEkey;
                HeaderEvent::Pending
            }
            ProtocolState::WaitEkey => {
                self.cmd.e_key = lo;
                self.cmd.chksum = hi;
                self.ack.e_key = lo;

                if lo != E_KEY {
                    self.ack.status |= Status::ERR_KEY;
                }
                if !self.cmd.checksum_ok() {
                    self.ack.status |= Status::ERR_CHKSM;
                }
                self.ack.seal();
                regs.status.error = self.ack.status;

                log::debug!("WAIT_EKEY: {} status {}", self.cmd, self.ack.status);
                if self.ack.status.is_ok() {
                    self.loaded_elements = 0;
                    self.state = ProtocolState::WaitData;
                    HeaderEvent::Accepted(self.ack)
                } else {
                    log::info!("Rejected {}: {}", self.cmd, self.ack.status);
                    self.expected_elements = 0;
                    self.state = ProtocolState::WaitSkey;
                    HeaderEvent::Rejected(self.ack)
                }
            }
            ProtocolState::WaitData => {
                log::warn!("Command packet {:016x} during data phase dropped", packet);
                HeaderEvent::Dropped
            }
        }
    }

    /// Feed a packet from the payload region.
    pub fn on_payload_packet(&mut self, regs: &mut RegisterSet) -> PayloadEvent {
        match self.state {
            ProtocolState::WaitData => {
                if self.loaded_elements >= self.expected_elements {
                    return PayloadEvent::Dropped;
                }
                regs.status.ready = false;
                self.loaded_elements += PACKET_BYTES as u32;
                PayloadEvent::Accepted {
                    last: self.loaded_elements >= self.expected_elements,
                }
            }
            ProtocolState::WaitSkey => PayloadEvent::Dropped,
            _ => {
                log::warn!("Payload packet inside header ({})", self.state);
                self.ack.status |= Status::ERR_ORD;
                PayloadEvent::OutOfOrder
            }
        }
    }

    /// Close the data phase and build the completion acknowledge.
    ///
    /// `status` carries errors seen while processing the data (e.g. an
    /// output write that fell outside memory).
    pub fn finish_data(&mut self, status: Status, regs: &mut RegisterSet) -> AckPacket {
        if self.cmd.cmd_type() == CommandType::Kernel && status.is_ok() {
            self.kernel_dim = Some(self.cmd.rows());
        }

        self.ack.status = status;
        self.ack.seal();

        self.loaded_elements = 0;
        self.expected_elements = 0;
        regs.status.ready = true;
        regs.status.error = status;

        log::info!("Completed {}: {}", self.cmd, status);
        self.state = ProtocolState::WaitSkey;
        self.ack
    }

    fn size_ok(&self) -> bool {
        let rows = self.cmd.rows();
        let cols = self.cmd.cols();

        match self.cmd.cmd_type() {
            CommandType::Kernel => {
                rows == cols && rows & 1 == 1 && rows <= self.limits.max_kernel_dim
            }
            CommandType::Subject => {
                rows > 0
                    && cols > 0
                    && cols as usize % PACKET_BYTES == 0
                    && cols <= self.limits.max_subject_cols
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SizeLimits {
        SizeLimits {
            max_kernel_dim: 7,
            max_subject_cols: 1920,
        }
    }

    fn feed(fsm: &mut ProtocolFsm, regs: &mut RegisterSet, cmd: &CommandPacket) -> HeaderEvent {
        let mut last = HeaderEvent::Pending;
        for packet in cmd.to_packets() {
            last = fsm.on_header_packet(packet, regs);
        }
        last
    }

    fn load_kernel(fsm: &mut ProtocolFsm, regs: &mut RegisterSet, dim: u16) {
        let cmd = CommandPacket::new(CommandType::Kernel, dim, dim, 0x100, 0, 1);
        assert!(matches!(feed(fsm, regs, &cmd), HeaderEvent::Accepted(_)));
        let packets = cmd.payload_packets();
        for _ in 0..packets {
            fsm.on_payload_packet(regs);
        }
        fsm.finish_data(Status::OK, regs);
    }

    #[test]
    fn test_valid_kernel_header_enters_data() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);

        let event = feed(&mut fsm, &mut regs, &cmd);
        let HeaderEvent::Accepted(ack) = event else {
            panic!("expected acceptance, got {:?}", event);
        };
        assert!(ack.status.is_ok());
        assert!(ack.matches(&cmd));
        assert!(ack.checksum_ok());
        assert_eq!(fsm.state(), ProtocolState::WaitData);
        assert_eq!(fsm.expected_elements(), 9);
        assert!(regs.cmd_type.is_kern);
    }

    #[test]
    fn test_kernel_payload_completion() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let cmd = CommandPacket::new(CommandType::Kernel, 5, 5, 0x100, 0, 1);
        feed(&mut fsm, &mut regs, &cmd);

        assert_eq!(fsm.packets_left(), 4);
        for i in 0..4 {
            let event = fsm.on_payload_packet(&mut regs);
            assert_eq!(event, PayloadEvent::Accepted { last: i == 3 });
            assert!(!regs.status.ready);
        }
        assert_eq!(fsm.packets_left(), 0);

        let ack = fsm.finish_data(Status::OK, &mut regs);
        assert!(ack.checksum_ok());
        assert!(regs.status.ready);
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);
        assert_eq!(fsm.kernel_dim(), Some(5));
    }

    #[test]
    fn test_corrupt_s_key_never_reaches_data() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let mut cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);
        cmd.s_key = 0xCAFE_0000;
        cmd.chksum = cmd.expected_checksum();

        let event = feed(&mut fsm, &mut regs, &cmd);
        let HeaderEvent::Rejected(ack) = event else {
            panic!("expected rejection, got {:?}", event);
        };
        assert_eq!(ack.status, Status::ERR_KEY);
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);

        // Next valid command is unaffected
        let good = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 2);
        let event = feed(&mut fsm, &mut regs, &good);
        assert!(matches!(event, HeaderEvent::Accepted(a) if a.status.is_ok()));
    }

    #[test]
    fn test_errors_accumulate() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let mut cmd = CommandPacket::new(CommandType::Kernel, 4, 4, 0x100, 0, 1);
        cmd.e_key = 0;

        let event = feed(&mut fsm, &mut regs, &cmd);
        let HeaderEvent::Rejected(ack) = event else {
            panic!("expected rejection, got {:?}", event);
        };
        assert_eq!(ack.status, Status::ERR_SIZE | Status::ERR_KEY | Status::ERR_CHKSM);
        assert_eq!(regs.status.error, ack.status);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let mut cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);
        cmd.trans_id = 99;

        let event = feed(&mut fsm, &mut regs, &cmd);
        assert!(matches!(event, HeaderEvent::Rejected(a) if a.status == Status::ERR_CHKSM));
    }

    #[test]
    fn test_kernel_shape_validation() {
        for (rows, cols) in [(3, 5), (4, 4), (9, 9), (0, 0)] {
            let mut fsm = ProtocolFsm::new(limits());
            let mut regs = RegisterSet::new();
            let cmd = CommandPacket::new(CommandType::Kernel, rows, cols, 0x100, 0, 1);
            let event = feed(&mut fsm, &mut regs, &cmd);
            assert!(
                matches!(event, HeaderEvent::Rejected(a) if a.status == Status::ERR_SIZE),
                "{}x{} should be rejected",
                rows,
                cols
            );
        }
    }

    #[test]
    fn test_subject_cols_must_be_packet_multiple() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        load_kernel(&mut fsm, &mut regs, 3);

        let cmd = CommandPacket::new(CommandType::Subject, 8, 12, 0x100, 0x1000, 2);
        let event = feed(&mut fsm, &mut regs, &cmd);
        assert!(matches!(event, HeaderEvent::Rejected(a) if a.status == Status::ERR_SIZE));
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);

        let cmd = CommandPacket::new(CommandType::Subject, 8, 2048, 0x100, 0x1000, 3);
        let event = feed(&mut fsm, &mut regs, &cmd);
        assert!(matches!(event, HeaderEvent::Rejected(a) if a.status == Status::ERR_SIZE));
    }

    #[test]
    fn test_subject_before_kernel_is_out_of_order() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let cmd = CommandPacket::new(CommandType::Subject, 8, 8, 0x100, 0x1000, 1);

        let event = feed(&mut fsm, &mut regs, &cmd);
        assert!(matches!(event, HeaderEvent::Rejected(a) if a.status == Status::ERR_ORD));
        assert!(regs.cmd_type.is_subj);
    }

    #[test]
    fn test_payload_inside_header_is_out_of_order() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        let packets = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1).to_packets();

        fsm.on_header_packet(packets[0], &mut regs);
        assert_eq!(fsm.on_payload_packet(&mut regs), PayloadEvent::OutOfOrder);
        for packet in &packets[1..] {
            fsm.on_header_packet(*packet, &mut regs);
        }
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);
        assert!(regs.status.error.contains(Status::ERR_ORD));
    }

    #[test]
    fn test_stray_packets_dropped() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        assert_eq!(fsm.on_payload_packet(&mut regs), PayloadEvent::Dropped);
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);
        assert!(regs.status.ready);

        let cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);
        feed(&mut fsm, &mut regs, &cmd);
        assert_eq!(fsm.on_header_packet(0, &mut regs), HeaderEvent::Dropped);
        assert_eq!(fsm.state(), ProtocolState::WaitData);
    }

    #[test]
    fn test_row_progress_counters() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        load_kernel(&mut fsm, &mut regs, 3);

        let cmd = CommandPacket::new(CommandType::Subject, 2, 24, 0x100, 0x1000, 2);
        feed(&mut fsm, &mut regs, &cmd);
        assert_eq!(fsm.packets_left(), 6);
        assert_eq!(fsm.row_packets_left(), 3);

        fsm.on_payload_packet(&mut regs);
        assert_eq!(fsm.packets_left(), 5);
        assert_eq!(fsm.row_packets_left(), 2);

        fsm.on_payload_packet(&mut regs);
        fsm.on_payload_packet(&mut regs);
        assert_eq!(fsm.row_packets_left(), 3);
    }

    #[test]
    fn test_reset_forgets_kernel() {
        let mut fsm = ProtocolFsm::new(limits());
        let mut regs = RegisterSet::new();
        load_kernel(&mut fsm, &mut regs, 3);
        assert_eq!(fsm.kernel_dim(), Some(3));

        fsm.reset();
        assert_eq!(fsm.kernel_dim(), None);
        assert_eq!(fsm.state(), ProtocolState::WaitSkey);
    }
}
