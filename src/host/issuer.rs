//! Command issuer.
//!
//! Builds command headers, streams payload from host memory and checks the
//! acknowledge packets the accelerator writes back. A malformed or
//! mismatching acknowledge is fatal: the link can no longer be trusted.

use thiserror::Error;

use super::{HostPort, MemoryLayout};
use crate::device::host_memory::{HostMemoryError, MemoryInterface};
use crate::device::protocol::{
    AckPacket, CommandPacket, CommandType, Status, HEADER_PACKETS, PACKET_BYTES,
};
use crate::device::registers::PacketRegion;
use crate::emu::AccelError;

/// Largest output address the command word can carry.
pub const MAX_OUT_ADDR: u64 = 1 << 33;

/// Host-side failures.
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error(transparent)]
    Accel(#[from] AccelError),

    #[error("host memory: {0}")]
    Memory(#[from] HostMemoryError),

    #[error("address 0x{0:x} is not 8-byte aligned or out of range")]
    InvalidAddress(u64),

    #[error("protocol fault in transaction {trans_id}: {reason}")]
    ProtocolFault { trans_id: u32, reason: &'static str },
}

impl IssuerError {
    /// Status reported for this failure.
    pub fn status(&self) -> Status {
        Status::ERR_OTHER
    }
}

/// Host command issuer.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    next_id: u32,
    last_cmd: Option<CommandPacket>,
    max_wait_cycles: u64,
}

impl CommandIssuer {
    pub fn new(max_wait_cycles: u64) -> Self {
        Self {
            next_id: 1,
            last_cmd: None,
            max_wait_cycles,
        }
    }

    /// Header of the last command sent.
    pub fn last_cmd(&self) -> Option<&CommandPacket> {
        self.last_cmd.as_ref()
    }

    /// Transaction id the next command will use.
    pub fn next_trans_id(&self) -> u32 {
        self.next_id
    }

    fn take_trans_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Transmit the four header packets of `cmd`.
    pub fn send_header<P: HostPort>(
        &mut self,
        port: &mut P,
        cmd: &CommandPacket,
    ) -> Result<(), IssuerError> {
        log::debug!("Sending {}", cmd);
        for (i, packet) in cmd.to_packets().iter().enumerate() {
            port.transmit(PacketRegion::Command.address(i as u64), *packet)?;
        }
        self.last_cmd = Some(*cmd);
        Ok(())
    }

    /// Stream `packets` payload packets read from host memory at `in_addr`.
    pub fn stream_payload<P: HostPort>(
        &mut self,
        port: &mut P,
        in_addr: u64,
        packets: u32,
    ) -> Result<(), IssuerError> {
        for n in 0..packets as u64 {
            let packet = port
                .memory_mut()
                .read_word(in_addr + n * PACKET_BYTES as u64)?;
            port.transmit(PacketRegion::Payload.address(n), packet)?;
        }
        Ok(())
    }

    /// Run one complete transaction and return the final acknowledge status.
    ///
    /// The header acknowledge is checked first. Payload is always streamed;
    /// the accelerator discards it when the header was rejected, in which
    /// case the header status is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn send_cmd<P: HostPort>(
        &mut self,
        port: &mut P,
        cmd_type: CommandType,
        rows: u16,
        cols: u16,
        tx_addr: u32,
        out_addr: u64,
        in_addr: u64,
    ) -> Result<Status, IssuerError> {
        if out_addr % PACKET_BYTES as u64 != 0 || out_addr >= MAX_OUT_ADDR {
            return Err(IssuerError::InvalidAddress(out_addr));
        }
        if in_addr % PACKET_BYTES as u64 != 0 {
            return Err(IssuerError::InvalidAddress(in_addr));
        }

        let trans_id = self.take_trans_id();
        let cmd = CommandPacket::new(cmd_type, rows, cols, tx_addr, out_addr, trans_id);
        self.send_header(port, &cmd)?;

        port.wait_for_interrupt(self.max_wait_cycles)?;
        let header = self.verify_ack(port, tx_addr)?;
        if !header.status.is_ok() {
            log::warn!("{} rejected: {}", cmd, header.status);
        }

        self.stream_payload(port, in_addr, cmd.payload_packets())?;
        if !header.status.is_ok() {
            return Ok(header.status);
        }

        port.wait_for_interrupt(self.max_wait_cycles)?;
        let done = self.verify_ack(port, tx_addr)?;
        log::info!("{} completed: {}", cmd, done.status);
        Ok(done.status)
    }

    /// Read and check the acknowledge at `tx_addr` against the last command.
    pub fn verify_ack<P: HostPort>(
        &self,
        port: &mut P,
        tx_addr: u32,
    ) -> Result<AckPacket, IssuerError> {
        let mut packets = [0u64; HEADER_PACKETS];
        for (i, packet) in packets.iter_mut().enumerate() {
            *packet = port
                .memory_mut()
                .read_word(tx_addr as u64 + (i * PACKET_BYTES) as u64)?;
        }
        let ack = AckPacket::from_packets(packets);

        let Some(cmd) = self.last_cmd.as_ref() else {
            return Err(IssuerError::ProtocolFault {
                trans_id: ack.trans_id,
                reason: "acknowledge without a command",
            });
        };
        if !ack.checksum_ok() {
            return Err(IssuerError::ProtocolFault {
                trans_id: cmd.trans_id,
                reason: "acknowledge checksum mismatch",
            });
        }
        if !ack.matches(cmd) {
            return Err(IssuerError::ProtocolFault {
                trans_id: cmd.trans_id,
                reason: "acknowledge does not match command",
            });
        }

        log::trace!("Ack #{}: {}", ack.trans_id, ack.status);
        Ok(ack)
    }
}

impl Default for CommandIssuer {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

/// Load the kernel, then convolve the subject. Both must already be staged
/// in host memory at the layout's addresses. Stops at the first non-OK
/// status and returns it.
pub fn run_convolution<P: HostPort>(
    port: &mut P,
    issuer: &mut CommandIssuer,
    layout: &MemoryLayout,
    kernel_dim: u16,
) -> Result<Status, IssuerError> {
    let status = issuer.send_cmd(
        port,
        CommandType::Kernel,
        kernel_dim,
        kernel_dim,
        layout.ack_addr,
        0,
        layout.kernel_addr,
    )?;
    if !status.is_ok() {
        return Ok(status);
    }

    issuer.send_cmd(
        port,
        CommandType::Subject,
        layout.rows,
        layout.cols,
        layout.ack_addr,
        layout.output_addr,
        layout.subject_addr,
    )
}
