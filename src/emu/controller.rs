//! Top-level convolution controller.
//!
//! The controller owns the protocol state machine, the register set, the
//! bus input FIFO and the clusters. Header packets drive the handshake;
//! payload packets accepted in `WAIT_DATA` are broadcast to every cluster.
//! Finished group bytes are reassembled into output words and written to
//! host memory.
//!
//! ```text
//!  bus ──► FIFO ──► classify ──► CMD ────► ProtocolFsm ──► ack ──► memory
//!                        │
//!                        └─────► PAYLOAD ─► cluster 0 ─┐
//!                                         ► cluster 1 ─┼─► results buffer ──► memory
//!                                         ► ...       ─┘
//! ```
//!
//! # Output reassembly
//!
//! Group `g` of subject packet `(row r, column packet p)` is the output
//! pixel at `(r - h, 8p + g - h)` with `h = kernel_dim / 2`. The group bytes
//! are dropped into a 16-byte rolling buffer at offset `8 - h`, so the first
//! eight bytes always hold one complete, aligned output word. The output
//! cursor therefore runs one word behind the input and starts at `(-h, -8)`;
//! negative positions are discarded. Border pixels (within `h` of any edge)
//! are written as zero.

use std::collections::VecDeque;

use thiserror::Error;

use super::clock::Clocked;
use super::cluster::{Cluster, ClusterUnit};
use crate::config::{AcceleratorConfig, ConfigError};
use crate::device::fsm::{HeaderEvent, PayloadEvent, ProtocolFsm, ProtocolState, SizeLimits};
use crate::device::host_memory::MemoryInterface;
use crate::device::protocol::{AckPacket, CommandType, Status, PACKET_BYTES};
use crate::device::registers::{PacketRegion, RegisterSet};

/// Errors surfaced by the accelerator model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccelError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bus FIFO overflow (depth {depth})")]
    FifoOverflow { depth: usize },

    #[error("no interrupt after {cycles} cycles")]
    Timeout { cycles: u64 },
}

/// Capability interface of the top-level controller.
pub trait ConvolutionController {
    /// Deliver one bus packet into the input FIFO.
    fn push_packet(&mut self, addr: u64, packet: u64) -> Result<(), AccelError>;

    /// Advance the compute clock by one tick.
    fn tick(&mut self, mem: &mut dyn MemoryInterface);

    /// Consume the pending host interrupt, if any.
    fn take_interrupt(&mut self) -> bool;

    fn registers(&self) -> &RegisterSet;

    /// Readable state register.
    fn state_word(&self) -> u32;

    fn reset(&mut self);
}

/// Data phase of the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPhase {
    /// No data phase active.
    Idle,
    /// Accepting payload packets.
    Streaming,
    /// All payload received; waiting for the pipeline to drain.
    Draining,
}

/// Controller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceleratorStats {
    pub ticks: u64,
    pub packets_received: u64,
    pub header_packets: u64,
    pub payload_packets: u64,
    pub dropped_packets: u64,
    pub acks_written: u64,
    pub words_written: u64,
    pub write_errors: u64,
    pub result_sets: u64,
}

/// Output cursor and rolling buffer for one subject transaction.
#[derive(Debug, Clone, Copy, Default)]
struct OutputWindow {
    rows: i32,
    cols: i32,
    half: i32,
    row: i32,
    col: i32,
    addr: u64,
    buffer: [u8; 2 * PACKET_BYTES],
    expected_sets: u64,
    collected_sets: u64,
}

impl OutputWindow {
    fn new(rows: u16, cols: u16, kernel_dim: u16, out_addr: u64, packets: u32) -> Self {
        let half = (kernel_dim >> 1) as i32;
        Self {
            rows: rows as i32,
            cols: cols as i32,
            half,
            row: -half,
            col: -(PACKET_BYTES as i32),
            addr: out_addr,
            buffer: [0; 2 * PACKET_BYTES],
            expected_sets: packets as u64,
            collected_sets: 0,
        }
    }

    /// Drop one packet's group bytes into the rolling buffer.
    fn place(&mut self, groups: &[u8; PACKET_BYTES]) {
        let base = PACKET_BYTES - self.half as usize;
        self.buffer[base..base + PACKET_BYTES].copy_from_slice(groups);
    }

    fn is_border(&self, row: i32, col: i32) -> bool {
        row < self.half
            || row >= self.rows - self.half
            || col < self.half
            || col >= self.cols - self.half
    }

    /// Masked output word at the cursor, if the cursor is on the image.
    fn current_word(&self) -> Option<u64> {
        if self.row < 0 || self.col < 0 || self.row >= self.rows {
            return None;
        }

        let mut word = [0u8; PACKET_BYTES];
        for (j, byte) in word.iter_mut().enumerate() {
            if !self.is_border(self.row, self.col + j as i32) {
                *byte = self.buffer[j];
            }
        }
        Some(u64::from_le_bytes(word))
    }

    /// Shift the buffer by one packet and advance the cursor.
    fn advance(&mut self) {
        self.buffer.copy_within(PACKET_BYTES.., 0);
        self.buffer[PACKET_BYTES..].fill(0);

        self.col += PACKET_BYTES as i32;
        if self.col >= self.cols {
            self.col = 0;
            self.row += 1;
        }
    }

    fn finished(&self) -> bool {
        self.row >= self.rows
    }
}

/// Top-level accelerator model.
#[derive(Debug, Clone)]
pub struct Accelerator {
    config: AcceleratorConfig,
    fsm: ProtocolFsm,
    regs: RegisterSet,
    clusters: Vec<Cluster>,
    fifo: VecDeque<(u64, u64)>,
    /// Ticks left before the next payload packet may reach the clusters.
    payload_holdoff: u32,
    phase: DataPhase,
    window: OutputWindow,
    data_status: Status,
    interrupt: bool,
    pub stats: AcceleratorStats,
}

impl Accelerator {
    /// Build an accelerator from a validated configuration.
    pub fn new(config: AcceleratorConfig) -> Result<Self, AccelError> {
        config.validate()?;

        let groups = config.groups_per_cluster();
        let clusters = (0..config.n_clusters)
            .map(|i| {
                Cluster::new(
                    i,
                    i * groups,
                    groups,
                    config.cores_per_cluster,
                    config.max_kernel_dim as usize,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let limits = SizeLimits {
            max_kernel_dim: config.max_kernel_dim,
            max_subject_cols: config.max_subject_cols,
        };

        Ok(Self {
            config,
            fsm: ProtocolFsm::new(limits),
            regs: RegisterSet::new(),
            clusters,
            fifo: VecDeque::with_capacity(config.fifo_depth),
            payload_holdoff: 0,
            phase: DataPhase::Idle,
            window: OutputWindow::default(),
            data_status: Status::OK,
            interrupt: false,
            stats: AcceleratorStats::default(),
        })
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn protocol_state(&self) -> ProtocolState {
        self.fsm.state()
    }

    pub fn phase(&self) -> DataPhase {
        self.phase
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Packets waiting in the input FIFO.
    pub fn pending_packets(&self) -> usize {
        self.fifo.len()
    }

    /// Row jobs computed by all cores since reset.
    pub fn core_jobs(&self) -> u64 {
        self.clusters
            .iter()
            .flat_map(|c| c.cores())
            .map(|core| core.jobs)
            .sum()
    }

    /// A payload packet at the FIFO head waits until the previous one has
    /// had `compute_ticks_per_packet` ticks, so its subresults are written
    /// before the next row reads them. Header packets are never held.
    fn fifo_head_ready(&self) -> bool {
        match self.fifo.front() {
            Some(&(addr, _)) => {
                PacketRegion::classify(addr) == PacketRegion::Command || self.payload_holdoff == 0
            }
            None => false,
        }
    }

    fn clusters_idle(&self) -> bool {
        self.clusters.iter().all(|c| c.is_idle())
    }

    fn write_ack(&mut self, ack: &AckPacket, mem: &mut dyn MemoryInterface) {
        let base = ack.tx_addr as u64;
        for (i, packet) in ack.to_packets().iter().enumerate() {
            let addr = base + (i * PACKET_BYTES) as u64;
            if let Err(e) = mem.write_word(addr, *packet) {
                log::warn!("Ack write failed: {}", e);
                self.stats.write_errors += 1;
            }
        }

        log::debug!("Ack #{} -> 0x{:x}: {}", ack.trans_id, base, ack.status);
        self.stats.acks_written += 1;
        self.interrupt = true;
    }

    /// Write the oldest output word (masked) and shift the results buffer.
    fn write_results_buffer(&mut self, mem: &mut dyn MemoryInterface) {
        if let Some(word) = self.window.current_word() {
            match mem.write_word(self.window.addr, word) {
                Ok(()) => self.stats.words_written += 1,
                Err(e) => {
                    log::warn!("Output write failed: {}", e);
                    self.stats.write_errors += 1;
                    self.data_status |= Status::ERR_OTHER;
                }
            }
            log::trace!(
                "out ({}, {}) @ 0x{:x} = {:016x}",
                self.window.row,
                self.window.col,
                self.window.addr,
                word
            );
            self.window.addr += PACKET_BYTES as u64;
        }
        self.window.advance();
    }

    fn begin_data(&mut self) {
        let cmd = *self.fsm.command();
        let cmd_type = cmd.cmd_type();

        for cluster in &mut self.clusters {
            cluster.activate(cmd_type, cmd.rows(), cmd.cols());
        }

        if cmd_type == CommandType::Subject {
            let kernel_dim = self.fsm.kernel_dim().unwrap_or(1);
            self.window = OutputWindow::new(
                cmd.rows(),
                cmd.cols(),
                kernel_dim,
                cmd.out_addr(),
                cmd.payload_packets(),
            );
        }

        self.data_status = Status::OK;
        self.phase = DataPhase::Streaming;
        log::info!("Data phase: {}", cmd);
    }

    fn finish_data(&mut self, mem: &mut dyn MemoryInterface) {
        if self.fsm.command().cmd_type() == CommandType::Subject {
            while !self.window.finished() {
                self.write_results_buffer(mem);
            }
        }

        for cluster in &mut self.clusters {
            cluster.disable();
        }

        let ack = self.fsm.finish_data(self.data_status, &mut self.regs);
        self.write_ack(&ack, mem);
        self.phase = DataPhase::Idle;
    }

    fn handle_packet(&mut self, addr: u64, packet: u64, mem: &mut dyn MemoryInterface) {
        self.stats.packets_received += 1;

        match PacketRegion::classify(addr) {
            PacketRegion::Command => {
                self.stats.header_packets += 1;
                match self.fsm.on_header_packet(packet, &mut self.regs) {
                    HeaderEvent::Pending => {}
                    HeaderEvent::Accepted(ack) => {
                        self.write_ack(&ack, mem);
                        self.begin_data();
                    }
                    HeaderEvent::Rejected(ack) => self.write_ack(&ack, mem),
                    HeaderEvent::Dropped => self.stats.dropped_packets += 1,
                }
            }
            PacketRegion::Payload => match self.fsm.on_payload_packet(&mut self.regs) {
                PayloadEvent::Accepted { last } => {
                    self.stats.payload_packets += 1;
                    self.payload_holdoff = self.config.compute_ticks_per_packet;
                    for cluster in &mut self.clusters {
                        cluster.receive_packet(addr, packet);
                    }
                    if last {
                        self.phase = DataPhase::Draining;
                    }
                }
                PayloadEvent::Dropped | PayloadEvent::OutOfOrder => {
                    log::trace!("Dropped payload packet {:016x} @ 0x{:x}", packet, addr);
                    self.stats.dropped_packets += 1;
                }
            },
        }
    }

    fn collect_results(&mut self, mem: &mut dyn MemoryInterface) {
        let mut groups = [0u8; PACKET_BYTES];
        let mut valid = false;
        for cluster in &self.clusters {
            valid |= cluster.get_results(&mut groups);
        }
        if !valid {
            return;
        }

        self.window.place(&groups);
        self.write_results_buffer(mem);
        self.window.collected_sets += 1;
        self.stats.result_sets += 1;
    }
}

impl ConvolutionController for Accelerator {
    fn push_packet(&mut self, addr: u64, packet: u64) -> Result<(), AccelError> {
        if self.fifo.len() >= self.config.fifo_depth {
            return Err(AccelError::FifoOverflow {
                depth: self.config.fifo_depth,
            });
        }
        self.fifo.push_back((addr, packet));
        Ok(())
    }

    fn tick(&mut self, mem: &mut dyn MemoryInterface) {
        self.stats.ticks += 1;
        self.payload_holdoff = self.payload_holdoff.saturating_sub(1);
        let subject = self.fsm.command().cmd_type() == CommandType::Subject;

        if self.phase != DataPhase::Idle && subject {
            self.collect_results(mem);
        }

        if self.phase == DataPhase::Draining {
            let drained = if subject {
                self.window.collected_sets >= self.window.expected_sets
            } else {
                self.clusters_idle()
            };
            if drained {
                self.finish_data(mem);
            }
        }

        for cluster in &mut self.clusters {
            cluster.step();
        }

        if self.phase != DataPhase::Draining && self.fifo_head_ready() {
            if let Some((addr, packet)) = self.fifo.pop_front() {
                self.handle_packet(addr, packet, mem);
            }
        }

        for cluster in &mut self.clusters {
            cluster.update();
        }

        self.regs.status.busy = self.phase != DataPhase::Idle || !self.clusters_idle();
    }

    fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.interrupt)
    }

    fn registers(&self) -> &RegisterSet {
        &self.regs
    }

    fn state_word(&self) -> u32 {
        self.regs
            .state_word(self.fsm.row_packets_left(), self.fsm.packets_left())
    }

    fn reset(&mut self) {
        log::debug!("Accelerator reset");
        self.fsm.reset();
        self.regs.reset();
        for cluster in &mut self.clusters {
            cluster.reset();
        }
        self.fifo.clear();
        self.payload_holdoff = 0;
        self.phase = DataPhase::Idle;
        self.window = OutputWindow::default();
        self.data_status = Status::OK;
        self.interrupt = false;
        self.stats = AcceleratorStats::default();
    }
}
