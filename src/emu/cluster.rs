//! Compute cluster.
//!
//! A cluster owns a contiguous slice of the eight pixel positions in every
//! payload packet (its *groups*), a bank of cores and `kern_dim - 1`
//! subresult memories. Every subject packet produces one job per
//! (group, kernel row); row `k`'s job starts from the partial sum that row
//! `k - 1` left for the same column position one subject row earlier.
//!
//! ```text
//!                   dispatch buffer
//!   ┌──────── carry (K-1) ────────┬──────── packet (8) ────────┐
//!   │ tail of previous packet     │ b0 b1 b2 b3 b4 b5 b6 b7    │
//!   └─────────────────────────────┴────────────────────────────┘
//!     group g window = dispatch[g .. g+K]
//!
//!   row K-1 ──► output byte         mem[k] : partial sums of rows 0..=k
//!   row k   ──► mem[k]  (k < K-1)   read as carry by row k+1
//! ```
//!
//! Pipeline per tick: collect the results the cores committed at the last
//! edge, step the cores, then dispatch the packet latched at the last edge.
//! Collection runs before dispatch, so a partial sum produced for the
//! previous packet is in memory when the next packet reads it.

use smallvec::SmallVec;

use super::clock::{Clocked, Register};
use super::core::{ComputeCore, Core, RowJob};
use crate::config::ConfigError;
use crate::device::protocol::{CommandType, PACKET_BYTES};
use crate::device::registers::PacketRegion;

/// Output bytes of one cluster for one packet.
pub type GroupBytes = SmallVec<[u8; PACKET_BYTES]>;

/// Capability interface of a compute cluster.
pub trait ClusterUnit: Clocked {
    /// Latch the command type and shape and start tapping the bus.
    fn activate(&mut self, cmd_type: CommandType, rows: u16, cols: u16);

    /// Stop tapping the bus.
    fn disable(&mut self);

    /// Latch a bus packet for dispatch on the next tick. Ignored unless the
    /// cluster is enabled and the address is in the payload region.
    fn receive_packet(&mut self, addr: u64, packet: u64);

    /// Copy the latest finished group bytes into `out` at this cluster's
    /// group positions. Returns false if no result set is available.
    fn get_results(&self, out: &mut [u8]) -> bool;

    /// Evaluate one tick.
    fn step(&mut self);

    /// True when no packet or job is in flight.
    fn is_idle(&self) -> bool;

    fn reset(&mut self);
}

/// Cluster counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub packets: u64,
    pub kernel_packets: u64,
    pub jobs: u64,
    pub result_sets: u64,
}

/// Registered cluster implementation.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub index: usize,
    start_group: usize,
    n_groups: usize,
    max_kernel_dim: usize,
    cores: Vec<Core>,

    enabled: bool,
    mode: Option<CommandType>,
    kern_dim: usize,

    kernel: Vec<u8>,
    kernel_cursor: usize,
    dispatch: Vec<u8>,
    subresults: Vec<Vec<u32>>,
    col_packet: usize,
    row_packets: usize,

    packet: Register<Option<u64>>,
    dispatch_tag: Register<Option<usize>>,
    compute_tag: Register<Option<usize>>,
    results: Register<Option<GroupBytes>>,

    pub stats: ClusterStats,
}

impl Cluster {
    /// Create a cluster owning groups `start_group..start_group + n_groups`.
    ///
    /// `n_cores` must be at least `n_groups * max_kernel_dim`.
    pub fn new(
        index: usize,
        start_group: usize,
        n_groups: usize,
        n_cores: usize,
        max_kernel_dim: usize,
    ) -> Result<Self, ConfigError> {
        if start_group + n_groups > PACKET_BYTES {
            return Err(ConfigError::GroupRange {
                start: start_group,
                end: start_group + n_groups,
            });
        }
        let needed = n_groups * max_kernel_dim;
        if n_cores < needed {
            return Err(ConfigError::NotEnoughCores {
                needed,
                got: n_cores,
            });
        }

        let kernel_capacity = (max_kernel_dim * max_kernel_dim).div_ceil(PACKET_BYTES) * PACKET_BYTES;

        Ok(Self {
            index,
            start_group,
            n_groups,
            max_kernel_dim,
            cores: (0..n_cores).map(Core::new).collect(),
            enabled: false,
            mode: None,
            kern_dim: 0,
            kernel: vec![0; kernel_capacity],
            kernel_cursor: 0,
            dispatch: vec![0; max_kernel_dim.saturating_sub(1) + PACKET_BYTES],
            subresults: Vec::new(),
            col_packet: 0,
            row_packets: 1,
            packet: Register::new(None),
            dispatch_tag: Register::new(None),
            compute_tag: Register::new(None),
            results: Register::new(None),
            stats: ClusterStats::default(),
        })
    }

    pub fn start_group(&self) -> usize {
        self.start_group
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn kernel_dim(&self) -> usize {
        self.kern_dim
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Kernel bytes loaded so far (row-major).
    pub fn kernel(&self) -> &[u8] {
        &self.kernel[..self.kern_dim * self.kern_dim]
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Core assigned to kernel row `row` of local group `gi`.
    #[inline]
    fn core_index(&self, gi: usize, row: usize) -> usize {
        gi * self.kern_dim + (self.kern_dim - 1 - row)
    }

    fn collect(&mut self) {
        let Some(base) = *self.compute_tag.output() else {
            self.results.assign(None);
            return;
        };

        let k = self.kern_dim;
        let mut finished: GroupBytes = SmallVec::from_elem(0, self.n_groups);
        let mut valid = false;

        for gi in 0..self.n_groups {
            for row in (0..k).rev() {
                let core = self.core_index(gi, row);
                let Some(value) = self.cores[core].get_row_result() else {
                    continue;
                };

                if row == k - 1 {
                    // Low byte of the finished sum
                    finished[gi] = value as u8;
                    valid = true;
                } else {
                    self.subresults[row][base + gi] = value;
                }
            }
        }

        if valid {
            self.stats.result_sets += 1;
            self.results.assign(Some(finished));
        } else {
            self.results.assign(None);
        }
    }

    fn load_kernel_packet(&mut self, packet: u64) {
        let end = self.kernel_cursor + PACKET_BYTES;
        if end > self.kernel.len() {
            log::warn!("cluster {}: kernel buffer full, packet dropped", self.index);
            return;
        }
        self.kernel[self.kernel_cursor..end].copy_from_slice(&packet.to_le_bytes());
        self.kernel_cursor = end;
        self.stats.kernel_packets += 1;
    }

    /// Dispatch one subject packet. Returns the subresult base position of
    /// the packet's column.
    fn dispatch_subject(&mut self, packet: u64) -> usize {
        let k = self.kern_dim;
        let carry_len = k - 1;
        self.dispatch[carry_len..carry_len + PACKET_BYTES].copy_from_slice(&packet.to_le_bytes());

        let base = self.col_packet * self.n_groups;
        for gi in 0..self.n_groups {
            let g = self.start_group + gi;

            // Descending rows: row k reads mem[k-1] before row k-1 of this
            // packet can produce its replacement.
            for row in (0..k).rev() {
                let carry = if row == 0 {
                    0
                } else {
                    self.subresults[row - 1][base + gi]
                };
                let job = RowJob {
                    carry,
                    kernel_row: self.kernel[row * k..(row + 1) * k].iter().copied().collect(),
                    pixels: self.dispatch[g..g + k].iter().copied().collect(),
                };
                let core = self.core_index(gi, row);
                self.cores[core].dispatch(job);
                self.stats.jobs += 1;
            }
        }

        // Seed the next packet's window with this packet's tail
        self.dispatch.copy_within(PACKET_BYTES..PACKET_BYTES + carry_len, 0);
        self.col_packet = (self.col_packet + 1) % self.row_packets;
        base
    }
}

impl ClusterUnit for Cluster {
    fn activate(&mut self, cmd_type: CommandType, rows: u16, cols: u16) {
        log::debug!("cluster {}: activate {} {}x{}", self.index, cmd_type, rows, cols);
        self.enabled = true;
        self.mode = Some(cmd_type);

        match cmd_type {
            CommandType::Kernel => {
                self.kern_dim = (rows as usize).min(self.max_kernel_dim);
                self.kernel.fill(0);
                self.kernel_cursor = 0;
            }
            CommandType::Subject => {
                self.row_packets = (cols as usize / PACKET_BYTES).max(1);
                self.col_packet = 0;
                self.dispatch.fill(0);
                let positions = self.row_packets * self.n_groups;
                self.subresults = vec![vec![0; positions]; self.kern_dim.saturating_sub(1)];
            }
        }
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn receive_packet(&mut self, addr: u64, packet: u64) {
        if self.enabled && PacketRegion::classify(addr) == PacketRegion::Payload {
            self.packet.assign(Some(packet));
        }
    }

    fn get_results(&self, out: &mut [u8]) -> bool {
        match self.results.output() {
            Some(bytes) => {
                let end = (self.start_group + bytes.len()).min(out.len());
                out[self.start_group..end].copy_from_slice(&bytes[..end - self.start_group]);
                true
            }
            None => false,
        }
    }

    fn step(&mut self) {
        self.collect();
        self.compute_tag.assign(*self.dispatch_tag.output());

        for core in &mut self.cores {
            core.step();
        }

        let mut tag = None;
        if let Some(packet) = *self.packet.output() {
            self.stats.packets += 1;
            match self.mode {
                Some(CommandType::Kernel) => self.load_kernel_packet(packet),
                Some(CommandType::Subject) if self.kern_dim > 0 => {
                    tag = Some(self.dispatch_subject(packet));
                }
                _ => log::warn!("cluster {}: packet without a usable mode", self.index),
            }
        }
        self.dispatch_tag.assign(tag);
        self.packet.assign(None);
    }

    fn is_idle(&self) -> bool {
        self.packet.output().is_none()
            && !self.packet.has_pending()
            && self.dispatch_tag.output().is_none()
            && self.compute_tag.output().is_none()
    }

    fn reset(&mut self) {
        self.enabled = false;
        self.mode = None;
        self.kern_dim = 0;
        self.kernel.fill(0);
        self.kernel_cursor = 0;
        self.dispatch.fill(0);
        self.subresults.clear();
        self.col_packet = 0;
        self.row_packets = 1;
        self.packet.force(None);
        self.dispatch_tag.force(None);
        self.compute_tag.force(None);
        self.results.force(None);
        self.stats = ClusterStats::default();

        for core in &mut self.cores {
            core.reset();
        }
    }
}

impl Clocked for Cluster {
    fn update(&mut self) {
        self.packet.update();
        self.dispatch_tag.update();
        self.compute_tag.update();
        self.results.update();
        for core in &mut self.cores {
            core.update();
        }
    }
}
