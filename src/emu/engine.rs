//! Emulation engine.
//!
//! The engine owns the accelerator and the host memory it writes into, and
//! drives the compute clock. Every bus packet the host transmits is followed
//! by a fixed number of compute ticks, so the accelerator sees a packet at
//! most once every `compute_ticks_per_packet` cycles.
//!
//! # Usage
//!
//! ```
//! use matconv_emu::config::AcceleratorConfig;
//! use matconv_emu::emu::Engine;
//!
//! let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
//! engine.step();      // one compute tick
//! engine.run(100);    // run for 100 ticks
//! assert_eq!(engine.total_cycles, 101);
//! ```

use super::controller::{AccelError, Accelerator, ConvolutionController};
use crate::config::AcceleratorConfig;
use crate::device::host_memory::HostMemory;
use crate::host::HostPort;

/// Engine execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Accelerator waiting for a command.
    Idle,
    /// Transaction in progress.
    Busy,
    /// Interrupt raised and not yet taken by the host.
    Interrupt,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub cycles: u64,
    pub bus_packets: u64,
    pub interrupts: u64,
    pub acks_written: u64,
    pub words_written: u64,
    pub dropped_packets: u64,
    pub core_jobs: u64,
}

/// Main emulation engine.
pub struct Engine {
    /// Accelerator being emulated.
    pub accel: Accelerator,
    /// Host memory shared with the accelerator.
    pub memory: HostMemory,
    /// Current engine status.
    pub status: EngineStatus,
    /// Total cycles executed.
    pub total_cycles: u64,
    /// Bus packets transmitted since reset.
    pub bus_packets: u64,
    interrupts: u64,
    interrupt_pending: bool,
}

impl Engine {
    /// Create an engine with unbounded host memory.
    pub fn new(config: AcceleratorConfig) -> Result<Self, AccelError> {
        Self::with_memory(config, HostMemory::new())
    }

    /// Create an engine around an existing host memory.
    pub fn with_memory(config: AcceleratorConfig, memory: HostMemory) -> Result<Self, AccelError> {
        Ok(Self {
            accel: Accelerator::new(config)?,
            memory,
            status: EngineStatus::Idle,
            total_cycles: 0,
            bus_packets: 0,
            interrupts: 0,
            interrupt_pending: false,
        })
    }

    pub fn config(&self) -> &AcceleratorConfig {
        self.accel.config()
    }

    /// Reset the accelerator. Host memory is kept.
    pub fn reset(&mut self) {
        self.accel.reset();
        self.status = EngineStatus::Idle;
        self.total_cycles = 0;
        self.bus_packets = 0;
        self.interrupts = 0;
        self.interrupt_pending = false;
    }

    /// Execute one compute tick.
    pub fn step(&mut self) {
        self.accel.tick(&mut self.memory);
        self.total_cycles += 1;

        if self.accel.take_interrupt() {
            self.interrupt_pending = true;
            self.interrupts += 1;
        }

        self.status = if self.interrupt_pending {
            EngineStatus::Interrupt
        } else if self.accel.registers().status.busy {
            EngineStatus::Busy
        } else {
            EngineStatus::Idle
        };
    }

    /// Run for `cycles` ticks.
    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    /// Snapshot of the engine and accelerator counters.
    pub fn stats(&self) -> EngineStats {
        let accel = &self.accel.stats;
        EngineStats {
            cycles: self.total_cycles,
            bus_packets: self.bus_packets,
            interrupts: self.interrupts,
            acks_written: accel.acks_written,
            words_written: accel.words_written,
            dropped_packets: accel.dropped_packets,
            core_jobs: self.accel.core_jobs(),
        }
    }

    /// Readable state register.
    pub fn state_word(&self) -> u32 {
        self.accel.state_word()
    }
}

impl HostPort for Engine {
    fn transmit(&mut self, addr: u64, packet: u64) -> Result<(), AccelError> {
        self.accel.push_packet(addr, packet)?;
        self.bus_packets += 1;
        let ticks = self.config().compute_ticks_per_packet;
        self.run(ticks as u64);
        Ok(())
    }

    fn memory(&self) -> &HostMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut HostMemory {
        &mut self.memory
    }

    fn take_interrupt(&mut self) -> bool {
        let pending = std::mem::take(&mut self.interrupt_pending);
        if pending && self.status == EngineStatus::Interrupt {
            self.status = if self.accel.registers().status.busy {
                EngineStatus::Busy
            } else {
                EngineStatus::Idle
            };
        }
        pending
    }

    fn wait_for_interrupt(&mut self, max_cycles: u64) -> Result<u64, AccelError> {
        let mut waited = 0;
        while !self.take_interrupt() {
            if waited >= max_cycles {
                log::warn!("No interrupt after {} cycles (state {:08x})", waited, self.state_word());
                return Err(AccelError::Timeout { cycles: waited });
            }
            self.step();
            waited += 1;
        }
        Ok(waited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::protocol::{CommandPacket, CommandType};
    use crate::device::registers::PacketRegion;

    fn send_header(engine: &mut Engine, cmd: &CommandPacket) {
        for (i, packet) in cmd.to_packets().iter().enumerate() {
            engine
                .transmit(PacketRegion::Command.address(i as u64), *packet)
                .unwrap();
        }
    }

    #[test]
    fn test_engine_creation() {
        let engine = Engine::new(AcceleratorConfig::default()).unwrap();
        assert_eq!(engine.status, EngineStatus::Idle);
        assert_eq!(engine.total_cycles, 0);
        assert_eq!(engine.accel.clusters().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AcceleratorConfig {
            n_clusters: 3,
            ..AcceleratorConfig::default()
        };
        assert!(matches!(Engine::new(config), Err(AccelError::Config(_))));
    }

    #[test]
    fn test_transmit_runs_ticks() {
        let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
        engine.transmit(0x20, 0).unwrap();
        assert_eq!(engine.total_cycles, 4);
        assert_eq!(engine.bus_packets, 1);
        assert_eq!(engine.stats().dropped_packets, 1);
    }

    #[test]
    fn test_header_raises_interrupt() {
        let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
        let cmd = CommandPacket::new(CommandType::Kernel, 3, 3, 0x100, 0, 1);
        send_header(&mut engine, &cmd);

        assert_eq!(engine.status, EngineStatus::Interrupt);
        assert_eq!(engine.wait_for_interrupt(10).unwrap(), 0);
        assert_eq!(engine.status, EngineStatus::Busy);
        assert!(!engine.take_interrupt());
    }

    #[test]
    fn test_wait_times_out() {
        let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
        assert_eq!(
            engine.wait_for_interrupt(50),
            Err(AccelError::Timeout { cycles: 50 })
        );
        assert_eq!(engine.total_cycles, 50);
    }

    #[test]
    fn test_reset_keeps_memory() {
        let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
        engine.memory.write_bytes(0x40, &[1, 2, 3]).unwrap();
        engine.run(10);

        engine.reset();
        assert_eq!(engine.total_cycles, 0);
        assert_eq!(engine.status, EngineStatus::Idle);
        assert_eq!(engine.memory.read_vec(0x40, 3).unwrap(), vec![1, 2, 3]);
    }
}
