//! Clocked model of the convolution accelerator.
//!
//! Every component splits a clock cycle into an evaluate step, which reads
//! the current register outputs and assigns next values, and an `update`
//! at the clock edge that commits them. Components are stepped in pipeline
//! order within one tick, then all are updated.
//!
//! # Architecture
//!
//! ```text
//!   Engine ──► Accelerator ──► Cluster 0 ──► Core 0 .. Core N
//!                         └──► Cluster 1 ──► Core 0 .. Core N
//! ```
//!
//! # Example
//!
//! ```
//! use matconv_emu::config::AcceleratorConfig;
//! use matconv_emu::emu::Engine;
//! use matconv_emu::host::{run_convolution, CommandIssuer, HostPort, MemoryLayout};
//!
//! let layout = MemoryLayout::new(8, 16);
//! let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
//! engine.memory_mut().write_bytes(layout.kernel_addr, &[0, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap();
//! engine.memory_mut().write_bytes(layout.subject_addr, &[5; 128]).unwrap();
//!
//! let mut issuer = CommandIssuer::default();
//! let status = run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
//! assert!(status.is_ok());
//! ```

pub mod clock;
pub mod cluster;
pub mod controller;
pub mod core;
pub mod engine;

pub use clock::{Clocked, Register};
pub use cluster::{Cluster, ClusterStats, ClusterUnit};
pub use controller::{AccelError, Accelerator, AcceleratorStats, ConvolutionController, DataPhase};
pub use core::{ComputeCore, Core, RowJob};
pub use engine::{Engine, EngineStats, EngineStatus};
