//! matconv-emu library
//!
//! Cycle-level model of a matrix convolution accelerator and the host
//! driver that feeds it.

pub mod config;
pub mod device;
pub mod emu;
pub mod host;
