//! Byte matrices on disk and in host memory.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use rand::Rng;

use crate::device::host_memory::{HostMemory, HostMemoryError};

/// Row-major matrix of unsigned bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    /// Build a matrix from raw bytes, zero padding or truncating to size.
    pub fn from_bytes(rows: usize, cols: usize, bytes: &[u8]) -> Self {
        let mut data = bytes.to_vec();
        data.resize(rows * cols, 0);
        Self { rows, cols, data }
    }

    /// Load a raw matrix file.
    pub fn load(path: impl AsRef<Path>, rows: usize, cols: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let expected = rows * cols;

        if bytes.len() < expected {
            log::warn!(
                "{}: {} bytes, padding to {}",
                path.display(),
                bytes.len(),
                expected
            );
        } else if bytes.len() > expected {
            log::warn!(
                "{}: {} bytes, truncating to {}",
                path.display(),
                bytes.len(),
                expected
            );
        }
        Ok(Self::from_bytes(rows, cols, &bytes))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        fs::write(path, &self.data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    /// Fill with random bytes.
    pub fn randomize<R: Rng>(&mut self, rng: &mut R) {
        rng.fill(self.data.as_mut_slice());
    }

    /// Copy the matrix into host memory at `addr`.
    pub fn store(&self, mem: &mut HostMemory, addr: u64) -> Result<(), HostMemoryError> {
        mem.write_bytes(addr, &self.data)
    }

    /// Read a `rows` x `cols` matrix from host memory at `addr`.
    pub fn fetch(
        mem: &mut HostMemory,
        addr: u64,
        rows: usize,
        cols: usize,
    ) -> Result<Self, HostMemoryError> {
        let data = mem.read_vec(addr, rows * cols)?;
        Ok(Self { rows, cols, data })
    }

    /// Hex preview of the top-left `max_rows` x `max_cols` block.
    pub fn preview(&self, max_rows: usize, max_cols: usize) -> String {
        let mut out = String::new();
        for r in 0..self.rows.min(max_rows) {
            for c in 0..self.cols.min(max_cols) {
                let _ = write!(out, "{:02x} ", self.get(r, c));
            }
            if self.cols > max_cols {
                out.push_str("...");
            }
            out.push('\n');
        }
        if self.rows > max_rows {
            out.push_str("...\n");
        }
        out
    }
}
