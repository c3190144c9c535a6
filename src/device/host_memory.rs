//! Simulated host memory shared between the CPU and the accelerator.
//!
//! The host keeps the subject matrix, the kernel, the output image and the
//! acknowledge packets in one flat byte-addressed memory. The accelerator
//! only ever sees it through [`MemoryInterface`], which moves whole 64-bit
//! words.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Host Memory                 │
//! │  subject │ kernel │ output │ ack         │
//! └────▲─────────────────▲──────────▲────────┘
//!      │ read_bytes      │ write_word (output, ack)
//!      │ (issuer)        │
//! ┌────┴─────┐     ┌─────┴──────────┴───────┐
//! │  Issuer  │────►│      Accelerator        │
//! └──────────┘ bus └─────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use matconv_emu::device::{HostMemory, MemoryInterface};
//!
//! let mut mem = HostMemory::with_limit(0x1_0000);
//! mem.allocate_region("output", 0x8000, 0x1000).unwrap();
//!
//! mem.write_word(0x8000, 0x1122_3344_5566_7788).unwrap();
//! assert_eq!(mem.read_word(0x8000).unwrap(), 0x1122_3344_5566_7788);
//!
//! // Past the end of memory is an error, never a panic.
//! assert!(mem.read_word(0x1_0000).is_err());
//! ```

use std::collections::BTreeMap;

/// Word-granular access used by the accelerator.
///
/// Addresses are byte offsets; implementations align them down to the
/// 8-byte word that contains them.
pub trait MemoryInterface {
    /// Read the 64-bit little-endian word at `addr`.
    fn read_word(&mut self, addr: u64) -> Result<u64, HostMemoryError>;

    /// Write the 64-bit little-endian word at `addr`.
    fn write_word(&mut self, addr: u64, data: u64) -> Result<(), HostMemoryError>;
}

/// A named memory region for debugging and tracking.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Human-readable name (e.g., "subject", "output", "ack")
    pub name: String,
    /// Base address in host address space
    pub base_address: u64,
    /// Size in bytes
    pub size: usize,
    /// Number of bytes written by the host
    pub bytes_written: usize,
    /// Number of bytes read by the host
    pub bytes_read: usize,
    /// Number of word reads issued by the accelerator
    pub word_reads: u64,
    /// Number of word writes issued by the accelerator
    pub word_writes: u64,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub fn new(name: impl Into<String>, base_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            bytes_written: 0,
            bytes_read: 0,
            word_reads: 0,
            word_writes: 0,
        }
    }

    /// Check if an address falls within this region.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address + self.size as u64
    }

    /// Check if an address range overlaps this region.
    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        let region_end = self.base_address.saturating_add(self.size as u64);
        addr < region_end && end > self.base_address
    }
}

/// Error type for host memory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMemoryError {
    /// Address is beyond the end of memory
    AddressNotMapped(u64),
    /// Region overlap on allocation
    RegionOverlap { new_base: u64, existing_name: String },
}

impl std::fmt::Display for HostMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressNotMapped(addr) => write!(f, "Address 0x{:016x} not mapped", addr),
            Self::RegionOverlap { new_base, existing_name } => {
                write!(f, "Region at 0x{:016x} overlaps with '{}'", new_base, existing_name)
            }
        }
    }
}

impl std::error::Error for HostMemoryError {}

/// Simulated host memory.
///
/// Uses sparse storage (BTreeMap) so that a large configured memory only
/// costs the pages that are actually touched. Memory is allocated in 4KB
/// pages and unwritten bytes read as zero.
pub struct HostMemory {
    /// Sparse storage: page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,

    /// First invalid byte address
    limit: u64,

    /// Named regions for debugging and tracking
    regions: Vec<MemoryRegion>,

    /// Statistics
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl HostMemory {
    /// Page size for sparse storage (4KB, matching typical OS page size)
    pub const PAGE_SIZE: usize = 4096;

    /// Page address mask (lower 12 bits are offset)
    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    /// Bus word width in bytes.
    pub const WORD_BYTES: u64 = 8;

    /// Create an unbounded host memory.
    pub fn new() -> Self {
        Self::with_limit(u64::MAX)
    }

    /// Create a host memory of `limit` bytes. Accesses at or past `limit`
    /// fail with [`HostMemoryError::AddressNotMapped`].
    pub fn with_limit(limit: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            limit,
            regions: Vec::new(),
            total_bytes_written: 0,
            total_bytes_read: 0,
        }
    }

    /// Allocate a named memory region.
    ///
    /// This doesn't actually allocate memory (pages are allocated on demand),
    /// but registers the region for debugging and tracking.
    pub fn allocate_region(
        &mut self,
        name: impl Into<String>,
        base_address: u64,
        size: usize,
    ) -> Result<(), HostMemoryError> {
        let name = name.into();

        self.check_range(base_address, size)?;
        for existing in &self.regions {
            if existing.overlaps(base_address, size) {
                return Err(HostMemoryError::RegionOverlap {
                    new_base: base_address,
                    existing_name: existing.name.clone(),
                });
            }
        }

        self.regions.push(MemoryRegion::new(name, base_address, size));
        Ok(())
    }

    /// Get a region by name.
    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Get all regions.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<(), HostMemoryError> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(HostMemoryError::AddressNotMapped(addr)),
        }
    }

    /// Get or create a page for the given address.
    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages
            .entry(page_addr)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    /// Get a page for reading, if it exists.
    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages.get(&page_addr).map(|b| b.as_ref())
    }

    /// Write a byte slice to memory.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), HostMemoryError> {
        self.check_range(addr, data.len())?;

        let mut current_addr = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self.get_or_create_page(current_addr);
            let offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let space_in_page = Self::PAGE_SIZE - offset;
            let to_write = remaining.len().min(space_in_page);

            page[offset..offset + to_write].copy_from_slice(&remaining[..to_write]);

            current_addr += to_write as u64;
            remaining = &remaining[to_write..];
        }

        self.total_bytes_written += data.len() as u64;
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, data.len())) {
            region.bytes_written += data.len();
        }
        Ok(())
    }

    /// Read bytes from memory into a buffer.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), HostMemoryError> {
        self.check_range(addr, buf.len())?;

        let mut current_addr = addr;
        let mut offset_in_buf = 0;

        while offset_in_buf < buf.len() {
            let page_offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let space_in_page = Self::PAGE_SIZE - page_offset;
            let remaining = buf.len() - offset_in_buf;
            let to_read = remaining.min(space_in_page);

            if let Some(page) = self.get_page(current_addr) {
                buf[offset_in_buf..offset_in_buf + to_read]
                    .copy_from_slice(&page[page_offset..page_offset + to_read]);
            } else {
                // Unallocated pages read as zero
                buf[offset_in_buf..offset_in_buf + to_read].fill(0);
            }

            current_addr += to_read as u64;
            offset_in_buf += to_read;
        }

        Ok(())
    }

    /// Read `len` bytes into a new vector, counting them against the
    /// region they belong to.
    pub fn read_vec(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, HostMemoryError> {
        let mut out = vec![0u8; len];
        self.read_bytes(addr, &mut out)?;

        self.total_bytes_read += len as u64;
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.bytes_read += len;
        }
        Ok(out)
    }

    /// Get total bytes written.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Get total bytes read.
    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Get number of allocated pages.
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Get total allocated memory in bytes.
    pub fn allocated_bytes(&self) -> usize {
        self.pages.len() * Self::PAGE_SIZE
    }

    /// Hexdump a memory range for debugging.
    pub fn hexdump(&self, addr: u64, len: usize) -> String {
        let mut result = String::new();
        let mut buf = vec![0u8; len];
        if self.read_bytes(addr, &mut buf).is_err() {
            return format!("{:016x}: <not mapped>\n", addr);
        }

        for (i, chunk) in buf.chunks(16).enumerate() {
            let line_addr = addr + (i * 16) as u64;
            result.push_str(&format!("{:016x}: ", line_addr));

            for (j, byte) in chunk.iter().enumerate() {
                if j == 8 {
                    result.push(' ');
                }
                result.push_str(&format!("{:02x} ", byte));
            }

            // Padding for short lines
            for j in chunk.len()..16 {
                if j == 8 {
                    result.push(' ');
                }
                result.push_str("   ");
            }

            result.push_str(" |");
            for byte in chunk {
                let c = if *byte >= 0x20 && *byte < 0x7f {
                    *byte as char
                } else {
                    '.'
                };
                result.push(c);
            }
            result.push_str("|\n");
        }

        result
    }
}

impl MemoryInterface for HostMemory {
    fn read_word(&mut self, addr: u64) -> Result<u64, HostMemoryError> {
        let aligned = addr & !(Self::WORD_BYTES - 1);
        let mut buf = [0u8; 8];
        self.read_bytes(aligned, &mut buf)?;

        if let Some(region) = self.regions.iter_mut().find(|r| r.contains(aligned)) {
            region.word_reads += 1;
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn write_word(&mut self, addr: u64, data: u64) -> Result<(), HostMemoryError> {
        let aligned = addr & !(Self::WORD_BYTES - 1);
        self.write_bytes(aligned, &data.to_le_bytes())?;

        if let Some(region) = self.regions.iter_mut().find(|r| r.contains(aligned)) {
            region.word_writes += 1;
        }
        Ok(())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("limit", &self.limit)
            .field("allocated_pages", &self.pages.len())
            .field("regions", &self.regions.len())
            .field("total_bytes_written", &self.total_bytes_written)
            .field("total_bytes_read", &self.total_bytes_read)
            .finish()
    }
}
