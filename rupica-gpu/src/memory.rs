// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest physical memory access for the video core.
//!
//! The rasterizer cache only needs byte-span access to contiguous physical
//! regions and a way to toggle write trapping on cached pages, so both are
//! behind a trait; the CPU side provides the real implementation.

use rupica_common::types::PAddr;

/// FCRAM base and size.
pub const FCRAM_PADDR: PAddr = 0x2000_0000;
pub const FCRAM_SIZE: u32 = 0x0800_0000;

/// VRAM base and size.
pub const VRAM_PADDR: PAddr = 0x1800_0000;
pub const VRAM_SIZE: u32 = 0x0060_0000;

/// Guest physical memory as seen by the rasterizer cache.
///
/// A `None` reference means the address does not map to a pixel-capable
/// region; callers skip the access silently.
pub trait GuestMemory {
    /// A read-only span of up to `size` bytes starting at `addr`. The span
    /// may be shorter than requested when the region ends early, and is only
    /// valid for the duration of a single upload/download.
    fn physical_bytes(&self, addr: PAddr, size: u32) -> Option<&[u8]>;

    /// Mutable variant of [`Self::physical_bytes`].
    fn physical_bytes_mut(&mut self, addr: PAddr, size: u32) -> Option<&mut [u8]>;

    /// Toggles write trapping for the pages covering `[addr, addr + size)`.
    /// Called on 0 -> positive and positive -> 0 cached-count transitions.
    fn mark_region_cached(&mut self, addr: PAddr, size: u32, cached: bool);
}

/// Flat FCRAM + VRAM backing store.
pub struct PhysicalMemory {
    fcram: Vec<u8>,
    vram: Vec<u8>,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self {
            fcram: vec![0; FCRAM_SIZE as usize],
            vram: vec![0; VRAM_SIZE as usize],
        }
    }

    fn region(&self, addr: PAddr) -> Option<(&Vec<u8>, u32)> {
        if (FCRAM_PADDR..FCRAM_PADDR + FCRAM_SIZE).contains(&addr) {
            Some((&self.fcram, addr - FCRAM_PADDR))
        } else if (VRAM_PADDR..VRAM_PADDR + VRAM_SIZE).contains(&addr) {
            Some((&self.vram, addr - VRAM_PADDR))
        } else {
            None
        }
    }

    fn region_mut(&mut self, addr: PAddr) -> Option<(&mut Vec<u8>, u32)> {
        if (FCRAM_PADDR..FCRAM_PADDR + FCRAM_SIZE).contains(&addr) {
            Some((&mut self.fcram, addr - FCRAM_PADDR))
        } else if (VRAM_PADDR..VRAM_PADDR + VRAM_SIZE).contains(&addr) {
            Some((&mut self.vram, addr - VRAM_PADDR))
        } else {
            None
        }
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestMemory for PhysicalMemory {
    fn physical_bytes(&self, addr: PAddr, size: u32) -> Option<&[u8]> {
        let (region, offset) = self.region(addr)?;
        let end = (offset + size).min(region.len() as u32);
        Some(&region[offset as usize..end as usize])
    }

    fn physical_bytes_mut(&mut self, addr: PAddr, size: u32) -> Option<&mut [u8]> {
        let (region, offset) = self.region_mut(addr)?;
        let end = (offset + size).min(region.len() as u32);
        Some(&mut region[offset as usize..end as usize])
    }

    fn mark_region_cached(&mut self, _addr: PAddr, _size: u32, _cached: bool) {
        // The flat store has no page protection; the CPU-side implementation
        // toggles its page table here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vram_round_trip() {
        let mut mem = PhysicalMemory::new();
        let span = mem.physical_bytes_mut(VRAM_PADDR + 0x100, 4).unwrap();
        span.copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            mem.physical_bytes(VRAM_PADDR + 0x100, 4).unwrap(),
            &[0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_unmapped_returns_none() {
        let mem = PhysicalMemory::new();
        assert!(mem.physical_bytes(0, 4).is_none());
        assert!(mem.physical_bytes(0x1000_0000, 4).is_none());
    }

    #[test]
    fn test_truncated_at_region_end() {
        let mem = PhysicalMemory::new();
        let span = mem.physical_bytes(VRAM_PADDR + VRAM_SIZE - 2, 8).unwrap();
        assert_eq!(span.len(), 2);
    }
}
