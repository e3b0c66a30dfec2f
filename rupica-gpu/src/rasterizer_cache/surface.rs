// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cached surfaces, their watchers and cube map collections.
//!
//! The cache owns every surface and watcher in id-keyed arenas. A watcher is
//! the weak half of the relationship: it holds an optional surface id plus a
//! validity bit, so collection objects (mipmaps, cube faces) can detect both
//! content changes and surface destruction without owning anything.

use rupica_common::types::PAddr;

use crate::regs::TextureFormat;

use super::interval::{IntervalSet, SurfaceInterval};
use super::surface_params::{align_down_to, align_up_to, SurfaceParams};
use super::pixel_format::SurfaceType;
use super::texture_runtime::Allocation;

/// Identifier of a surface in the cache arena. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Identifier of a watcher in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub u64);

/// Weak observer of one surface.
#[derive(Debug)]
pub struct SurfaceWatcher {
    pub(crate) surface: Option<SurfaceId>,
    pub(crate) valid: bool,
}

impl SurfaceWatcher {
    pub(crate) fn new(surface: SurfaceId) -> Self {
        Self {
            surface: Some(surface),
            valid: false,
        }
    }

    /// The observed surface, or `None` once it has been destroyed.
    pub fn get(&self) -> Option<SurfaceId> {
        self.surface
    }

    /// Whether the snapshot taken by the watcher user is still current.
    pub fn is_valid(&self) -> bool {
        self.surface.is_some() && self.valid
    }

    /// Marks the watcher user's snapshot as up to date.
    pub fn validate(&mut self) {
        debug_assert!(self.surface.is_some());
        self.valid = true;
    }
}

pub struct Surface {
    pub params: SurfaceParams,
    /// `None` for fill surfaces and after a failed allocation.
    pub alloc: Option<Allocation>,
    pub registered: bool,
    /// Intervals whose host pixels do not reflect current truth.
    pub invalid_regions: IntervalSet,
    /// Fill pattern, meaningful when `surface_type == Fill`.
    pub fill_size: u32,
    pub fill_data: [u8; 4],
    /// Watchers for mip levels 1..=7.
    pub level_watchers: [Option<WatcherId>; 7],
    /// All watchers issued for this surface.
    pub watchers: Vec<WatcherId>,
}

impl Surface {
    pub fn new(params: SurfaceParams, alloc: Option<Allocation>) -> Self {
        Self {
            params,
            alloc,
            registered: false,
            invalid_regions: IntervalSet::new(),
            fill_size: 0,
            fill_data: [0; 4],
            level_watchers: Default::default(),
            watchers: Vec::new(),
        }
    }

    #[inline]
    pub fn interval(&self) -> SurfaceInterval {
        self.params.interval()
    }

    /// True when no part of `interval` is marked invalid.
    pub fn is_region_valid(&self, interval: SurfaceInterval) -> bool {
        !self.invalid_regions.intersects(interval)
    }

    /// True when the whole surface is invalid and holds nothing salvageable.
    pub fn is_fully_invalid(&self) -> bool {
        self.invalid_regions.covers(self.interval())
    }

    /// True when this fill surface can establish `fill_interval` of a
    /// surface described by `dest`. The pattern must repeat exactly per
    /// destination texel when the sizes differ.
    pub fn can_fill(&self, dest: &SurfaceParams, fill_interval: SurfaceInterval) -> bool {
        if self.params.surface_type != SurfaceType::Fill
            || !self.is_region_valid(fill_interval)
            || fill_interval.start < self.params.addr
            || fill_interval.end > self.params.end
            || dest.from_interval(fill_interval).interval() != fill_interval
        {
            return false;
        }
        if self.fill_size * 8 == dest.format_bpp() {
            return true;
        }

        // Check if the pattern repeats per destination texel.
        let dest_bytes_per_pixel = (dest.format_bpp() / 8).max(1);
        let mut fill_test = vec![0u8; (self.fill_size * dest_bytes_per_pixel) as usize];
        for i in 0..dest_bytes_per_pixel {
            let at = (i * self.fill_size) as usize;
            fill_test[at..at + self.fill_size as usize]
                .copy_from_slice(&self.fill_data[..self.fill_size as usize]);
        }
        for i in 0..self.fill_size {
            let at = (dest_bytes_per_pixel * i) as usize;
            if fill_test[at..at + dest_bytes_per_pixel as usize]
                != fill_test[..dest_bytes_per_pixel as usize]
            {
                return false;
            }
        }
        if dest.format_bpp() == 4 && (fill_test[0] & 0xF) != (fill_test[0] >> 4) {
            return false;
        }
        true
    }

    /// True when this surface can establish `copy_interval` of `dest`.
    pub fn can_copy(&self, dest: &SurfaceParams, copy_interval: SurfaceInterval) -> bool {
        let subrect_params = dest.from_interval(copy_interval);
        debug_assert_eq!(subrect_params.interval(), copy_interval);
        if self.params.can_sub_rect(&subrect_params) {
            return true;
        }
        if self.can_fill(dest, copy_interval) {
            return true;
        }
        false
    }

    /// The largest valid tile-aligned rectangle of this surface within the
    /// region described by `params`.
    pub fn get_copyable_interval(&self, params: &SurfaceParams) -> SurfaceInterval {
        let mut result = SurfaceInterval::default();
        let tile_align = params.bytes_in_pixels(if params.is_tiled { 8 * 8 } else { 1 });

        let mut valid_regions =
            IntervalSet::from_interval(params.interval().intersect(self.interval()));
        valid_regions.subtract(&self.invalid_regions);

        for valid_interval in valid_regions.iter() {
            let aligned_interval = SurfaceInterval::new(
                params.addr + align_up_to(valid_interval.start - params.addr, tile_align),
                params.addr + align_down_to(valid_interval.end - params.addr, tile_align),
            );
            if tile_align > valid_interval.len() || aligned_interval.len() == 0 {
                continue;
            }

            // Tighten to whole rows within the aligned interval.
            let stride_bytes =
                params.bytes_in_pixels(params.stride) * if params.is_tiled { 8 } else { 1 };
            let mut rect_interval = SurfaceInterval::new(
                params.addr + align_up_to(aligned_interval.start - params.addr, stride_bytes),
                params.addr + align_down_to(aligned_interval.end - params.addr, stride_bytes),
            );

            if rect_interval.start > rect_interval.end {
                // One row.
                rect_interval = aligned_interval;
            } else if rect_interval.len() == 0 {
                // Two partial rows that do not form a rectangle; take the
                // larger one.
                let row1 = SurfaceInterval::new(aligned_interval.start, rect_interval.start);
                let row2 = SurfaceInterval::new(rect_interval.start, aligned_interval.end);
                rect_interval = if row1.len() > row2.len() { row1 } else { row2 };
            }

            if rect_interval.len() > result.len() {
                result = rect_interval;
            }
        }
        result
    }

    /// Bytes per pixel of the decoded layout used by staging transfers.
    #[inline]
    pub fn internal_bytes_per_pixel(&self) -> u32 {
        self.params.pixel_format.bytes_per_pixel()
    }
}

/// Key of a cached cube texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureCubeConfig {
    pub px: PAddr,
    pub nx: PAddr,
    pub py: PAddr,
    pub ny: PAddr,
    pub pz: PAddr,
    pub nz: PAddr,
    pub width: u32,
    pub format: TextureFormat,
}

impl TextureCubeConfig {
    pub fn face_addresses(&self) -> [PAddr; 6] {
        [self.px, self.nx, self.py, self.ny, self.pz, self.nz]
    }
}

/// A host cube texture assembled from six 2D surfaces via watchers.
#[derive(Default)]
pub struct CachedTextureCube {
    pub alloc: Option<Allocation>,
    pub res_scale: u16,
    pub faces: [Option<WatcherId>; 6],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::pixel_format::PixelFormat;

    fn fill_surface(addr: PAddr, size: u32, fill: &[u8]) -> Surface {
        let params = SurfaceParams {
            addr,
            end: addr + size,
            size,
            surface_type: SurfaceType::Fill,
            res_scale: u16::MAX,
            ..Default::default()
        };
        let mut surface = Surface::new(params, None);
        surface.fill_size = fill.len() as u32;
        surface.fill_data[..fill.len()].copy_from_slice(fill);
        surface
    }

    fn linear_surface(addr: PAddr, width: u32, height: u32) -> Surface {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            stride: width,
            pixel_format: PixelFormat::Rgba8,
            ..Default::default()
        };
        params.update_params();
        Surface::new(params, None)
    }

    #[test]
    fn test_region_validity() {
        let mut surface = linear_surface(0x1800_0000, 8, 8);
        surface.invalid_regions.insert(surface.interval());
        assert!(!surface.is_region_valid(surface.interval()));
        assert!(surface.is_fully_invalid());

        surface
            .invalid_regions
            .erase(SurfaceInterval::new(0x1800_0000, 0x1800_0000 + 32));
        assert!(surface.is_region_valid(SurfaceInterval::new(0x1800_0000, 0x1800_0000 + 32)));
        assert!(!surface.is_fully_invalid());
    }

    #[test]
    fn test_can_fill_same_bpp() {
        let fill = fill_surface(0x1800_0000, 0x1000, &[0x11, 0x22, 0x33, 0x44]);
        let dest = linear_surface(0x1800_0000, 16, 16).params;
        let interval = dest.interval();
        assert!(fill.can_fill(&dest, interval));
    }

    #[test]
    fn test_can_fill_repeating_pattern() {
        // A 2-byte pattern tiles 4-byte texels evenly, so every texel sees
        // the same bytes.
        let fill = fill_surface(0x1800_0000, 0x1000, &[0xAB, 0xCD]);
        let dest = linear_surface(0x1800_0000, 16, 16).params;
        assert!(fill.can_fill(&dest, dest.interval()));

        // A 3-byte pattern drifts across 4-byte texels.
        let fill = fill_surface(0x1800_0000, 0x1000, &[0x01, 0x02, 0x03]);
        assert!(!fill.can_fill(&dest, dest.interval()));

        // Unless all bytes are equal.
        let fill = fill_surface(0x1800_0000, 0x1000, &[0x5A, 0x5A, 0x5A]);
        assert!(fill.can_fill(&dest, dest.interval()));
    }

    #[test]
    fn test_copyable_interval_full() {
        let surface = linear_surface(0x1800_0000, 8, 8);
        let copyable = surface.get_copyable_interval(&surface.params);
        assert_eq!(copyable, surface.interval());
    }

    #[test]
    fn test_copyable_interval_partial() {
        let mut surface = linear_surface(0x1800_0000, 8, 8);
        let row_bytes = 8 * 4;
        // Rows 4.. are invalid; only rows 0..4 are copyable.
        surface.invalid_regions.insert(SurfaceInterval::new(
            surface.params.addr + 4 * row_bytes,
            surface.params.end,
        ));
        let copyable = surface.get_copyable_interval(&surface.params);
        assert_eq!(
            copyable,
            SurfaceInterval::new(surface.params.addr, surface.params.addr + 4 * row_bytes)
        );
    }

    #[test]
    fn test_watcher_lifecycle() {
        let mut watcher = SurfaceWatcher::new(SurfaceId(1));
        assert!(!watcher.is_valid());
        watcher.validate();
        assert!(watcher.is_valid());
        watcher.valid = false;
        assert!(!watcher.is_valid());
        watcher.surface = None;
        watcher.valid = true;
        assert!(!watcher.is_valid());
    }
}
