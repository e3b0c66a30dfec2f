// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Describes a guest memory region as a 2D pixel rectangle.

use rupica_common::rect::Rect;
use rupica_common::types::PAddr;

use super::interval::SurfaceInterval;
use super::pixel_format::{PixelFormat, SurfaceType, TextureType};

/// Aligns down to an arbitrary (not necessarily power-of-two) unit.
#[inline]
pub(crate) const fn align_down_to(value: u32, unit: u32) -> u32 {
    value - value % unit
}

/// Aligns up to an arbitrary (not necessarily power-of-two) unit.
#[inline]
pub(crate) const fn align_up_to(value: u32, unit: u32) -> u32 {
    align_down_to(value + unit - 1, unit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceParams {
    pub addr: PAddr,
    pub end: PAddr,
    pub size: u32,

    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub levels: u32,
    pub res_scale: u16,

    pub is_tiled: bool,
    pub texture_type: TextureType,
    pub pixel_format: PixelFormat,
    pub surface_type: SurfaceType,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            addr: 0,
            end: 0,
            size: 0,
            width: 0,
            height: 0,
            stride: 0,
            levels: 1,
            res_scale: 1,
            is_tiled: false,
            texture_type: TextureType::Texture2D,
            pixel_format: PixelFormat::Invalid,
            surface_type: SurfaceType::Invalid,
        }
    }
}

impl SurfaceParams {
    /// Recomputes `stride`, `surface_type`, `size` and `end` from the already
    /// set `addr`, `width`, `height` and `pixel_format`. A zero `stride`
    /// requests the packed layout `stride = width`.
    pub fn update_params(&mut self) {
        if self.stride == 0 {
            self.stride = self.width;
        }
        self.surface_type = self.pixel_format.surface_type();
        self.size = if !self.is_tiled {
            self.bytes_in_pixels(self.stride * (self.height - 1) + self.width)
        } else {
            self.bytes_in_pixels(self.stride * 8 * (self.height / 8 - 1) + self.width * 8)
        };
        self.end = self.addr + self.size;
    }

    #[inline]
    pub fn interval(&self) -> SurfaceInterval {
        SurfaceInterval::new(self.addr, self.end)
    }

    #[inline]
    pub fn format_bpp(&self) -> u32 {
        self.pixel_format.bpp()
    }

    #[inline]
    pub fn pixels_in_bytes(&self, size: u32) -> u32 {
        size * 8 / self.format_bpp()
    }

    #[inline]
    pub fn bytes_in_pixels(&self, pixels: u32) -> u32 {
        pixels * self.format_bpp() / 8
    }

    #[inline]
    pub fn scaled_width(&self) -> u32 {
        self.width * u32::from(self.res_scale)
    }

    #[inline]
    pub fn scaled_height(&self) -> u32 {
        self.height * u32::from(self.res_scale)
    }

    #[inline]
    pub fn rect(&self) -> Rect<u32> {
        Rect::new(0, self.height, self.width, 0)
    }

    #[inline]
    pub fn scaled_rect(&self) -> Rect<u32> {
        Rect::new(0, self.scaled_height(), self.scaled_width(), 0)
    }

    /// True when every geometric field matches `other`.
    pub fn exact_match(&self, other: &SurfaceParams) -> bool {
        (
            other.addr,
            other.width,
            other.height,
            other.stride,
            other.levels,
            other.pixel_format,
            other.is_tiled,
        ) == (
            self.addr,
            self.width,
            self.height,
            self.stride,
            self.levels,
            self.pixel_format,
            self.is_tiled,
        ) && self.pixel_format != PixelFormat::Invalid
    }

    /// True when `sub` denotes a sub-rectangle of this surface.
    pub fn can_sub_rect(&self, sub: &SurfaceParams) -> bool {
        sub.addr >= self.addr
            && sub.end <= self.end
            && sub.pixel_format == self.pixel_format
            && self.pixel_format != PixelFormat::Invalid
            && sub.is_tiled == self.is_tiled
            && (sub.addr - self.addr) % self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 })
                == 0
            && (sub.stride == self.stride || sub.height <= if self.is_tiled { 8 } else { 1 })
            && self.get_sub_rect(sub).right <= self.stride
    }

    /// True when this surface can be grown to also cover `expanded`.
    pub fn can_expand(&self, expanded: &SurfaceParams) -> bool {
        self.pixel_format != PixelFormat::Invalid
            && self.pixel_format == expanded.pixel_format
            && self.addr <= expanded.end
            && expanded.addr <= self.end
            && self.is_tiled == expanded.is_tiled
            && self.stride == expanded.stride
            && (expanded.addr.max(self.addr) - expanded.addr.min(self.addr))
                % self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 })
                == 0
    }

    /// True when this surface can satisfy a "texture copy" transfer described
    /// by `copy`, whose width/stride are in bytes.
    pub fn can_tex_copy(&self, copy: &SurfaceParams) -> bool {
        if self.pixel_format == PixelFormat::Invalid
            || self.addr > copy.addr
            || self.end < copy.end
        {
            return false;
        }

        if copy.width != copy.stride {
            let tile_stride =
                self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 });
            let copy_unit = self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 });
            return (copy.addr - self.addr) % copy_unit == 0
                && copy.width % copy_unit == 0
                && (copy.height == 1 || copy.stride == tile_stride)
                && ((copy.addr - self.addr) % tile_stride) + copy.width <= tile_stride;
        }

        self.from_interval(copy.interval()).interval() == copy.interval()
    }

    /// The unscaled pixel rectangle of `sub` within this surface.
    pub fn get_sub_rect(&self, sub: &SurfaceParams) -> Rect<u32> {
        let begin_pixel_index = self.pixels_in_bytes(sub.addr - self.addr);

        if self.is_tiled {
            let x0 = (begin_pixel_index % (self.stride * 8)) / 8;
            let y0 = (begin_pixel_index / (self.stride * 8)) * 8;
            // Tiled surfaces are laid out top to bottom.
            return Rect::new(x0, self.height - y0, x0 + sub.width, self.height - (y0 + sub.height));
        }

        let x0 = begin_pixel_index % self.stride;
        let y0 = begin_pixel_index / self.stride;
        // Linear surfaces are laid out bottom to top.
        Rect::new(x0, y0 + sub.height, x0 + sub.width, y0)
    }

    /// Same rectangle multiplied by the resolution scale.
    pub fn get_scaled_sub_rect(&self, sub: &SurfaceParams) -> Rect<u32> {
        self.get_sub_rect(sub) * u32::from(self.res_scale)
    }

    /// The outer bounding parameters describing the rectangle touched by
    /// `interval` within this surface.
    pub fn from_interval(&self, interval: SurfaceInterval) -> SurfaceParams {
        let mut params = *self;
        let tiled_size = if self.is_tiled { 8 } else { 1 };
        let stride_tiled_bytes = self.bytes_in_pixels(self.stride * tiled_size);

        let mut aligned_start =
            self.addr + align_down_to(interval.start - self.addr, stride_tiled_bytes);
        let mut aligned_end =
            self.addr + align_up_to(interval.end - self.addr, stride_tiled_bytes);

        if aligned_end - aligned_start > stride_tiled_bytes {
            params.addr = aligned_start;
            params.height = (aligned_end - aligned_start) / self.bytes_in_pixels(self.stride);
        } else {
            // Single row; tighten to the tile (or pixel) granularity.
            assert_eq!(aligned_end - aligned_start, stride_tiled_bytes);
            let tiled_alignment = self.bytes_in_pixels(if self.is_tiled { 8 * 8 } else { 1 });

            aligned_start =
                self.addr + align_down_to(interval.start - self.addr, tiled_alignment);
            aligned_end = self.addr + align_up_to(interval.end - self.addr, tiled_alignment);

            params.addr = aligned_start;
            params.width = self.pixels_in_bytes(aligned_end - aligned_start) / tiled_size;
            params.stride = params.width;
            params.height = tiled_size;
        }

        params.update_params();
        params
    }

    /// The address interval covered by `unscaled_rect` within this surface.
    pub fn get_sub_rect_interval(&self, unscaled_rect: Rect<u32>) -> SurfaceInterval {
        if unscaled_rect.is_empty() {
            return SurfaceInterval::default();
        }

        let mut rect = unscaled_rect;
        if self.is_tiled {
            // Convert to 8-pixel-high band coordinates.
            rect.left = align_down_to(rect.left, 8) * 8;
            rect.bottom = align_down_to(rect.bottom, 8) / 8;
            rect.right = align_up_to(rect.right, 8) * 8;
            rect.top = align_up_to(rect.top, 8) / 8;
        }

        let stride_tiled = if self.is_tiled { self.stride * 8 } else { self.stride };
        let pixels = (rect.height() - 1) * stride_tiled + rect.width();
        let pixel_offset = stride_tiled
            * if self.is_tiled {
                self.height / 8 - rect.top
            } else {
                rect.bottom
            }
            + rect.left;

        SurfaceInterval::new(
            self.addr + self.bytes_in_pixels(pixel_offset),
            self.addr + self.bytes_in_pixels(pixel_offset + pixels),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_params(addr: PAddr, width: u32, height: u32, stride: u32) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            stride,
            pixel_format: PixelFormat::Rgba8,
            ..Default::default()
        };
        params.update_params();
        params
    }

    fn tiled_params(addr: PAddr, width: u32, height: u32) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            is_tiled: true,
            pixel_format: PixelFormat::Rgb565,
            ..Default::default()
        };
        params.update_params();
        params
    }

    #[test]
    fn test_update_params_linear() {
        let params = linear_params(0x1800_0000, 64, 64, 64);
        assert_eq!(params.size, 64 * 64 * 4);
        assert_eq!(params.end, 0x1800_0000 + 64 * 64 * 4);
        assert_eq!(params.surface_type as u32, SurfaceType::Color as u32);
    }

    #[test]
    fn test_update_params_auto_stride() {
        let mut params = SurfaceParams {
            addr: 0x1800_0000,
            width: 32,
            height: 8,
            pixel_format: PixelFormat::Rgb565,
            ..Default::default()
        };
        params.update_params();
        assert_eq!(params.stride, 32);
        assert_eq!(params.size, 32 * 8 * 2);
    }

    #[test]
    fn test_update_params_with_gap() {
        // A stride wider than the width leaves the last row short.
        let params = linear_params(0, 32, 4, 64);
        assert_eq!(params.size, (64 * 3 + 32) * 4);
    }

    #[test]
    fn test_exact_match_ignores_res_scale() {
        let a = linear_params(0x1800_0000, 64, 64, 64);
        let mut b = a;
        b.res_scale = 4;
        assert!(a.exact_match(&b));
        b.width = 32;
        assert!(!a.exact_match(&b));
    }

    #[test]
    fn test_can_sub_rect_linear() {
        let parent = linear_params(0x1800_0000, 64, 64, 64);
        // Rows 16..48.
        let sub = linear_params(0x1800_0000 + 16 * 64 * 4, 64, 32, 64);
        assert!(parent.can_sub_rect(&sub));

        let rect = parent.get_sub_rect(&sub);
        assert_eq!(rect, Rect::new(0, 48, 64, 16));
    }

    #[test]
    fn test_can_sub_rect_rejects_misaligned_tiled() {
        let parent = tiled_params(0x1800_0000, 64, 64);
        // Offset by one pixel's worth of bytes: not a tile boundary.
        let mut sub = tiled_params(0x1800_0000 + 2, 8, 8);
        sub.update_params();
        assert!(!parent.can_sub_rect(&sub));
    }

    #[test]
    fn test_can_expand_abutting() {
        let a = linear_params(0x1800_0000, 64, 32, 64);
        let b = linear_params(a.end, 64, 32, 64);
        assert!(a.can_expand(&b));
        let far = linear_params(a.end + 64 * 4, 64, 32, 64);
        assert!(a.can_expand(&far)); // row-aligned gap still expands
        let mut other_stride = linear_params(a.end, 32, 32, 32);
        other_stride.update_params();
        assert!(!a.can_expand(&other_stride));
    }

    #[test]
    fn test_from_interval_rows() {
        let params = linear_params(0x1800_0000, 64, 64, 64);
        // Two whole rows starting at row 8.
        let row_bytes = 64 * 4;
        let interval = SurfaceInterval::new(
            params.addr + 8 * row_bytes,
            params.addr + 10 * row_bytes,
        );
        let sub = params.from_interval(interval);
        assert_eq!(sub.addr, interval.start);
        assert_eq!(sub.height, 2);
        assert_eq!(sub.width, 64);
        assert_eq!(sub.interval(), interval);
    }

    #[test]
    fn test_from_interval_partial_row() {
        let params = linear_params(0x1800_0000, 64, 64, 64);
        // A few pixels inside row 3.
        let row_bytes = 64 * 4;
        let interval = SurfaceInterval::new(
            params.addr + 3 * row_bytes + 16,
            params.addr + 3 * row_bytes + 32,
        );
        let sub = params.from_interval(interval);
        assert_eq!(sub.height, 1);
        assert!(sub.interval().contains(interval));
    }

    #[test]
    fn test_sub_rect_interval_round_trip() {
        let params = linear_params(0x1800_0000, 64, 64, 64);
        let sub = linear_params(0x1800_0000 + 16 * 64 * 4, 64, 32, 64);
        let rect = params.get_sub_rect(&sub);
        assert_eq!(params.get_sub_rect_interval(rect), sub.interval());
    }

    #[test]
    fn test_tiled_sub_rect_top_down() {
        let parent = tiled_params(0x1800_0000, 64, 64);
        // Second band of 8 rows.
        let band_bytes = 64 * 8 * 2;
        let mut sub = tiled_params(0x1800_0000 + band_bytes, 64, 8);
        sub.update_params();
        assert!(parent.can_sub_rect(&sub));
        let rect = parent.get_sub_rect(&sub);
        // Tiled layout: higher addresses sit lower on the image.
        assert_eq!(rect, Rect::new(0, 64 - 8, 64, 64 - 16));
    }

    #[test]
    fn test_scaled_sub_rect() {
        let mut parent = linear_params(0x1800_0000, 64, 64, 64);
        parent.res_scale = 2;
        let sub = linear_params(0x1800_0000, 64, 32, 64);
        let rect = parent.get_scaled_sub_rect(&sub);
        assert_eq!(rect, Rect::new(0, 64, 128, 0));
    }

    #[test]
    fn test_can_tex_copy_contiguous() {
        let parent = linear_params(0x1800_0000, 64, 64, 64);
        // A contiguous byte run covering eight full rows: width == stride.
        let size = parent.bytes_in_pixels(64 * 8);
        let copy = SurfaceParams {
            addr: parent.addr,
            width: size,
            stride: size,
            height: 1,
            size,
            end: parent.addr + size,
            pixel_format: PixelFormat::Rgba8,
            ..Default::default()
        };
        assert!(parent.can_tex_copy(&copy));
    }
}
