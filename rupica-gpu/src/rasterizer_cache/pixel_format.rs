// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pixel format metadata and guest register format mapping.

use crate::regs::{ColorFormat, DepthFormat, FbPixelFormat, TextureFormat};

/// Internal pixel format of a cached surface.
///
/// The discriminants are load-bearing: the gap at 15 keeps the depth
/// formats at `index - 14` in the depth tuple table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Rgba8 = 0,
    Rgb8 = 1,
    Rgb5A1 = 2,
    Rgb565 = 3,
    Rgba4 = 4,
    Ia8 = 5,
    Rg8 = 6,
    I8 = 7,
    A8 = 8,
    Ia4 = 9,
    I4 = 10,
    A4 = 11,
    Etc1 = 12,
    Etc1A4 = 13,
    D16 = 14,
    D24 = 16,
    D24S8 = 17,
    Invalid = 18,
}

pub const PIXEL_FORMAT_COUNT: usize = 18;

/// Surface class derived from the pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SurfaceType {
    Color = 0,
    Texture = 1,
    Depth = 2,
    DepthStencil = 3,
    Fill = 4,
    Invalid = 5,
}

/// Host texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TextureType {
    Texture2D = 0,
    CubeMap = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct PixelFormatInfo {
    pub surface_type: SurfaceType,
    pub name: &'static str,
    /// Bits per pixel (or per block unit) in guest storage.
    pub bits_per_block: u32,
    /// Bytes per pixel of the canonical host layout after decode.
    pub bytes_per_pixel: u32,
}

const fn info(
    surface_type: SurfaceType,
    name: &'static str,
    bits_per_block: u32,
    bytes_per_pixel: u32,
) -> PixelFormatInfo {
    PixelFormatInfo {
        surface_type,
        name,
        bits_per_block,
        bytes_per_pixel,
    }
}

/// Lookup table for pixel format properties.
///
/// Texture formats decode to RGBA8; D24 is padded to 4 bytes on the host.
/// Index 15 is the unused gap between D16 and D24.
pub const FORMAT_MAP: [PixelFormatInfo; PIXEL_FORMAT_COUNT] = [
    info(SurfaceType::Color, "RGBA8", 32, 4),
    info(SurfaceType::Color, "RGB8", 24, 3),
    info(SurfaceType::Color, "RGB5A1", 16, 2),
    info(SurfaceType::Color, "RGB565", 16, 2),
    info(SurfaceType::Color, "RGBA4", 16, 2),
    info(SurfaceType::Texture, "IA8", 16, 4),
    info(SurfaceType::Texture, "RG8", 16, 4),
    info(SurfaceType::Texture, "I8", 8, 4),
    info(SurfaceType::Texture, "A8", 8, 4),
    info(SurfaceType::Texture, "IA4", 8, 4),
    info(SurfaceType::Texture, "I4", 4, 4),
    info(SurfaceType::Texture, "A4", 4, 4),
    info(SurfaceType::Texture, "ETC1", 4, 4),
    info(SurfaceType::Texture, "ETC1A4", 8, 4),
    info(SurfaceType::Depth, "D16", 16, 2),
    info(SurfaceType::Invalid, "Invalid", 0, 0),
    info(SurfaceType::Depth, "D24", 24, 4),
    info(SurfaceType::DepthStencil, "D24S8", 32, 4),
];

impl PixelFormat {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bits per pixel in guest storage.
    pub fn bpp(self) -> u32 {
        assert!(self.index() < PIXEL_FORMAT_COUNT, "invalid pixel format");
        FORMAT_MAP[self.index()].bits_per_block
    }

    /// Bytes per pixel of the decoded host layout.
    pub fn bytes_per_pixel(self) -> u32 {
        assert!(self.index() < PIXEL_FORMAT_COUNT, "invalid pixel format");
        FORMAT_MAP[self.index()].bytes_per_pixel
    }

    pub fn surface_type(self) -> SurfaceType {
        if self == PixelFormat::Invalid {
            return SurfaceType::Invalid;
        }
        FORMAT_MAP[self.index()].surface_type
    }

    pub fn name(self) -> &'static str {
        if self == PixelFormat::Invalid {
            return "Invalid";
        }
        FORMAT_MAP[self.index()].name
    }

    pub fn from_texture_format(format: TextureFormat) -> PixelFormat {
        match format {
            TextureFormat::Rgba8 => PixelFormat::Rgba8,
            TextureFormat::Rgb8 => PixelFormat::Rgb8,
            TextureFormat::Rgb5A1 => PixelFormat::Rgb5A1,
            TextureFormat::Rgb565 => PixelFormat::Rgb565,
            TextureFormat::Rgba4 => PixelFormat::Rgba4,
            TextureFormat::Ia8 => PixelFormat::Ia8,
            TextureFormat::Rg8 => PixelFormat::Rg8,
            TextureFormat::I8 => PixelFormat::I8,
            TextureFormat::A8 => PixelFormat::A8,
            TextureFormat::Ia4 => PixelFormat::Ia4,
            TextureFormat::I4 => PixelFormat::I4,
            TextureFormat::A4 => PixelFormat::A4,
            TextureFormat::Etc1 => PixelFormat::Etc1,
            TextureFormat::Etc1A4 => PixelFormat::Etc1A4,
        }
    }

    pub fn from_color_format(format: ColorFormat) -> PixelFormat {
        match format {
            ColorFormat::Rgba8 => PixelFormat::Rgba8,
            ColorFormat::Rgb8 => PixelFormat::Rgb8,
            ColorFormat::Rgb5A1 => PixelFormat::Rgb5A1,
            ColorFormat::Rgb565 => PixelFormat::Rgb565,
            ColorFormat::Rgba4 => PixelFormat::Rgba4,
        }
    }

    pub fn from_depth_format(format: DepthFormat) -> PixelFormat {
        match format {
            DepthFormat::D16 => PixelFormat::D16,
            DepthFormat::D24 => PixelFormat::D24,
            DepthFormat::D24S8 => PixelFormat::D24S8,
        }
    }

    pub fn from_fb_format(format: FbPixelFormat) -> PixelFormat {
        match format {
            FbPixelFormat::Rgba8 => PixelFormat::Rgba8,
            FbPixelFormat::Rgb8 => PixelFormat::Rgb8,
            FbPixelFormat::Rgb565 => PixelFormat::Rgb565,
            FbPixelFormat::Rgb5A1 => PixelFormat::Rgb5A1,
            FbPixelFormat::Rgba4 => PixelFormat::Rgba4,
        }
    }
}

/// Whether a blit between the two formats is allowed on the host.
pub fn check_formats_blittable(source: PixelFormat, dest: PixelFormat) -> bool {
    let source_type = source.surface_type();
    let dest_type = dest.surface_type();

    let is_color =
        |t: SurfaceType| matches!(t, SurfaceType::Color | SurfaceType::Texture);
    if is_color(source_type) && is_color(dest_type) {
        return true;
    }
    if source_type == SurfaceType::Depth && dest_type == SurfaceType::Depth {
        return true;
    }
    if source_type == SurfaceType::DepthStencil && dest_type == SurfaceType::DepthStencil {
        return true;
    }

    log::warn!(
        "Unblittable format pair detected {} and {}",
        source.name(),
        dest.name()
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_index_arithmetic() {
        // The gap at index 15 keeps `index - 14` valid for depth formats.
        assert_eq!(PixelFormat::D16.index() - 14, 0);
        assert_eq!(PixelFormat::D24.index() - 14, 2);
        assert_eq!(PixelFormat::D24S8.index() - 14, 3);
        assert_eq!(FORMAT_MAP[15].surface_type as u32, SurfaceType::Invalid as u32);
    }

    #[test]
    fn test_bpp_table() {
        assert_eq!(PixelFormat::Rgba8.bpp(), 32);
        assert_eq!(PixelFormat::Rgb8.bpp(), 24);
        assert_eq!(PixelFormat::I4.bpp(), 4);
        assert_eq!(PixelFormat::Etc1A4.bpp(), 8);
        assert_eq!(PixelFormat::D24S8.bpp(), 32);
    }

    #[test]
    fn test_decoded_bytes() {
        // Texture formats decode to RGBA8.
        assert_eq!(PixelFormat::I4.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Ia8.bytes_per_pixel(), 4);
        // Color formats keep their packed size.
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), 3);
    }

    #[test]
    fn test_surface_types() {
        assert_eq!(PixelFormat::Rgba8.surface_type() as u32, SurfaceType::Color as u32);
        assert_eq!(PixelFormat::I8.surface_type() as u32, SurfaceType::Texture as u32);
        assert_eq!(PixelFormat::D16.surface_type() as u32, SurfaceType::Depth as u32);
        assert_eq!(
            PixelFormat::D24S8.surface_type() as u32,
            SurfaceType::DepthStencil as u32
        );
        assert_eq!(PixelFormat::Invalid.surface_type() as u32, SurfaceType::Invalid as u32);
    }

    #[test]
    fn test_blittable() {
        assert!(check_formats_blittable(PixelFormat::Rgba8, PixelFormat::Rgb565));
        assert!(check_formats_blittable(PixelFormat::I8, PixelFormat::Rgba8));
        assert!(check_formats_blittable(PixelFormat::D16, PixelFormat::D24));
        assert!(!check_formats_blittable(PixelFormat::Rgba8, PixelFormat::D24S8));
        assert!(!check_formats_blittable(PixelFormat::D24, PixelFormat::D24S8));
    }

    #[test]
    fn test_fb_format_order() {
        // The display engine swaps RGB565/RGB5A1 relative to ColorFormat.
        assert_eq!(
            PixelFormat::from_fb_format(FbPixelFormat::Rgb565),
            PixelFormat::Rgb565
        );
        assert_eq!(
            PixelFormat::from_fb_format(FbPixelFormat::Rgb5A1),
            PixelFormat::Rgb5A1
        );
    }
}
