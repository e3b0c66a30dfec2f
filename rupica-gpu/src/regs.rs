// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Decoded guest command descriptors consumed by the rasterizer cache.
//!
//! These mirror the DMA-engine and texture-unit register blocks after
//! address translation; all addresses here are physical.

use rupica_common::types::PAddr;

/// Guest texture unit format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TextureFormat {
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
}

/// Guest framebuffer color format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ColorFormat {
    Rgba8 = 0,
    Rgb8 = 1,
    Rgb5A1 = 2,
    Rgb565 = 3,
    Rgba4 = 4,
}

/// Guest framebuffer depth format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DepthFormat {
    D16 = 0,
    D24 = 2,
    D24S8 = 3,
}

/// Pixel format of the display transfer engine. Note the different order
/// from [`ColorFormat`]: RGB565 and RGB5A1 are swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FbPixelFormat {
    Rgba8 = 0,
    Rgb8 = 1,
    Rgb565 = 2,
    Rgb5A1 = 3,
    Rgba4 = 4,
}

/// Scaling applied by a display transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    NoScale,
    /// Downscale horizontally by 2.
    ScaleX,
    /// Downscale both axes by 2.
    ScaleXY,
}

/// Raw "texture copy" sub-descriptor. Width and gap registers are in
/// 16-byte units, as written by the guest.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextureCopyConfig {
    pub size: u32,
    pub input_width: u32,
    pub input_gap: u32,
    pub output_width: u32,
    pub output_gap: u32,
}

/// Display transfer engine descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DisplayTransferConfig {
    pub input_address: PAddr,
    pub output_address: PAddr,
    /// Input stride in pixels.
    pub input_width: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub input_format: FbPixelFormat,
    pub output_format: FbPixelFormat,
    /// Input is linear (raw copy mode reads linear data).
    pub input_linear: bool,
    /// Suppresses the output swizzle when the input is linear.
    pub dont_swizzle: bool,
    pub scaling: ScalingMode,
    pub flip_vertically: bool,
    /// Set when this transfer is a raw "texture copy".
    pub is_texture_copy: bool,
    pub texture_copy: TextureCopyConfig,
}

impl Default for DisplayTransferConfig {
    fn default() -> Self {
        Self {
            input_address: 0,
            output_address: 0,
            input_width: 0,
            output_width: 0,
            output_height: 0,
            input_format: FbPixelFormat::Rgba8,
            output_format: FbPixelFormat::Rgba8,
            input_linear: false,
            dont_swizzle: false,
            scaling: ScalingMode::NoScale,
            flip_vertically: false,
            is_texture_copy: false,
            texture_copy: TextureCopyConfig::default(),
        }
    }
}

/// Memory fill engine descriptor.
#[derive(Debug, Clone, Copy)]
pub struct MemoryFillConfig {
    pub start: PAddr,
    pub end: PAddr,
    pub value_32bit: u32,
    pub fill_24bit: bool,
    pub fill_32bit: bool,
}

impl MemoryFillConfig {
    /// Bytes of the fill pattern: 4, 3, or 2.
    pub fn fill_size(&self) -> u32 {
        if self.fill_32bit {
            4
        } else if self.fill_24bit {
            3
        } else {
            2
        }
    }
}

/// Texture unit configuration relevant to surface lookup.
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    pub physical_address: PAddr,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Framebuffer register block after address translation.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferConfig {
    pub width: u32,
    pub height: u32,
    pub color_address: PAddr,
    pub depth_address: PAddr,
    pub color_format: ColorFormat,
    pub depth_format: DepthFormat,
}
