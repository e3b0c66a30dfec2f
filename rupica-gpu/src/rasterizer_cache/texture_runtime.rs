// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Texture manipulation layer between the rasterizer cache and the backend.
//!
//! Owns the staging buffer, the texture recycler and the list of format
//! reinterpreters. Surfaces with `res_scale > 1` carry two backend textures:
//! the unscaled one is the transfer target for guest uploads/downloads, the
//! scaled one is what rendering and copies operate on.

use std::collections::HashMap;

use rupica_common::settings::TextureFilter;

use super::backend::{TextureBackend, TextureHandle};
use super::pixel_format::{PixelFormat, SurfaceType, TextureType};
use super::surface::Surface;
use super::utils::{
    BufferTextureCopy, StagingData, TextureBlit, TextureClear, TextureCopy,
};

/// Host storage format of a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFormat {
    Rgba8,
    Rgb8,
    Rgb5A1,
    Rgb565,
    Rgba4,
    D16,
    D24,
    D24S8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatTuple {
    pub format: HostFormat,
    pub bytes_per_texel: u32,
}

const DEFAULT_TUPLE: FormatTuple = FormatTuple {
    format: HostFormat::Rgba8,
    bytes_per_texel: 4,
};

const COLOR_TUPLES: [FormatTuple; 5] = [
    FormatTuple { format: HostFormat::Rgba8, bytes_per_texel: 4 },
    FormatTuple { format: HostFormat::Rgb8, bytes_per_texel: 3 },
    FormatTuple { format: HostFormat::Rgb5A1, bytes_per_texel: 2 },
    FormatTuple { format: HostFormat::Rgb565, bytes_per_texel: 2 },
    FormatTuple { format: HostFormat::Rgba4, bytes_per_texel: 2 },
];

const DEPTH_TUPLES: [FormatTuple; 4] = [
    FormatTuple { format: HostFormat::D16, bytes_per_texel: 2 },
    DEFAULT_TUPLE, // gap
    FormatTuple { format: HostFormat::D24, bytes_per_texel: 4 },
    FormatTuple { format: HostFormat::D24S8, bytes_per_texel: 4 },
];

/// The host format tuple backing a surface pixel format. Texture formats
/// decode to RGBA8 and share the default tuple.
pub fn get_format_tuple(pixel_format: PixelFormat) -> FormatTuple {
    match pixel_format.surface_type() {
        SurfaceType::Color => COLOR_TUPLES[pixel_format.index()],
        SurfaceType::Depth | SurfaceType::DepthStencil => {
            DEPTH_TUPLES[pixel_format.index() - 14]
        }
        _ => DEFAULT_TUPLE,
    }
}

/// Recycler key: only exact shape matches are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostTextureTag {
    pub tuple: FormatTuple,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub res_scale: u16,
}

/// One (or two, when scaled) backend textures bound to a surface.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub tuple: FormatTuple,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub res_scale: u16,
    pub texture: TextureHandle,
    pub scaled: Option<TextureHandle>,
}

impl Allocation {
    /// The texture rendering and scaled copies operate on.
    #[inline]
    pub fn draw_handle(&self) -> TextureHandle {
        self.scaled.unwrap_or(self.texture)
    }

    pub fn tag(&self) -> HostTextureTag {
        HostTextureTag {
            tuple: self.tuple,
            texture_type: self.texture_type,
            width: self.width,
            height: self.height,
            levels: self.levels,
            res_scale: self.res_scale,
        }
    }
}

/// A registered format reinterpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reinterpreter {
    pub src_format: PixelFormat,
    pub dst_format: PixelFormat,
}

pub struct TextureRuntime {
    backend: Box<dyn TextureBackend>,
    staging_buffer: Vec<u8>,
    recycler: HashMap<HostTextureTag, Vec<Allocation>>,
    reinterpreters: Vec<Reinterpreter>,
    filter: TextureFilter,
}

impl TextureRuntime {
    pub fn new(backend: Box<dyn TextureBackend>, filter: TextureFilter) -> Self {
        Self {
            backend,
            staging_buffer: Vec::new(),
            recycler: HashMap::new(),
            reinterpreters: vec![
                Reinterpreter {
                    src_format: PixelFormat::D24S8,
                    dst_format: PixelFormat::Rgba8,
                },
                Reinterpreter {
                    src_format: PixelFormat::Rgba4,
                    dst_format: PixelFormat::Rgb5A1,
                },
            ],
            filter,
        }
    }

    /// True when no texture filter is active; textures then stay at native
    /// resolution and mip levels are blitted instead of generated.
    pub fn is_null_filter(&self) -> bool {
        self.filter == TextureFilter::None
    }

    /// Applies a new filter setting. Returns whether it changed.
    pub fn reset_filter(&mut self, filter: TextureFilter) -> bool {
        let changed = self.filter != filter;
        self.filter = filter;
        changed
    }

    /// Reinterpreters writing into `dst_format`.
    pub fn reinterpreters_for(&self, dst_format: PixelFormat) -> Vec<Reinterpreter> {
        self.reinterpreters
            .iter()
            .filter(|r| r.dst_format == dst_format)
            .copied()
            .collect()
    }

    /// Grows the staging buffer to at least `size` and returns a descriptor
    /// for it. The buffer is a single process-wide allocation; callers use
    /// it sequentially.
    pub fn find_staging(&mut self, size: u32, _upload: bool) -> StagingData {
        if self.staging_buffer.len() < size as usize {
            self.staging_buffer.resize(size as usize, 0);
        }
        StagingData { size, offset: 0 }
    }

    pub fn staging(&self, staging: &StagingData) -> &[u8] {
        &self.staging_buffer[staging.offset as usize..(staging.offset + staging.size) as usize]
    }

    pub fn staging_mut(&mut self, staging: &StagingData) -> &mut [u8] {
        &mut self.staging_buffer
            [staging.offset as usize..(staging.offset + staging.size) as usize]
    }

    /// Allocates (or recycles) the backend textures for a surface shape.
    /// `None` reports an allocation failure; the surface stays unmapped.
    pub fn allocate(
        &mut self,
        pixel_format: PixelFormat,
        texture_type: TextureType,
        width: u32,
        height: u32,
        levels: u32,
        res_scale: u16,
    ) -> Option<Allocation> {
        let tuple = get_format_tuple(pixel_format);
        let tag = HostTextureTag {
            tuple,
            texture_type,
            width,
            height,
            levels,
            res_scale,
        };
        if let Some(allocs) = self.recycler.get_mut(&tag) {
            if let Some(alloc) = allocs.pop() {
                return Some(alloc);
            }
        }

        let texture = self
            .backend
            .create_texture(tuple, texture_type, width, height, levels)?;
        let scaled = if res_scale > 1 {
            let scale = u32::from(res_scale);
            match self.backend.create_texture(
                tuple,
                texture_type,
                width * scale,
                height * scale,
                levels,
            ) {
                Some(handle) => Some(handle),
                None => {
                    self.backend.destroy_texture(texture);
                    return None;
                }
            }
        } else {
            None
        };

        Some(Allocation {
            tuple,
            texture_type,
            width,
            height,
            levels,
            res_scale,
            texture,
            scaled,
        })
    }

    /// Takes back ownership of an allocation for later reuse.
    pub fn recycle(&mut self, alloc: Allocation) {
        self.recycler.entry(alloc.tag()).or_default().push(alloc);
    }

    /// Fills a rectangle of the surface with the clear value.
    pub fn clear_texture(&mut self, surface: &Surface, clear: &TextureClear) -> bool {
        let Some(alloc) = &surface.alloc else {
            return false;
        };
        self.backend.clear(alloc.draw_handle(), clear)
    }

    /// Exact copy between two surfaces at their draw resolution.
    pub fn copy_textures(&mut self, src: &Surface, dst: &Surface, copy: &TextureCopy) -> bool {
        let (Some(src_alloc), Some(dst_alloc)) = (&src.alloc, &dst.alloc) else {
            return false;
        };
        self.backend
            .copy(src_alloc.draw_handle(), dst_alloc.draw_handle(), copy)
    }

    /// Copy from a surface into a face of a cube texture.
    pub fn copy_to_cube(&mut self, src: &Surface, cube: TextureHandle, copy: &TextureCopy) -> bool {
        let Some(src_alloc) = &src.alloc else {
            return false;
        };
        self.backend.copy(src_alloc.draw_handle(), cube, copy)
    }

    /// Stretched copy between two surfaces at their draw resolution.
    pub fn blit_textures(&mut self, src: &Surface, dst: &Surface, blit: &TextureBlit) -> bool {
        let (Some(src_alloc), Some(dst_alloc)) = (&src.alloc, &dst.alloc) else {
            return false;
        };
        self.backend
            .blit(src_alloc.draw_handle(), dst_alloc.draw_handle(), blit)
    }

    pub fn generate_mipmaps(&mut self, surface: &Surface, max_level: u32) {
        let Some(alloc) = &surface.alloc else {
            return;
        };
        self.backend.generate_mipmaps(alloc.draw_handle(), max_level);
    }

    /// Runs a registered reinterpreter over the given rectangles.
    pub fn reinterpret(
        &mut self,
        src: &Surface,
        src_rect: rupica_common::rect::Rect<u32>,
        dst: &Surface,
        dst_rect: rupica_common::rect::Rect<u32>,
    ) -> bool {
        let (Some(src_alloc), Some(dst_alloc)) = (&src.alloc, &dst.alloc) else {
            return false;
        };
        self.backend.reinterpret(
            src_alloc.draw_handle(),
            src_rect,
            src.params.pixel_format,
            dst_alloc.draw_handle(),
            dst_rect,
            dst.params.pixel_format,
        )
    }

    /// Writes staged pixels into the unscaled texture, then scales up into
    /// the drawn texture if one exists.
    pub fn upload(&mut self, surface: &Surface, upload: &BufferTextureCopy, staging: &StagingData) {
        let Some(alloc) = &surface.alloc else {
            return;
        };
        let data = &self.staging_buffer
            [staging.offset as usize..(staging.offset + staging.size) as usize];
        self.backend
            .upload(alloc.texture, upload.texture_level, upload.texture_rect, data);

        if let Some(scaled) = alloc.scaled {
            let scale = u32::from(alloc.res_scale);
            let blit = TextureBlit {
                src_level: upload.texture_level,
                dst_level: upload.texture_level,
                src_rect: upload.texture_rect,
                dst_rect: upload.texture_rect * scale,
                ..Default::default()
            };
            self.backend.blit(alloc.texture, scaled, &blit);
        }
    }

    /// Scales the drawn texture down into the unscaled one if needed, then
    /// reads the rectangle back into staging. The encode step afterwards
    /// always runs on unscaled pixels.
    pub fn download(
        &mut self,
        surface: &Surface,
        download: &BufferTextureCopy,
        staging: &StagingData,
    ) {
        let Some(alloc) = &surface.alloc else {
            return;
        };
        if let Some(scaled) = alloc.scaled {
            let scale = u32::from(alloc.res_scale);
            let blit = TextureBlit {
                src_level: download.texture_level,
                dst_level: download.texture_level,
                src_rect: download.texture_rect * scale,
                dst_rect: download.texture_rect,
                ..Default::default()
            };
            self.backend.blit(scaled, alloc.texture, &blit);
        }
        let data = &mut self.staging_buffer
            [staging.offset as usize..(staging.offset + staging.size) as usize];
        self.backend
            .download(alloc.texture, download.texture_level, download.texture_rect, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::backend::software::SoftwareBackend;

    fn runtime() -> TextureRuntime {
        TextureRuntime::new(Box::new(SoftwareBackend::new()), TextureFilter::None)
    }

    #[test]
    fn test_format_tuples() {
        assert_eq!(get_format_tuple(PixelFormat::Rgb565).format, HostFormat::Rgb565);
        assert_eq!(get_format_tuple(PixelFormat::D24).format, HostFormat::D24);
        assert_eq!(get_format_tuple(PixelFormat::D24).bytes_per_texel, 4);
        // Texture formats share the RGBA8 tuple.
        assert_eq!(get_format_tuple(PixelFormat::I4).format, HostFormat::Rgba8);
    }

    #[test]
    fn test_allocate_and_recycle() {
        let mut rt = runtime();
        let alloc = rt
            .allocate(PixelFormat::Rgba8, TextureType::Texture2D, 32, 32, 1, 1)
            .unwrap();
        let handle = alloc.texture;
        rt.recycle(alloc);
        // Same shape: the recycled texture comes back.
        let again = rt
            .allocate(PixelFormat::Rgba8, TextureType::Texture2D, 32, 32, 1, 1)
            .unwrap();
        assert_eq!(again.texture, handle);
        // Different shape: fresh allocation.
        let other = rt
            .allocate(PixelFormat::Rgba8, TextureType::Texture2D, 64, 32, 1, 1)
            .unwrap();
        assert_ne!(other.texture, handle);
    }

    #[test]
    fn test_scaled_allocation() {
        let mut rt = runtime();
        let alloc = rt
            .allocate(PixelFormat::Rgba8, TextureType::Texture2D, 16, 16, 1, 2)
            .unwrap();
        assert!(alloc.scaled.is_some());
        assert_ne!(alloc.draw_handle(), alloc.texture);
    }

    #[test]
    fn test_staging_grows() {
        let mut rt = runtime();
        let a = rt.find_staging(64, true);
        assert_eq!(rt.staging(&a).len(), 64);
        let b = rt.find_staging(256, false);
        assert_eq!(rt.staging(&b).len(), 256);
    }

    #[test]
    fn test_reinterpreter_registry() {
        let rt = runtime();
        let into_rgba8 = rt.reinterpreters_for(PixelFormat::Rgba8);
        assert_eq!(into_rgba8.len(), 1);
        assert_eq!(into_rgba8[0].src_format, PixelFormat::D24S8);
        assert!(rt.reinterpreters_for(PixelFormat::D16).is_empty());
    }
}
