// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU texture backend abstraction.
//!
//! The texture runtime drives one of these; the software backend keeps real
//! pixel storage so the cache is fully exercisable without a device.

pub mod software;

use rupica_common::rect::Rect;

use super::pixel_format::{PixelFormat, TextureType};
use super::texture_runtime::FormatTuple;
use super::utils::{TextureBlit, TextureClear, TextureCopy};

/// Opaque handle to a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Trait for texture backends.
///
/// All rectangles use the bottom-left origin convention. Operations return
/// `false` on unsupported requests; the cache treats that as "did nothing".
pub trait TextureBackend {
    fn name(&self) -> &str;

    /// Creates a texture; `None` reports an allocation failure.
    fn create_texture(
        &mut self,
        tuple: FormatTuple,
        texture_type: TextureType,
        width: u32,
        height: u32,
        levels: u32,
    ) -> Option<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Fills a rectangle of one level with a typed clear value.
    fn clear(&mut self, texture: TextureHandle, clear: &TextureClear) -> bool;

    /// Exact pixel copy; also used for 2D -> cube face copies via
    /// `dst_layer`.
    fn copy(&mut self, src: TextureHandle, dst: TextureHandle, copy: &TextureCopy) -> bool;

    /// Stretched copy; a source rect with `top < bottom` flips vertically.
    fn blit(&mut self, src: TextureHandle, dst: TextureHandle, blit: &TextureBlit) -> bool;

    /// Regenerates levels `1..=max_level` from level 0.
    fn generate_mipmaps(&mut self, texture: TextureHandle, max_level: u32);

    /// Writes packed rows (bottom-up) into a rectangle of a level.
    fn upload(&mut self, texture: TextureHandle, level: u32, rect: Rect<u32>, data: &[u8]);

    /// Reads packed rows (bottom-up) from a rectangle of a level.
    fn download(&self, texture: TextureHandle, level: u32, rect: Rect<u32>, data: &mut [u8]);

    /// Reads `src` as `src_format` and rewrites the bits into `dst` as
    /// `dst_format`, preserving the guest bit pattern.
    fn reinterpret(
        &mut self,
        src: TextureHandle,
        src_rect: Rect<u32>,
        src_format: PixelFormat,
        dst: TextureHandle,
        dst_rect: Rect<u32>,
        dst_format: PixelFormat,
    ) -> bool;
}
