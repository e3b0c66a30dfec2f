// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software texture backend.
//!
//! Keeps every texture as plain byte arrays, one per layer and level, with
//! row 0 at the bottom to match the rectangle convention. Blits sample
//! nearest; that is enough for the cache's own copies and for tests to
//! observe real pixel movement.

use std::collections::HashMap;

use rupica_common::rect::Rect;

use super::super::pixel_format::{PixelFormat, TextureType};
use super::super::texture_runtime::{FormatTuple, HostFormat};
use super::super::utils::{ClearValue, TextureBlit, TextureClear, TextureCopy};
use super::{TextureBackend, TextureHandle};

struct SoftwareTexture {
    tuple: FormatTuple,
    width: u32,
    height: u32,
    levels: u32,
    /// Pixel data indexed `[layer][level]`.
    layers: Vec<Vec<Vec<u8>>>,
}

impl SoftwareTexture {
    fn level_dims(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

#[derive(Default)]
pub struct SoftwareBackend {
    textures: HashMap<u64, SoftwareTexture>,
    next_handle: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn texture(&self, handle: TextureHandle) -> &SoftwareTexture {
        self.textures.get(&handle.0).expect("unknown texture handle")
    }

    /// Packs a typed clear value into one texel of the tuple's format.
    fn pack_clear(tuple: FormatTuple, value: &ClearValue) -> Vec<u8> {
        let to_bits = |c: f32, bits: u32| -> u16 {
            let max = (1u32 << bits) - 1;
            (c.clamp(0.0, 1.0) * max as f32).round() as u16
        };
        let [r, g, b, a] = value.color;
        match tuple.format {
            HostFormat::Rgba8 => vec![
                to_bits(r, 8) as u8,
                to_bits(g, 8) as u8,
                to_bits(b, 8) as u8,
                to_bits(a, 8) as u8,
            ],
            HostFormat::Rgb8 => vec![
                to_bits(r, 8) as u8,
                to_bits(g, 8) as u8,
                to_bits(b, 8) as u8,
            ],
            HostFormat::Rgb5A1 => {
                let v = (to_bits(r, 5) << 11)
                    | (to_bits(g, 5) << 6)
                    | (to_bits(b, 5) << 1)
                    | to_bits(a, 1);
                v.to_le_bytes().to_vec()
            }
            HostFormat::Rgb565 => {
                let v = (to_bits(r, 5) << 11) | (to_bits(g, 6) << 5) | to_bits(b, 5);
                v.to_le_bytes().to_vec()
            }
            HostFormat::Rgba4 => {
                let v = (to_bits(r, 4) << 12)
                    | (to_bits(g, 4) << 8)
                    | (to_bits(b, 4) << 4)
                    | to_bits(a, 4);
                v.to_le_bytes().to_vec()
            }
            HostFormat::D16 => {
                let v = (value.depth.clamp(0.0, 1.0) * 65535.0).round() as u16;
                v.to_le_bytes().to_vec()
            }
            HostFormat::D24 => {
                let v = (value.depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                v.to_le_bytes().to_vec()
            }
            HostFormat::D24S8 => {
                let depth = (value.depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                let v = depth | (u32::from(value.stencil) << 24);
                v.to_le_bytes().to_vec()
            }
        }
    }
}

/// Visits every destination texel of `dst_rect` with the nearest source
/// texel of `src_rect`. Rectangles with `top < bottom` flip vertically.
fn for_each_mapped_texel(
    dst_rect: Rect<u32>,
    src_rect: Rect<u32>,
    mut f: impl FnMut(u32, u32, u32, u32),
) {
    let (mut dst_rect, mut src_rect) = (dst_rect, src_rect);
    if dst_rect.top < dst_rect.bottom {
        dst_rect = dst_rect.flipped();
        src_rect = src_rect.flipped();
    }
    let dw = dst_rect.right - dst_rect.left;
    let dh = dst_rect.top - dst_rect.bottom;
    if dw == 0 || dh == 0 {
        return;
    }
    let sx0 = f64::from(src_rect.left);
    let sx1 = f64::from(src_rect.right);
    let sy0 = f64::from(src_rect.bottom);
    let sy1 = f64::from(src_rect.top);

    for j in 0..dh {
        let v = (f64::from(j) + 0.5) / f64::from(dh);
        let sy = (sy0 + v * (sy1 - sy0)).floor();
        let sy = sy.clamp(sy0.min(sy1), sy0.max(sy1) - 1.0) as u32;
        for i in 0..dw {
            let u = (f64::from(i) + 0.5) / f64::from(dw);
            let sx = (sx0 + u * (sx1 - sx0)).floor();
            let sx = sx.clamp(sx0.min(sx1), sx0.max(sx1) - 1.0) as u32;
            f(dst_rect.left + i, dst_rect.bottom + j, sx, sy);
        }
    }
}

impl TextureBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn create_texture(
        &mut self,
        tuple: FormatTuple,
        texture_type: TextureType,
        width: u32,
        height: u32,
        levels: u32,
    ) -> Option<TextureHandle> {
        if width == 0 || height == 0 || levels == 0 {
            return None;
        }
        let layer_count = match texture_type {
            TextureType::Texture2D => 1,
            TextureType::CubeMap => 6,
        };
        let layers = (0..layer_count)
            .map(|_| {
                (0..levels)
                    .map(|level| {
                        let w = (width >> level).max(1) as usize;
                        let h = (height >> level).max(1) as usize;
                        vec![0u8; w * h * tuple.bytes_per_texel as usize]
                    })
                    .collect()
            })
            .collect();

        self.next_handle += 1;
        let handle = TextureHandle(self.next_handle);
        self.textures.insert(
            handle.0,
            SoftwareTexture {
                tuple,
                width,
                height,
                levels,
                layers,
            },
        );
        Some(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn clear(&mut self, texture: TextureHandle, clear: &TextureClear) -> bool {
        let tex = self.textures.get_mut(&texture.0).expect("unknown texture");
        let texel = Self::pack_clear(tex.tuple, &clear.value);
        let bpt = tex.tuple.bytes_per_texel as usize;
        let (w, _) = tex.level_dims(clear.texture_level);
        let rect = clear.texture_rect;
        for layer in &mut tex.layers {
            let data = &mut layer[clear.texture_level as usize];
            for y in rect.bottom..rect.top {
                for x in rect.left..rect.right {
                    let off = (y * w + x) as usize * bpt;
                    data[off..off + bpt].copy_from_slice(&texel);
                }
            }
        }
        true
    }

    fn copy(&mut self, src: TextureHandle, dst: TextureHandle, copy: &TextureCopy) -> bool {
        let src_tex = self.texture(src);
        let (src_w, src_h) = src_tex.level_dims(copy.src_level);
        {
            let dst_tex = self.texture(dst);
            let (dst_w, dst_h) = dst_tex.level_dims(copy.dst_level);
            if copy.src_offset.x + copy.extent.width > src_w
                || copy.src_offset.y + copy.extent.height > src_h
                || copy.dst_offset.x + copy.extent.width > dst_w
                || copy.dst_offset.y + copy.extent.height > dst_h
            {
                log::warn!("Out-of-bounds texture copy rejected");
                return false;
            }
        }
        let bpt = src_tex.tuple.bytes_per_texel as usize;
        let src_data = &src_tex.layers[copy.src_layer as usize][copy.src_level as usize];

        // Gather the source rows first; src and dst may be the same texture.
        let mut rows: Vec<Vec<u8>> = Vec::with_capacity(copy.extent.height as usize);
        for y in 0..copy.extent.height {
            let off = ((copy.src_offset.y + y) * src_w + copy.src_offset.x) as usize * bpt;
            rows.push(src_data[off..off + copy.extent.width as usize * bpt].to_vec());
        }

        let dst_tex = self.textures.get_mut(&dst.0).expect("unknown texture");
        let (dst_w, _) = dst_tex.level_dims(copy.dst_level);
        let dst_bpt = dst_tex.tuple.bytes_per_texel as usize;
        if dst_bpt != bpt {
            return false;
        }
        let dst_data = &mut dst_tex.layers[copy.dst_layer as usize][copy.dst_level as usize];
        for (y, row) in rows.iter().enumerate() {
            let off =
                ((copy.dst_offset.y + y as u32) * dst_w + copy.dst_offset.x) as usize * dst_bpt;
            dst_data[off..off + row.len()].copy_from_slice(row);
        }
        true
    }

    fn blit(&mut self, src: TextureHandle, dst: TextureHandle, blit: &TextureBlit) -> bool {
        let src_tex = self.texture(src);
        let (src_w, src_h) = src_tex.level_dims(blit.src_level);
        {
            let dst_tex = self.texture(dst);
            let (dst_w, dst_h) = dst_tex.level_dims(blit.dst_level);
            let sr = blit.src_rect;
            let dr = blit.dst_rect;
            if sr.right > src_w
                || sr.top.max(sr.bottom) > src_h
                || dr.right > dst_w
                || dr.top.max(dr.bottom) > dst_h
            {
                log::warn!("Out-of-bounds texture blit rejected");
                return false;
            }
        }
        let bpt = src_tex.tuple.bytes_per_texel as usize;
        let src_data = src_tex.layers[blit.src_layer as usize][blit.src_level as usize].clone();

        let dst_tex = self.textures.get_mut(&dst.0).expect("unknown texture");
        let (dst_w, _) = dst_tex.level_dims(blit.dst_level);
        if dst_tex.tuple.bytes_per_texel as usize != bpt {
            return false;
        }
        let dst_data = &mut dst_tex.layers[blit.dst_layer as usize][blit.dst_level as usize];
        for_each_mapped_texel(blit.dst_rect, blit.src_rect, |dx, dy, sx, sy| {
            let src_off = (sy * src_w + sx) as usize * bpt;
            let dst_off = (dy * dst_w + dx) as usize * bpt;
            dst_data[dst_off..dst_off + bpt].copy_from_slice(&src_data[src_off..src_off + bpt]);
        });
        true
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle, max_level: u32) {
        let tex = self.textures.get_mut(&texture.0).expect("unknown texture");
        let bpt = tex.tuple.bytes_per_texel as usize;
        let max_level = max_level.min(tex.levels - 1);
        let (width, height) = (tex.width, tex.height);
        for layer in &mut tex.layers {
            for level in 1..=max_level {
                let (pw, _) = (
                    (width >> (level - 1)).max(1),
                    (height >> (level - 1)).max(1),
                );
                let (w, h) = ((width >> level).max(1), (height >> level).max(1));
                let parent = layer[(level - 1) as usize].clone();
                let data = &mut layer[level as usize];
                for y in 0..h {
                    for x in 0..w {
                        let src_off = ((y * 2) * pw + x * 2) as usize * bpt;
                        let dst_off = (y * w + x) as usize * bpt;
                        data[dst_off..dst_off + bpt]
                            .copy_from_slice(&parent[src_off..src_off + bpt]);
                    }
                }
            }
        }
    }

    fn upload(&mut self, texture: TextureHandle, level: u32, rect: Rect<u32>, data: &[u8]) {
        let tex = self.textures.get_mut(&texture.0).expect("unknown texture");
        let (w, _) = tex.level_dims(level);
        let bpt = tex.tuple.bytes_per_texel as usize;
        let row_bytes = rect.width() as usize * bpt;
        let dst = &mut tex.layers[0][level as usize];
        for (r, y) in (rect.bottom..rect.top).enumerate() {
            let off = (y * w + rect.left) as usize * bpt;
            dst[off..off + row_bytes].copy_from_slice(&data[r * row_bytes..(r + 1) * row_bytes]);
        }
    }

    fn download(&self, texture: TextureHandle, level: u32, rect: Rect<u32>, data: &mut [u8]) {
        let tex = self.texture(texture);
        let (w, _) = tex.level_dims(level);
        let bpt = tex.tuple.bytes_per_texel as usize;
        let row_bytes = rect.width() as usize * bpt;
        let src = &tex.layers[0][level as usize];
        for (r, y) in (rect.bottom..rect.top).enumerate() {
            let off = (y * w + rect.left) as usize * bpt;
            data[r * row_bytes..(r + 1) * row_bytes].copy_from_slice(&src[off..off + row_bytes]);
        }
    }

    fn reinterpret(
        &mut self,
        src: TextureHandle,
        src_rect: Rect<u32>,
        src_format: PixelFormat,
        dst: TextureHandle,
        dst_rect: Rect<u32>,
        dst_format: PixelFormat,
    ) -> bool {
        let src_tex = self.texture(src);
        let src_w = src_tex.width;
        let src_bpt = src_tex.tuple.bytes_per_texel as usize;
        let src_data = src_tex.layers[0][0].clone();

        let dst_tex = self.textures.get_mut(&dst.0).expect("unknown texture");
        let dst_w = dst_tex.width;
        let dst_bpt = dst_tex.tuple.bytes_per_texel as usize;
        let dst_data = &mut dst_tex.layers[0][0];

        match (src_format, dst_format) {
            (PixelFormat::D24S8, PixelFormat::Rgba8) => {
                for_each_mapped_texel(dst_rect, src_rect, |dx, dy, sx, sy| {
                    let s = (sy * src_w + sx) as usize * src_bpt;
                    let d = (dy * dst_w + dx) as usize * dst_bpt;
                    // Guest D24S8 bytes are [d0, d1, d2, s]; the same guest
                    // bytes read as RGBA8 are [A, B, G, R], so the host RGBA
                    // texel becomes [s, d2, d1, d0].
                    let texel = [
                        src_data[s + 3],
                        src_data[s + 2],
                        src_data[s + 1],
                        src_data[s],
                    ];
                    dst_data[d..d + 4].copy_from_slice(&texel);
                });
                true
            }
            (PixelFormat::Rgba4, PixelFormat::Rgb5A1) => {
                // Both sides are raw 16-bit words on the host; reinterpreting
                // is a bit-for-bit copy.
                for_each_mapped_texel(dst_rect, src_rect, |dx, dy, sx, sy| {
                    let s = (sy * src_w + sx) as usize * src_bpt;
                    let d = (dy * dst_w + dx) as usize * dst_bpt;
                    dst_data[d..d + 2].copy_from_slice(&src_data[s..s + 2]);
                });
                true
            }
            _ => {
                log::warn!(
                    "No software reinterpreter for {} -> {}",
                    src_format.name(),
                    dst_format.name()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::texture_runtime::get_format_tuple;

    fn rgba_tuple() -> FormatTuple {
        get_format_tuple(PixelFormat::Rgba8)
    }

    #[test]
    fn test_upload_download_round_trip() {
        let mut backend = SoftwareBackend::new();
        let tex = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 4, 4, 1)
            .unwrap();
        let data: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        backend.upload(tex, 0, Rect::new(0, 4, 4, 0), &data);
        let mut read = vec![0u8; data.len()];
        backend.download(tex, 0, Rect::new(0, 4, 4, 0), &mut read);
        assert_eq!(read, data);
    }

    #[test]
    fn test_clear_scissored() {
        let mut backend = SoftwareBackend::new();
        let tex = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 4, 4, 1)
            .unwrap();
        let clear = TextureClear {
            texture_level: 0,
            texture_rect: Rect::new(1, 3, 3, 1),
            value: ClearValue {
                color: [1.0, 0.0, 0.0, 1.0],
                ..Default::default()
            },
        };
        backend.clear(tex, &clear);
        let mut read = vec![0u8; 4 * 4 * 4];
        backend.download(tex, 0, Rect::new(0, 4, 4, 0), &mut read);
        // Inside the scissor.
        assert_eq!(&read[(1 * 4 + 1) * 4..(1 * 4 + 1) * 4 + 4], &[255, 0, 0, 255]);
        // Outside stays untouched.
        assert_eq!(&read[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_blit_flip() {
        let mut backend = SoftwareBackend::new();
        let src = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 2, 2, 1)
            .unwrap();
        let dst = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 2, 2, 1)
            .unwrap();
        // Bottom row red, top row green.
        backend.upload(
            src,
            0,
            Rect::new(0, 2, 2, 0),
            &[
                255, 0, 0, 255, 255, 0, 0, 255, // bottom
                0, 255, 0, 255, 0, 255, 0, 255, // top
            ],
        );
        let blit = TextureBlit {
            src_rect: Rect::new(0, 0, 2, 2), // flipped source
            dst_rect: Rect::new(0, 2, 2, 0),
            ..Default::default()
        };
        backend.blit(src, dst, &blit);
        let mut read = vec![0u8; 2 * 2 * 4];
        backend.download(dst, 0, Rect::new(0, 2, 2, 0), &mut read);
        // Rows swapped: bottom is now green.
        assert_eq!(&read[0..4], &[0, 255, 0, 255]);
        assert_eq!(&read[8..12], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_blit_upscale() {
        let mut backend = SoftwareBackend::new();
        let src = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 1, 1, 1)
            .unwrap();
        let dst = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 4, 4, 1)
            .unwrap();
        backend.upload(src, 0, Rect::new(0, 1, 1, 0), &[9, 8, 7, 6]);
        let blit = TextureBlit {
            src_rect: Rect::new(0, 1, 1, 0),
            dst_rect: Rect::new(0, 4, 4, 0),
            ..Default::default()
        };
        backend.blit(src, dst, &blit);
        let mut read = vec![0u8; 4 * 4 * 4];
        backend.download(dst, 0, Rect::new(0, 4, 4, 0), &mut read);
        assert!(read.chunks(4).all(|texel| texel == [9, 8, 7, 6]));
    }

    #[test]
    fn test_copy_to_cube_face() {
        let mut backend = SoftwareBackend::new();
        let src = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 2, 2, 1)
            .unwrap();
        let cube = backend
            .create_texture(rgba_tuple(), TextureType::CubeMap, 2, 2, 1)
            .unwrap();
        backend.upload(src, 0, Rect::new(0, 2, 2, 0), &[1u8; 16]);
        let copy = TextureCopy {
            dst_layer: 3,
            extent: crate::rasterizer_cache::utils::Extent {
                width: 2,
                height: 2,
            },
            ..Default::default()
        };
        assert!(backend.copy(src, cube, &copy));
        let face = backend.texture(cube).layers[3][0].clone();
        assert_eq!(face, vec![1u8; 16]);
    }

    #[test]
    fn test_reinterpret_d24s8_to_rgba8() {
        let mut backend = SoftwareBackend::new();
        let d24s8 = backend
            .create_texture(
                get_format_tuple(PixelFormat::D24S8),
                TextureType::Texture2D,
                1,
                1,
                1,
            )
            .unwrap();
        let rgba = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 1, 1, 1)
            .unwrap();
        backend.upload(d24s8, 0, Rect::new(0, 1, 1, 0), &[0x11, 0x22, 0x33, 0x44]);
        assert!(backend.reinterpret(
            d24s8,
            Rect::new(0, 1, 1, 0),
            PixelFormat::D24S8,
            rgba,
            Rect::new(0, 1, 1, 0),
            PixelFormat::Rgba8,
        ));
        let mut read = vec![0u8; 4];
        backend.download(rgba, 0, Rect::new(0, 1, 1, 0), &mut read);
        assert_eq!(read, vec![0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_generate_mipmaps() {
        let mut backend = SoftwareBackend::new();
        let tex = backend
            .create_texture(rgba_tuple(), TextureType::Texture2D, 4, 4, 3)
            .unwrap();
        backend.upload(tex, 0, Rect::new(0, 4, 4, 0), &[5u8; 4 * 4 * 4]);
        backend.generate_mipmaps(tex, 2);
        let mut level2 = vec![0u8; 4];
        backend.download(tex, 2, Rect::new(0, 1, 1, 0), &mut level2);
        assert_eq!(level2, vec![5u8; 4]);
    }
}
