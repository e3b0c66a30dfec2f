// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pure conversion between guest pixel storage and the canonical host
//! layout.
//!
//! Guest surfaces are either linear or tiled in 8x8 Morton order. Decoding
//! produces the host layout described by `bytes_per_pixel`: color and depth
//! formats stay packed (D24 padded to 4 bytes), texture formats expand to
//! RGBA8. The compressed ETC1 family has no entry here; callers get a logged
//! error and unchanged output, mirroring a missing table entry.
//!
//! `convert` selects the mobile byte-order variant for RGBA8/RGB8, which
//! consumes the raw guest order instead of the swapped canonical one.

use rupica_common::types::PAddr;

use super::pixel_format::PixelFormat;
use super::surface_params::SurfaceParams;

/// Morton (Z-order) offset of a texel within an 8x8 tile.
#[inline]
const fn morton_interleave(x: u32, y: u32) -> u32 {
    let mut offset = 0;
    let mut bit = 0;
    while bit < 3 {
        offset |= ((x >> bit) & 1) << (2 * bit);
        offset |= ((y >> bit) & 1) << (2 * bit + 1);
        bit += 1;
    }
    offset
}

/// Whether a decode path exists for the format/layout pair.
pub fn can_decode(format: PixelFormat, is_tiled: bool) -> bool {
    match format {
        PixelFormat::Etc1 | PixelFormat::Etc1A4 | PixelFormat::Invalid => false,
        // 4-bit formats only exist tiled.
        PixelFormat::I4 | PixelFormat::A4 => is_tiled,
        _ => true,
    }
}

/// Whether an encode path exists. Texture formats are never written back:
/// they cannot be render targets, so nothing marks them dirty.
pub fn can_encode(format: PixelFormat, _is_tiled: bool) -> bool {
    use super::pixel_format::SurfaceType;
    matches!(
        format.surface_type(),
        SurfaceType::Color | SurfaceType::Depth | SurfaceType::DepthStencil
    )
}

fn decode_texel(format: PixelFormat, src: &[u8], dst: &mut [u8], convert: bool) {
    match format {
        PixelFormat::Rgba8 => {
            if convert {
                dst[..4].copy_from_slice(&src[..4]);
            } else {
                // Guest order is A, B, G, R.
                dst[0] = src[3];
                dst[1] = src[2];
                dst[2] = src[1];
                dst[3] = src[0];
            }
        }
        PixelFormat::Rgb8 => {
            if convert {
                dst[..3].copy_from_slice(&src[..3]);
            } else {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
            }
        }
        PixelFormat::Rgb5A1 | PixelFormat::Rgb565 | PixelFormat::Rgba4 | PixelFormat::D16 => {
            dst[..2].copy_from_slice(&src[..2]);
        }
        PixelFormat::Ia8 => {
            let a = src[0];
            let i = src[1];
            dst[..4].copy_from_slice(&[i, i, i, a]);
        }
        PixelFormat::Rg8 => {
            dst[..4].copy_from_slice(&[src[1], src[0], 0, 255]);
        }
        PixelFormat::I8 => {
            let i = src[0];
            dst[..4].copy_from_slice(&[i, i, i, 255]);
        }
        PixelFormat::A8 => {
            dst[..4].copy_from_slice(&[0, 0, 0, src[0]]);
        }
        PixelFormat::Ia4 => {
            let i = expand4(src[0] >> 4);
            let a = expand4(src[0] & 0xF);
            dst[..4].copy_from_slice(&[i, i, i, a]);
        }
        PixelFormat::D24 => {
            dst[0] = src[0];
            dst[1] = src[1];
            dst[2] = src[2];
            dst[3] = 0;
        }
        PixelFormat::D24S8 => {
            dst[..4].copy_from_slice(&src[..4]);
        }
        _ => unreachable!("no decoder for {}", format.name()),
    }
}

/// Decoder for the 4-bit formats; `nibble` is the raw texel value.
fn decode_texel_4bit(format: PixelFormat, nibble: u8) -> [u8; 4] {
    let v = expand4(nibble);
    match format {
        PixelFormat::I4 => [v, v, v, 255],
        PixelFormat::A4 => [0, 0, 0, v],
        _ => unreachable!("no 4-bit decoder for {}", format.name()),
    }
}

fn encode_texel(format: PixelFormat, src: &[u8], dst: &mut [u8], convert: bool) {
    match format {
        PixelFormat::Rgba8 => {
            if convert {
                dst[..4].copy_from_slice(&src[..4]);
            } else {
                dst[0] = src[3];
                dst[1] = src[2];
                dst[2] = src[1];
                dst[3] = src[0];
            }
        }
        PixelFormat::Rgb8 => {
            if convert {
                dst[..3].copy_from_slice(&src[..3]);
            } else {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
            }
        }
        PixelFormat::Rgb5A1 | PixelFormat::Rgb565 | PixelFormat::Rgba4 | PixelFormat::D16 => {
            dst[..2].copy_from_slice(&src[..2]);
        }
        PixelFormat::D24 => {
            dst[0] = src[0];
            dst[1] = src[1];
            dst[2] = src[2];
        }
        PixelFormat::D24S8 => {
            dst[..4].copy_from_slice(&src[..4]);
        }
        _ => unreachable!("no encoder for {}", format.name()),
    }
}

#[inline]
fn expand4(v: u8) -> u8 {
    v * 17
}

#[inline]
fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}

#[inline]
fn expand6(v: u16) -> u8 {
    ((v << 2) | (v >> 4)) as u8
}

/// Resolves a fill pattern (or any single texel) to an RGBA8 color.
/// Used to derive clear colors; depth formats do not come through here.
pub fn lookup_texel(format: PixelFormat, data: &[u8; 4]) -> [u8; 4] {
    match format {
        PixelFormat::Rgba8 => [data[3], data[2], data[1], data[0]],
        PixelFormat::Rgb8 => [data[2], data[1], data[0], 255],
        PixelFormat::Rgb5A1 => {
            let v = u16::from_le_bytes([data[0], data[1]]);
            [
                expand5((v >> 11) & 0x1F),
                expand5((v >> 6) & 0x1F),
                expand5((v >> 1) & 0x1F),
                if v & 1 != 0 { 255 } else { 0 },
            ]
        }
        PixelFormat::Rgb565 => {
            let v = u16::from_le_bytes([data[0], data[1]]);
            [
                expand5((v >> 11) & 0x1F),
                expand6((v >> 5) & 0x3F),
                expand5(v & 0x1F),
                255,
            ]
        }
        PixelFormat::Rgba4 => {
            let v = u16::from_le_bytes([data[0], data[1]]);
            [
                expand4(((v >> 12) & 0xF) as u8),
                expand4(((v >> 8) & 0xF) as u8),
                expand4(((v >> 4) & 0xF) as u8),
                expand4((v & 0xF) as u8),
            ]
        }
        PixelFormat::Ia8 => {
            let i = data[1];
            [i, i, i, data[0]]
        }
        PixelFormat::Rg8 => [data[1], data[0], 0, 255],
        PixelFormat::I8 => {
            let i = data[0];
            [i, i, i, 255]
        }
        PixelFormat::A8 => [0, 0, 0, data[0]],
        PixelFormat::Ia4 => {
            let i = expand4(data[0] >> 4);
            [i, i, i, expand4(data[0] & 0xF)]
        }
        PixelFormat::I4 => {
            let i = expand4(data[0] & 0xF);
            [i, i, i, 255]
        }
        PixelFormat::A4 => [0, 0, 0, expand4(data[0] & 0xF)],
        _ => {
            log::error!("No texel lookup for pixel format {}", format.name());
            [0, 0, 0, 255]
        }
    }
}

/// Decodes guest bytes covering `[start, end)` of `info` into the canonical
/// host layout. `info` must describe packed rows (`width == stride`) or a
/// single row; `source` spans exactly `end - start` guest bytes.
pub fn decode_texture(
    info: &SurfaceParams,
    start: PAddr,
    end: PAddr,
    source: &[u8],
    dest: &mut [u8],
    convert: bool,
) {
    let format = info.pixel_format;
    if !can_decode(format, info.is_tiled) {
        log::error!(
            "Unimplemented texture decode for pixel format {}, tiled = {}",
            format.name(),
            info.is_tiled
        );
        return;
    }
    debug_assert!(start >= info.addr && end <= info.end);
    debug_assert!(source.len() >= (end - start) as usize);

    let dbpp = format.bytes_per_pixel() as usize;
    if info.is_tiled {
        let bpp_bits = info.format_bpp();
        let width = info.width;
        let rows = info.pixels_in_bytes(end - start) / width;
        debug_assert!(width % 8 == 0 && rows % 8 == 0);
        let tiles_x = width / 8;

        for tile_row in 0..rows / 8 {
            for tile_x in 0..tiles_x {
                let tile_base_bits = (tile_row * tiles_x + tile_x) * 64 * bpp_bits;
                for py in 0..8 {
                    // Tiled data runs top-down; the host image is bottom-up.
                    let dst_row = (rows - 1 - (tile_row * 8 + py)) as usize;
                    for px in 0..8 {
                        let bit = tile_base_bits + morton_interleave(px, py) * bpp_bits;
                        let dst_off = (dst_row * width as usize + (tile_x * 8 + px) as usize) * dbpp;
                        let dst = &mut dest[dst_off..dst_off + dbpp];
                        if bpp_bits == 4 {
                            let byte = source[(bit / 8) as usize];
                            let nibble = if bit % 8 == 0 { byte & 0xF } else { byte >> 4 };
                            dst.copy_from_slice(&decode_texel_4bit(format, nibble));
                        } else {
                            decode_texel(format, &source[(bit / 8) as usize..], dst, convert);
                        }
                    }
                }
            }
        }
    } else {
        let gbpp = (info.format_bpp() / 8) as usize;
        let pixels = info.pixels_in_bytes(end - start) as usize;
        for i in 0..pixels {
            decode_texel(
                format,
                &source[i * gbpp..],
                &mut dest[i * dbpp..i * dbpp + dbpp],
                convert,
            );
        }
    }
}

/// Encodes canonical host bytes back into guest storage covering
/// `[start, end)` of `info`. Inverse of [`decode_texture`].
pub fn encode_texture(
    info: &SurfaceParams,
    start: PAddr,
    end: PAddr,
    source: &[u8],
    dest: &mut [u8],
    convert: bool,
) {
    let format = info.pixel_format;
    if !can_encode(format, info.is_tiled) {
        log::error!(
            "Unimplemented texture encode for pixel format {}, tiled = {}",
            format.name(),
            info.is_tiled
        );
        return;
    }
    debug_assert!(start >= info.addr && end <= info.end);
    debug_assert!(dest.len() >= (end - start) as usize);

    // `source` spans the full rectangle of `info`; `dest` spans only the
    // requested `[start, end)` guest bytes, which may start mid-surface.
    let dbpp = format.bytes_per_pixel() as usize;
    let start_off = (start - info.addr) as usize;
    let end_off = (end - info.addr) as usize;
    if info.is_tiled {
        let bpp_bits = info.format_bpp();
        let gbpp = (bpp_bits / 8) as usize;
        let width = info.width;
        let rows = info.height;
        debug_assert!(width % 8 == 0 && rows % 8 == 0);
        let tiles_x = width / 8;

        for tile_row in 0..rows / 8 {
            for tile_x in 0..tiles_x {
                let tile_base = ((tile_row * tiles_x + tile_x) * 64) as usize * gbpp;
                for py in 0..8 {
                    let src_row = (rows - 1 - (tile_row * 8 + py)) as usize;
                    for px in 0..8 {
                        let texel = morton_interleave(px, py) as usize;
                        let guest_off = tile_base + texel * gbpp;
                        if guest_off < start_off || guest_off + gbpp > end_off {
                            continue;
                        }
                        let src_off = (src_row * width as usize + (tile_x * 8 + px) as usize) * dbpp;
                        encode_texel(
                            format,
                            &source[src_off..],
                            &mut dest[guest_off - start_off..],
                            convert,
                        );
                    }
                }
            }
        }
    } else {
        let gbpp = (info.format_bpp() / 8) as usize;
        let first_pixel = start_off.div_ceil(gbpp);
        let last_pixel = end_off / gbpp;
        for i in first_pixel..last_pixel {
            encode_texel(
                format,
                &source[i * dbpp..],
                &mut dest[i * gbpp - start_off..],
                convert,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::pixel_format::PixelFormat;

    fn params(width: u32, height: u32, format: PixelFormat, is_tiled: bool) -> SurfaceParams {
        let mut p = SurfaceParams {
            addr: 0x1800_0000,
            width,
            height,
            pixel_format: format,
            is_tiled,
            ..Default::default()
        };
        p.update_params();
        p
    }

    #[test]
    fn test_morton_interleave() {
        assert_eq!(morton_interleave(0, 0), 0);
        assert_eq!(morton_interleave(1, 0), 1);
        assert_eq!(morton_interleave(0, 1), 2);
        assert_eq!(morton_interleave(1, 1), 3);
        assert_eq!(morton_interleave(2, 0), 4);
        assert_eq!(morton_interleave(7, 7), 63);
    }

    #[test]
    fn test_linear_rgba8_round_trip() {
        let info = params(8, 8, PixelFormat::Rgba8, false);
        let source: Vec<u8> = (0..info.size).map(|i| i as u8).collect();
        let mut decoded = vec![0u8; source.len()];
        decode_texture(&info, info.addr, info.end, &source, &mut decoded, false);
        // Canonical layout reverses the guest byte order per pixel.
        assert_eq!(&decoded[0..4], &[3, 2, 1, 0]);

        let mut encoded = vec![0u8; source.len()];
        encode_texture(&info, info.addr, info.end, &decoded, &mut encoded, false);
        assert_eq!(encoded, source);
    }

    #[test]
    fn test_tiled_rgb565_round_trip() {
        let info = params(16, 16, PixelFormat::Rgb565, true);
        let source: Vec<u8> = (0..info.size).map(|i| (i * 7) as u8).collect();
        let mut decoded = vec![0u8; (info.width * info.height * 2) as usize];
        decode_texture(&info, info.addr, info.end, &source, &mut decoded, false);
        let mut encoded = vec![0u8; source.len()];
        encode_texture(&info, info.addr, info.end, &decoded, &mut encoded, false);
        assert_eq!(encoded, source);
    }

    #[test]
    fn test_tiled_flip() {
        // One 8x8 tile; texel (0,0) of the tile is the top-left of the image
        // and must land on the top host row (row 7 bottom-up).
        let info = params(8, 8, PixelFormat::I8, true);
        let mut source = vec![0u8; 64];
        source[0] = 0xAA;
        let mut decoded = vec![0u8; 8 * 8 * 4];
        decode_texture(&info, info.addr, info.end, &source, &mut decoded, false);
        let top_left = (7 * 8) * 4;
        assert_eq!(decoded[top_left], 0xAA);
        assert_eq!(decoded[top_left + 3], 255);
        assert_eq!(decoded[0], 0);
    }

    #[test]
    fn test_i4_decode() {
        let info = params(8, 8, PixelFormat::I4, true);
        // First byte holds texels 0 and 1: low nibble first.
        let mut source = vec![0u8; 32];
        source[0] = 0xF1;
        let mut decoded = vec![0u8; 8 * 8 * 4];
        decode_texture(&info, info.addr, info.end, &source, &mut decoded, false);
        let texel0 = (7 * 8) * 4;
        let texel1 = (7 * 8 + 1) * 4;
        assert_eq!(decoded[texel0], 17);
        assert_eq!(decoded[texel1], 255);
    }

    #[test]
    fn test_partial_range_decode() {
        // Only the middle two rows of a linear surface.
        let info = params(8, 8, PixelFormat::Rgb565, false);
        let sub = info.from_interval(super::super::interval::SurfaceInterval::new(
            info.addr + 2 * 16,
            info.addr + 4 * 16,
        ));
        assert_eq!(sub.height, 2);
        let source = vec![0x33u8; (sub.end - sub.addr) as usize];
        let mut decoded = vec![0u8; (sub.width * sub.height * 2) as usize];
        decode_texture(&sub, sub.addr, sub.end, &source, &mut decoded, false);
        assert!(decoded.iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_etc1_is_rejected() {
        assert!(!can_decode(PixelFormat::Etc1, true));
        assert!(!can_encode(PixelFormat::I8, true));
        assert!(can_encode(PixelFormat::Rgb565, false));
    }

    #[test]
    fn test_lookup_texel_rgb565() {
        // Pure red in RGB565: 0xF800.
        let rgba = lookup_texel(PixelFormat::Rgb565, &[0x00, 0xF8, 0, 0]);
        assert_eq!(rgba, [255, 0, 0, 255]);
    }

    #[test]
    fn test_lookup_texel_rgb5a1_alpha() {
        // Alpha bit clear -> transparent.
        let rgba = lookup_texel(PixelFormat::Rgb5A1, &[0x00, 0x00, 0, 0]);
        assert_eq!(rgba[3], 0);
    }
}
