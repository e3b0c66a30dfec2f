// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

/// Texture filtering mode applied when surfaces are upscaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFilter {
    /// No filtering; textures keep their native resolution.
    None,
    NearestNeighbor,
    Bilinear,
}

/// Video settings snapshot, populated from config INI.
///
/// The rasterizer cache receives a copy at construction and never reads
/// global state; runtime changes are delivered through explicit
/// update requests at frame boundaries.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// Host upscale factor applied to framebuffer surfaces.
    pub resolution_factor: u32,
    pub texture_filter: TextureFilter,

    // Custom textures
    pub custom_textures: bool,
    pub dump_textures: bool,
    pub preload_textures: bool,
    /// PNG replacements are stored top-down and must be flipped on load.
    pub flip_custom_png: bool,

    /// Mobile GL backends consume RGBA8/RGB8 in swapped byte order.
    pub byte_swap_color_formats: bool,

    /// Root of the user data directory (`load/`, `dump/` live below it).
    pub user_dir: PathBuf,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution_factor: 1,
            texture_filter: TextureFilter::None,
            custom_textures: false,
            dump_textures: false,
            preload_textures: false,
            flip_custom_png: true,
            byte_swap_color_formats: false,
            user_dir: PathBuf::from("user"),
        }
    }
}

impl TextureFilter {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "nearest" => Self::NearestNeighbor,
            "2" | "bilinear" => Self::Bilinear,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_str() {
        assert_eq!(
            TextureFilter::from_str_or_default("nearest"),
            TextureFilter::NearestNeighbor
        );
        assert_eq!(
            TextureFilter::from_str_or_default("junk"),
            TextureFilter::None
        );
    }

    #[test]
    fn test_defaults() {
        let s = VideoSettings::default();
        assert_eq!(s.resolution_factor, 1);
        assert!(!s.custom_textures);
    }
}
