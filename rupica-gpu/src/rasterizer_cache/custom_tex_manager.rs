// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! User-supplied replacement textures and texture dumping.
//!
//! Replacement files live under
//! `<user>/load/textures/<program_id>/.../tex1_<W>x<H>_<hash>_<format>.<ext>`
//! keyed by a 64-bit hash of the decoded guest pixels. Decoding runs on a
//! worker pool; `DecodeState` transitions `None -> Pending -> Decoded` and
//! are the only cross-thread synchronisation point. Decode work is never
//! cancelled.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use rupica_common::hash::compute_hash_64;
use rupica_common::thread_worker::ThreadWorker;
use rupica_common::types::ProgramId;

use super::pixel_format::{PixelFormat, SurfaceType};
use super::surface_params::SurfaceParams;
use super::texture_codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomFileFormat {
    Png,
    Dds,
    Ktx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomPixelFormat {
    Rgba8,
    Bc1,
    Bc3,
    Bc5,
    Bc7,
    Astc4,
    Astc6,
    Astc8,
}

impl CustomPixelFormat {
    /// Compressed data is passed through to the GPU without CPU decode.
    pub fn is_compressed(self) -> bool {
        self != CustomPixelFormat::Rgba8
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(String),
    #[error("malformed {0} container")]
    Malformed(&'static str),
    #[error("unsupported compressed format {0:#X}")]
    UnsupportedFormat(u32),
}

/// Pixels (or pass-through compressed payload) of a replacement texture.
#[derive(Debug, Default)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: CustomPixelFormat,
    pub data: Vec<u8>,
}

impl Default for CustomPixelFormat {
    fn default() -> Self {
        CustomPixelFormat::Rgba8
    }
}

#[derive(Debug)]
pub enum DecodeState {
    None,
    Pending,
    Decoded(DecodedImage),
}

/// One replacement texture discovered on disk.
pub struct CustomTexture {
    pub hash: u64,
    pub path: PathBuf,
    pub file_format: CustomFileFormat,
    state: Mutex<DecodeState>,
    state_changed: Condvar,
}

impl CustomTexture {
    fn new(hash: u64, path: PathBuf, file_format: CustomFileFormat) -> Self {
        Self {
            hash,
            path,
            file_format,
            state: Mutex::new(DecodeState::None),
            state_changed: Condvar::new(),
        }
    }
}

/// Image codec boundary; the front-end may override it.
pub trait ImageInterface: Send + Sync {
    /// Decodes a PNG into RGBA8 pixels, top-down.
    fn decode_png(&self, data: &[u8]) -> Result<(Vec<u8>, u32, u32), DecodeError>;

    /// Encodes top-down RGBA8 pixels as PNG at `path`.
    fn encode_png(
        &self,
        path: &Path,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), DecodeError>;
}

/// Default implementation over the `image` crate.
pub struct DefaultImageInterface;

impl ImageInterface for DefaultImageInterface {
    fn decode_png(&self, data: &[u8]) -> Result<(Vec<u8>, u32, u32), DecodeError> {
        let image = image::load_from_memory_with_format(data, image::ImageFormat::Png)
            .map_err(|e| DecodeError::Image(e.to_string()))?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok((rgba.into_raw(), width, height))
    }

    fn encode_png(
        &self,
        path: &Path,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), DecodeError> {
        let image = image::RgbaImage::from_raw(width, height, pixels.to_vec())
            .ok_or(DecodeError::Malformed("rgba buffer"))?;
        image
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| DecodeError::Image(e.to_string()))
    }
}

/// Parses `tex1_<W>x<H>_<hex64>_<format>.<ext>`.
fn parse_texture_filename(name: &str) -> Option<(u64, CustomFileFormat)> {
    let rest = name.strip_prefix("tex1_")?;
    let (dims, rest) = rest.split_once('_')?;
    let (w, h) = dims.split_once('x')?;
    w.parse::<u32>().ok()?;
    h.parse::<u32>().ok()?;
    let (hash_str, rest) = rest.split_once('_')?;
    let hash = u64::from_str_radix(hash_str, 16).ok()?;
    let (format, ext) = rest.split_once('.')?;
    format.parse::<u32>().ok()?;
    let file_format = match ext.to_ascii_lowercase().as_str() {
        "png" => CustomFileFormat::Png,
        "dds" => CustomFileFormat::Dds,
        "ktx" => CustomFileFormat::Ktx,
        _ => {
            log::error!("Unknown file extension {ext}");
            return None;
        }
    };
    Some((hash, file_format))
}

fn is_pow2(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Parses a DDS container. Compressed payloads are returned as-is.
pub fn decode_dds(data: &[u8]) -> Result<DecodedImage, DecodeError> {
    if data.len() < 128 || &data[0..4] != b"DDS " {
        return Err(DecodeError::Malformed("dds"));
    }
    let mut cursor = Cursor::new(&data[4..]);
    let _size = cursor.read_u32::<LittleEndian>()?;
    let _flags = cursor.read_u32::<LittleEndian>()?;
    let height = cursor.read_u32::<LittleEndian>()?;
    let width = cursor.read_u32::<LittleEndian>()?;

    let pf_flags = u32::from_le_bytes(data[80..84].try_into().unwrap());
    let fourcc = &data[84..88];

    const DDPF_FOURCC: u32 = 0x4;
    let (format, data_offset) = if pf_flags & DDPF_FOURCC != 0 {
        match fourcc {
            b"DXT1" => (CustomPixelFormat::Bc1, 128),
            b"DXT5" => (CustomPixelFormat::Bc3, 128),
            b"ATI2" | b"BC5U" => (CustomPixelFormat::Bc5, 128),
            b"DX10" => {
                if data.len() < 148 {
                    return Err(DecodeError::Malformed("dds"));
                }
                let dxgi = u32::from_le_bytes(data[128..132].try_into().unwrap());
                // DXGI_FORMAT_BC7_TYPELESS..BC7_UNORM_SRGB
                if (97..=99).contains(&dxgi) {
                    (CustomPixelFormat::Bc7, 148)
                } else {
                    return Err(DecodeError::UnsupportedFormat(dxgi));
                }
            }
            _ => {
                let raw = u32::from_le_bytes(fourcc.try_into().unwrap());
                return Err(DecodeError::UnsupportedFormat(raw));
            }
        }
    } else {
        // Uncompressed RGBA8 masks.
        (CustomPixelFormat::Rgba8, 128)
    };

    Ok(DecodedImage {
        width,
        height,
        format,
        data: data[data_offset..].to_vec(),
    })
}

/// Parses a KTX1 container.
pub fn decode_ktx(data: &[u8]) -> Result<DecodedImage, DecodeError> {
    const IDENTIFIER: [u8; 12] = [
        0xAB, b'K', b'T', b'X', b' ', b'1', b'1', 0xBB, b'\r', b'\n', 0x1A, b'\n',
    ];
    if data.len() < 68 || data[0..12] != IDENTIFIER {
        return Err(DecodeError::Malformed("ktx"));
    }
    let field = |index: usize| -> u32 {
        let at = 12 + index * 4;
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    };
    let gl_internal_format = field(4);
    let width = field(6);
    let height = field(7);
    let kv_bytes = field(12) as usize;

    let format = match gl_internal_format {
        0x8058 => CustomPixelFormat::Rgba8, // GL_RGBA8
        0x83F1 => CustomPixelFormat::Bc1,   // COMPRESSED_RGBA_S3TC_DXT1
        0x83F3 => CustomPixelFormat::Bc3,   // COMPRESSED_RGBA_S3TC_DXT5
        0x8DBD => CustomPixelFormat::Bc5,   // COMPRESSED_RG_RGTC2
        0x8E8C => CustomPixelFormat::Bc7,   // COMPRESSED_RGBA_BPTC_UNORM
        0x93B0 => CustomPixelFormat::Astc4, // COMPRESSED_RGBA_ASTC_4x4
        0x93B4 => CustomPixelFormat::Astc6, // COMPRESSED_RGBA_ASTC_6x6
        0x93B6 => CustomPixelFormat::Astc8, // COMPRESSED_RGBA_ASTC_8x6
        other => return Err(DecodeError::UnsupportedFormat(other)),
    };

    let image_size_at = 64 + kv_bytes;
    if data.len() < image_size_at + 4 {
        return Err(DecodeError::Malformed("ktx"));
    }
    let image_size =
        u32::from_le_bytes(data[image_size_at..image_size_at + 4].try_into().unwrap()) as usize;
    let payload_at = image_size_at + 4;
    if data.len() < payload_at + image_size {
        return Err(DecodeError::Malformed("ktx"));
    }

    Ok(DecodedImage {
        width,
        height,
        format,
        data: data[payload_at..payload_at + image_size].to_vec(),
    })
}

/// Flips top-down RGBA8 rows in place.
fn flip_rgba8(data: &mut [u8], width: u32, height: u32) {
    let row_bytes = width as usize * 4;
    for y in 0..(height as usize / 2) {
        let other = height as usize - 1 - y;
        let (top, bottom) = data.split_at_mut(other * row_bytes);
        top[y * row_bytes..(y + 1) * row_bytes].swap_with_slice(&mut bottom[..row_bytes]);
    }
}

pub struct CustomTexManager {
    user_dir: PathBuf,
    flip_png_files: bool,
    image_interface: Arc<dyn ImageInterface>,
    workers: Option<ThreadWorker>,
    custom_texture_map: HashMap<u64, Arc<CustomTexture>>,
    dumped_textures: HashSet<u64>,
    temp_buffer: Vec<u8>,
    program_id: ProgramId,
    textures_loaded: bool,
}

impl CustomTexManager {
    pub fn new(
        user_dir: PathBuf,
        flip_png_files: bool,
        image_interface: Arc<dyn ImageInterface>,
    ) -> Self {
        Self {
            user_dir,
            flip_png_files,
            image_interface,
            workers: None,
            custom_texture_map: HashMap::new(),
            dumped_textures: HashSet::new(),
            temp_buffer: Vec::new(),
            program_id: 0,
            textures_loaded: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.custom_texture_map.is_empty()
    }

    /// Scans the load directory for the title and registers every
    /// replacement texture by its filename hash.
    pub fn find_custom_textures(&mut self, program_id: ProgramId) {
        if self.textures_loaded {
            return;
        }
        self.program_id = program_id;

        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(2)
            - 1;
        self.workers = Some(ThreadWorker::new(num_workers, "custom-textures"));

        let load_path = self
            .user_dir
            .join("load")
            .join("textures")
            .join(format!("{program_id:016X}"));
        if !load_path.exists() {
            if let Err(e) = std::fs::create_dir_all(&load_path) {
                log::error!("Unable to create {}: {e}", load_path.display());
                return;
            }
        }

        let mut files = Vec::new();
        scan_directory_tree(&load_path, 64, &mut files);

        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("tex1_") {
                continue;
            }
            let Some((hash, file_format)) = parse_texture_filename(name) else {
                continue;
            };
            let texture = Arc::new(CustomTexture::new(hash, path.clone(), file_format));
            if let Some(existing) = self.custom_texture_map.get(&hash) {
                log::error!(
                    "Textures {} and {} conflict, ignoring!",
                    existing.path.display(),
                    path.display()
                );
                continue;
            }
            self.custom_texture_map.insert(hash, texture);
        }

        log::info!(
            "Found {} custom textures for title {program_id:016X}",
            self.custom_texture_map.len()
        );
        self.textures_loaded = true;
    }

    /// Decodes every registered texture across the worker pool and waits
    /// for completion.
    pub fn preload_textures(&self) {
        let Some(workers) = &self.workers else {
            return;
        };
        for texture in self.custom_texture_map.values() {
            {
                let mut state = texture.state.lock();
                if !matches!(*state, DecodeState::None) {
                    continue;
                }
                *state = DecodeState::Pending;
            }
            let texture = Arc::clone(texture);
            let image_interface = Arc::clone(&self.image_interface);
            let flip_png = self.flip_png_files;
            workers.queue_work(move || load_texture(&texture, &*image_interface, flip_png));
        }
        workers.wait_for_requests();
    }

    /// Hashes the decoded form of the given guest pixel data. The tiled
    /// source is never hashed directly, for compatibility with existing
    /// texture packs.
    pub fn compute_hash(&mut self, params: &SurfaceParams, data: &[u8]) -> u64 {
        let decoded_size =
            (params.width * params.height * params.pixel_format.bytes_per_pixel()) as usize;
        if self.temp_buffer.len() < decoded_size {
            self.temp_buffer.resize(decoded_size, 0);
        }
        let decoded = &mut self.temp_buffer[..decoded_size];
        texture_codec::decode_texture(params, params.addr, params.end, data, decoded, false);
        compute_hash_64(decoded)
    }

    /// Looks up the replacement texture for a pixel data hash.
    pub fn get_texture(&self, data_hash: u64) -> Option<Arc<CustomTexture>> {
        let texture = self.custom_texture_map.get(&data_hash);
        if texture.is_none() {
            log::debug!("No replacement for surface with hash {data_hash:016X}");
        }
        texture.cloned()
    }

    /// Runs `f` on the decoded pixels of `texture`, queueing a decode and
    /// waiting on the `Pending -> Decoded` transition if necessary. Returns
    /// `None` when decoding failed.
    pub fn with_decoded<R>(
        &self,
        texture: &Arc<CustomTexture>,
        f: impl FnOnce(&DecodedImage) -> R,
    ) -> Option<R> {
        let workers = self.workers.as_ref()?;

        let mut state = texture.state.lock();
        if matches!(*state, DecodeState::None) {
            *state = DecodeState::Pending;
            let job_texture = Arc::clone(texture);
            let image_interface = Arc::clone(&self.image_interface);
            let flip_png = self.flip_png_files;
            workers.queue_work(move || load_texture(&job_texture, &*image_interface, flip_png));
        }
        while matches!(*state, DecodeState::Pending) {
            texture.state_changed.wait(&mut state);
        }
        match &*state {
            DecodeState::Decoded(image) if !image.data.is_empty() => Some(f(image)),
            _ => None,
        }
    }

    /// Dumps the given guest pixel data as PNG, unless its size is not a
    /// power of two (probably a framebuffer) or it was dumped before.
    pub fn dump_texture(&mut self, params: &SurfaceParams, _level: u32, data: &[u8]) {
        if !matches!(
            params.surface_type,
            SurfaceType::Color | SurfaceType::Texture
        ) {
            return;
        }
        let data_hash = self.compute_hash(params, data);
        if self.dumped_textures.contains(&data_hash) {
            return;
        }
        let (width, height) = (params.width, params.height);
        if !is_pow2(width) || !is_pow2(height) {
            log::warn!(
                "Not dumping {data_hash:016X} because size isn't a power of 2 ({width}x{height})"
            );
            return;
        }
        let Some(workers) = &self.workers else {
            return;
        };

        let dump_dir = self
            .user_dir
            .join("dump")
            .join("textures")
            .join(format!("{:016X}", self.program_id));
        let dump_path = dump_dir.join(format!(
            "tex1_{width}x{height}_{data_hash:016X}_{}.png",
            params.pixel_format.index()
        ));

        let params = *params;
        let data = data.to_vec();
        let image_interface = Arc::clone(&self.image_interface);
        workers.queue_work(move || {
            if let Err(e) = std::fs::create_dir_all(&dump_dir) {
                log::error!("Unable to create {}: {e}", dump_dir.display());
                return;
            }
            let pixel_count = (params.width * params.height) as usize;
            let decoded_size = pixel_count * params.pixel_format.bytes_per_pixel() as usize;
            let mut decoded = vec![0u8; decoded_size];
            texture_codec::decode_texture(
                &params,
                params.addr,
                params.end,
                &data,
                &mut decoded,
                false,
            );
            let mut rgba = canonical_to_rgba8(params.pixel_format, &decoded, pixel_count);
            // Host rows are bottom-up; PNG is top-down.
            flip_rgba8(&mut rgba, params.width, params.height);
            if let Err(e) =
                image_interface.encode_png(&dump_path, &rgba, params.width, params.height)
            {
                log::error!("Failed to dump {}: {e}", dump_path.display());
            }
        });
        self.dumped_textures.insert(data_hash);
    }

    /// Blocks until all queued decode and dump jobs finish.
    pub fn drain(&self) {
        if let Some(workers) = &self.workers {
            workers.wait_for_requests();
        }
    }
}

fn scan_directory_tree(dir: &Path, depth: u32, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                scan_directory_tree(&path, depth - 1, out);
            }
        } else {
            out.push(path);
        }
    }
}

/// Reads and decodes one texture file, then publishes the result. Failures
/// publish an empty image so waiters never stall.
fn load_texture(texture: &CustomTexture, image_interface: &dyn ImageInterface, flip_png: bool) {
    let result = load_texture_impl(texture, image_interface, flip_png);
    let image = match result {
        Ok(image) => image,
        Err(e) => {
            log::error!("Failed to load {}: {e}", texture.path.display());
            DecodedImage::default()
        }
    };
    let mut state = texture.state.lock();
    *state = DecodeState::Decoded(image);
    texture.state_changed.notify_all();
}

fn load_texture_impl(
    texture: &CustomTexture,
    image_interface: &dyn ImageInterface,
    flip_png: bool,
) -> Result<DecodedImage, DecodeError> {
    let file = std::fs::read(&texture.path)?;
    match texture.file_format {
        CustomFileFormat::Png => {
            let (mut data, width, height) = image_interface.decode_png(&file)?;
            if flip_png {
                flip_rgba8(&mut data, width, height);
            }
            Ok(DecodedImage {
                width,
                height,
                format: CustomPixelFormat::Rgba8,
                data,
            })
        }
        // Compressed containers are passed through pre-flipped.
        CustomFileFormat::Dds => decode_dds(&file),
        CustomFileFormat::Ktx => decode_ktx(&file),
    }
}

/// Expands canonical host pixels to RGBA8 for PNG encoding.
fn canonical_to_rgba8(format: PixelFormat, decoded: &[u8], pixel_count: usize) -> Vec<u8> {
    let bpp = format.bytes_per_pixel() as usize;
    match format {
        PixelFormat::Rgba8 => decoded[..pixel_count * 4].to_vec(),
        PixelFormat::Rgb8 => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for texel in decoded[..pixel_count * 3].chunks_exact(3) {
                out.extend_from_slice(&[texel[0], texel[1], texel[2], 255]);
            }
            out
        }
        PixelFormat::Rgb5A1 | PixelFormat::Rgb565 | PixelFormat::Rgba4 => {
            // Canonical 16-bit texels keep the guest bit layout.
            let mut out = Vec::with_capacity(pixel_count * 4);
            for texel in decoded[..pixel_count * 2].chunks_exact(2) {
                let rgba =
                    texture_codec::lookup_texel(format, &[texel[0], texel[1], 0, 0]);
                out.extend_from_slice(&rgba);
            }
            out
        }
        // Texture formats already decoded to RGBA8.
        _ => decoded[..pixel_count * bpp].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_texture_filename() {
        let (hash, format) =
            parse_texture_filename("tex1_32x32_00000000DEADBEEF_0.png").unwrap();
        assert_eq!(hash, 0xDEAD_BEEF);
        assert_eq!(format, CustomFileFormat::Png);

        let (_, format) = parse_texture_filename("tex1_128x64_0123456789ABCDEF_4.ktx").unwrap();
        assert_eq!(format, CustomFileFormat::Ktx);

        assert!(parse_texture_filename("tex1_32x32_BADHASH_0.png").is_none());
        assert!(parse_texture_filename("tex1_32x32_00000000DEADBEEF_0.bmp").is_none());
        assert!(parse_texture_filename("other_32x32_00000000DEADBEEF_0.png").is_none());
    }

    #[test]
    fn test_flip_rgba8() {
        let mut data = vec![
            1, 1, 1, 1, //
            2, 2, 2, 2, //
            3, 3, 3, 3, //
        ];
        flip_rgba8(&mut data, 1, 3);
        assert_eq!(data[0], 3);
        assert_eq!(data[4], 2);
        assert_eq!(data[8], 1);
    }

    #[test]
    fn test_decode_dds_bc1() {
        let mut file = vec![0u8; 136];
        file[0..4].copy_from_slice(b"DDS ");
        file[4..8].copy_from_slice(&124u32.to_le_bytes());
        file[12..16].copy_from_slice(&64u32.to_le_bytes()); // height
        file[16..20].copy_from_slice(&32u32.to_le_bytes()); // width
        file[80..84].copy_from_slice(&0x4u32.to_le_bytes()); // DDPF_FOURCC
        file[84..88].copy_from_slice(b"DXT1");
        let image = decode_dds(&file).unwrap();
        assert_eq!(image.format, CustomPixelFormat::Bc1);
        assert_eq!(image.width, 32);
        assert_eq!(image.height, 64);
        assert_eq!(image.data.len(), 8);
        assert!(image.format.is_compressed());
    }

    #[test]
    fn test_decode_dds_rejects_garbage() {
        assert!(decode_dds(b"not a dds").is_err());
    }

    #[test]
    fn test_decode_ktx_astc() {
        let mut file = Vec::new();
        file.extend_from_slice(&[
            0xAB, b'K', b'T', b'X', b' ', b'1', b'1', 0xBB, b'\r', b'\n', 0x1A, b'\n',
        ]);
        let mut fields = [0u32; 13];
        fields[0] = 0x0403_0201; // endianness
        fields[4] = 0x93B0; // ASTC 4x4
        fields[6] = 16; // width
        fields[7] = 16; // height
        fields[12] = 0; // kv bytes
        for field in fields {
            file.extend_from_slice(&field.to_le_bytes());
        }
        file.extend_from_slice(&16u32.to_le_bytes()); // image size
        file.extend_from_slice(&[0xEE; 16]);
        let image = decode_ktx(&file).unwrap();
        assert_eq!(image.format, CustomPixelFormat::Astc4);
        assert_eq!(image.data, vec![0xEE; 16]);
    }

    #[test]
    fn test_find_and_decode_png() {
        let dir = tempfile::tempdir().unwrap();
        let program_id = 0x0004_0000_0000_1234u64;
        let load_dir = dir
            .path()
            .join("load")
            .join("textures")
            .join(format!("{program_id:016X}"));
        std::fs::create_dir_all(&load_dir).unwrap();

        // A 2x2 all-red PNG.
        let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        image
            .save(load_dir.join("tex1_2x2_00000000DEADBEEF_0.png"))
            .unwrap();

        let mut manager = CustomTexManager::new(
            dir.path().to_path_buf(),
            false,
            Arc::new(DefaultImageInterface),
        );
        manager.find_custom_textures(program_id);
        let texture = manager.get_texture(0xDEAD_BEEF).unwrap();

        let dims = manager.with_decoded(&texture, |image| (image.width, image.height));
        assert_eq!(dims, Some((2, 2)));

        // Second call sees the decoded state directly.
        let first =
            manager.with_decoded(&texture, |image| image.data[..4].to_vec());
        assert_eq!(first, Some(vec![255, 0, 0, 255]));
    }

    #[test]
    fn test_preload_decodes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let program_id = 1u64;
        let load_dir = dir
            .path()
            .join("load")
            .join("textures")
            .join(format!("{program_id:016X}"));
        std::fs::create_dir_all(&load_dir).unwrap();
        for i in 0..4 {
            let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([i as u8, 0, 0, 255]));
            image
                .save(load_dir.join(format!("tex1_2x2_{i:016X}_0.png")))
                .unwrap();
        }

        let mut manager = CustomTexManager::new(
            dir.path().to_path_buf(),
            true,
            Arc::new(DefaultImageInterface),
        );
        manager.find_custom_textures(program_id);
        manager.preload_textures();

        for i in 0..4u64 {
            let texture = manager.get_texture(i).unwrap();
            assert!(matches!(*texture.state.lock(), DecodeState::Decoded(_)));
        }
    }
}
