// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rasterizer surface cache.
//!
//! Mediates between the guest physical address space holding tiled/linear
//! pixel data and host GPU texture allocations. For every draw, texture
//! fetch, display transfer, memory fill or CPU access overlapping cached
//! pixel data, the cache decides whether an existing allocation satisfies
//! the request, or whether data must be uploaded, downloaded, reinterpreted,
//! blitted from another surface, or recreated at a new resolution scale.

pub mod backend;
pub mod custom_tex_manager;
pub mod interval;
pub mod pixel_format;
pub mod surface;
pub mod surface_params;
pub mod texture_codec;
pub mod texture_runtime;
pub mod utils;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bitflags::bitflags;

use rupica_common::rect::Rect;
use rupica_common::settings::{TextureFilter, VideoSettings};
use rupica_common::types::{PAddr, ProgramId, PAGE_BITS};

use crate::memory::GuestMemory;
use crate::regs::{
    DisplayTransferConfig, FramebufferConfig, MemoryFillConfig, ScalingMode, TextureInfo,
};

use backend::{TextureBackend, TextureHandle};
use custom_tex_manager::{CustomTexManager, ImageInterface};
use interval::{IntervalMap, IntervalSet, SurfaceInterval};
use pixel_format::{check_formats_blittable, PixelFormat, SurfaceType, TextureType};
use surface::{
    CachedTextureCube, Surface, SurfaceId, SurfaceWatcher, TextureCubeConfig, WatcherId,
};
use surface_params::SurfaceParams;
use texture_runtime::TextureRuntime;
use utils::{
    make_clear_value, BufferTextureCopy, Extent, Offset, TextureBlit, TextureClear, TextureCopy,
};

bitflags! {
    /// Ways a cached surface may satisfy a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u32 {
        /// Return invalid candidates as well; they need validation.
        const INVALID = 1;
        /// Surfaces match exactly.
        const EXACT = 1 << 1;
        /// Surface encompasses the requested params.
        const SUB_RECT = 1 << 2;
        /// Surface we can copy from.
        const COPY = 1 << 3;
        /// Surface that can be expanded to cover the params.
        const EXPAND = 1 << 4;
        /// Surface that matches a display-transfer "texture copy".
        const TEX_COPY = 1 << 5;
    }
}

/// How strictly the resolution scale must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMatch {
    /// Only accept the same scale.
    Exact,
    /// Only allow a higher scale than requested.
    Upscale,
    /// Accept every scale.
    Ignore,
}

type SurfaceSet = BTreeSet<SurfaceId>;

/// Color/depth surfaces bound for a draw.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderTargets {
    pub color: Option<SurfaceId>,
    pub depth: Option<SurfaceId>,
    pub fb_rect: Rect<u32>,
}

pub struct RasterizerCache<M: GuestMemory> {
    memory: M,
    runtime: TextureRuntime,
    custom_tex_manager: CustomTexManager,
    settings: VideoSettings,

    surfaces: HashMap<SurfaceId, Surface>,
    watchers: HashMap<WatcherId, SurfaceWatcher>,
    surface_cache: IntervalMap<SurfaceSet>,
    dirty_regions: IntervalMap<SurfaceId>,
    cached_pages: IntervalMap<i32>,
    remove_surfaces: BTreeSet<SurfaceId>,
    texture_cube_cache: HashMap<TextureCubeConfig, CachedTextureCube>,

    resolution_scale_factor: u32,
    pending_resolution_scale: Option<u32>,
    pending_texture_filter: Option<TextureFilter>,

    next_surface_id: u64,
    next_watcher_id: u64,
}

impl<M: GuestMemory> RasterizerCache<M> {
    pub fn new(
        memory: M,
        backend: Box<dyn TextureBackend>,
        image_interface: Arc<dyn ImageInterface>,
        settings: VideoSettings,
    ) -> Self {
        let custom_tex_manager = CustomTexManager::new(
            settings.user_dir.clone(),
            settings.flip_custom_png,
            image_interface,
        );
        Self {
            memory,
            runtime: TextureRuntime::new(backend, settings.texture_filter),
            custom_tex_manager,
            resolution_scale_factor: settings.resolution_factor,
            settings,
            surfaces: HashMap::new(),
            watchers: HashMap::new(),
            surface_cache: IntervalMap::new(),
            dirty_regions: IntervalMap::new(),
            cached_pages: IntervalMap::new(),
            remove_surfaces: BTreeSet::new(),
            texture_cube_cache: HashMap::new(),
            pending_resolution_scale: None,
            pending_texture_filter: None,
            next_surface_id: 0,
            next_watcher_id: 0,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// The surface for an id, while it is still registered.
    pub fn get_surface_ref(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Scans the title's load directory and optionally preloads every
    /// replacement texture.
    pub fn load_custom_textures(&mut self, program_id: ProgramId) {
        if !self.settings.custom_textures && !self.settings.dump_textures {
            return;
        }
        self.custom_tex_manager.find_custom_textures(program_id);
        if self.settings.preload_textures {
            self.custom_tex_manager.preload_textures();
        }
    }

    /// Requests a resolution scale change, applied at the next frame
    /// boundary.
    pub fn set_resolution_scale(&mut self, factor: u32) {
        self.pending_resolution_scale = Some(factor);
    }

    /// Requests a texture filter change, applied at the next frame boundary.
    pub fn set_texture_filter(&mut self, filter: TextureFilter) {
        self.pending_texture_filter = Some(filter);
    }

    // ── Internal arena helpers ──────────────────────────────────────────

    fn surface(&self, id: SurfaceId) -> &Surface {
        self.surfaces.get(&id).expect("use of expired surface id")
    }

    fn surface_mut(&mut self, id: SurfaceId) -> &mut Surface {
        self.surfaces.get_mut(&id).expect("use of expired surface id")
    }

    fn create_watcher(&mut self, target: SurfaceId) -> WatcherId {
        self.next_watcher_id += 1;
        let id = WatcherId(self.next_watcher_id);
        self.watchers.insert(id, SurfaceWatcher::new(target));
        self.surface_mut(target).watchers.push(id);
        id
    }

    fn release_watcher(&mut self, id: WatcherId) {
        self.watchers.remove(&id);
    }

    /// Marks every watcher of `id` as holding a stale snapshot.
    fn invalidate_watchers(&mut self, id: SurfaceId) {
        let watcher_ids = self.surface(id).watchers.clone();
        for wid in watcher_ids {
            if let Some(watcher) = self.watchers.get_mut(&wid) {
                watcher.valid = false;
            }
        }
    }

    /// Detaches every watcher of `id` as if the surface were already gone.
    fn unlink_all_watchers(&mut self, id: SurfaceId) {
        let watcher_ids = std::mem::take(&mut self.surface_mut(id).watchers);
        for wid in watcher_ids {
            if let Some(watcher) = self.watchers.get_mut(&wid) {
                watcher.valid = false;
                watcher.surface = None;
            }
        }
    }

    // ── Surface lifecycle ───────────────────────────────────────────────

    fn create_surface(&mut self, params: SurfaceParams) -> SurfaceId {
        let alloc = if params.surface_type == SurfaceType::Fill {
            None
        } else {
            let alloc = self.runtime.allocate(
                params.pixel_format,
                params.texture_type,
                params.width,
                params.height,
                params.levels,
                params.res_scale,
            );
            if alloc.is_none() {
                log::warn!(
                    "Texture allocation failed for {}x{} {}",
                    params.width,
                    params.height,
                    params.pixel_format.name()
                );
            }
            alloc
        };
        let mut surface = Surface::new(params, alloc);
        surface.invalid_regions.insert(surface.interval());

        self.next_surface_id += 1;
        let id = SurfaceId(self.next_surface_id);
        self.surfaces.insert(id, surface);
        id
    }

    fn register_surface(&mut self, id: SurfaceId) {
        let surface = self.surface_mut(id);
        if surface.registered {
            return;
        }
        surface.registered = true;
        let interval = surface.interval();
        let (addr, size) = (surface.params.addr, surface.params.size);
        self.surface_cache.update(interval, |old| {
            let mut set = old.cloned().unwrap_or_default();
            set.insert(id);
            Some(set)
        });
        self.update_pages_cached_count(addr, size, 1);
    }

    fn unregister_surface(&mut self, id: SurfaceId) {
        let surface = self.surface_mut(id);
        if !surface.registered {
            return;
        }
        surface.registered = false;
        let interval = surface.interval();
        let (addr, size) = (surface.params.addr, surface.params.size);
        self.update_pages_cached_count(addr, size, -1);
        self.surface_cache.update(interval, |old| {
            let mut set = old.cloned().unwrap_or_default();
            set.remove(&id);
            (!set.is_empty()).then_some(set)
        });

        // The arena entry dies with unregistration; expire its watchers and
        // drop the ones it owned for its mip levels.
        self.unlink_all_watchers(id);
        let surface = self.surfaces.remove(&id).expect("unregistering unknown surface");
        for watcher in surface.level_watchers.into_iter().flatten() {
            self.release_watcher(watcher);
        }
        if let Some(alloc) = surface.alloc {
            self.runtime.recycle(alloc);
        }
    }

    fn update_pages_cached_count(&mut self, addr: PAddr, size: u32, delta: i32) {
        let page_start = addr >> PAGE_BITS;
        let page_end = (((u64::from(addr) + u64::from(size) - 1) >> PAGE_BITS) + 1) as u32;
        let pages_interval = SurfaceInterval::new(page_start, page_end);

        // Apply positive deltas first and negative deltas last so transient
        // zero counts never untrap a page that stays cached.
        if delta > 0 {
            self.cached_pages.add(pages_interval, delta);
        }

        let spans: Vec<(SurfaceInterval, i32)> = self
            .cached_pages
            .overlapping(pages_interval)
            .map(|(seg, &count)| (seg.intersect(pages_interval), count))
            .collect();
        for (pages, count) in spans {
            let interval_start_addr = pages.start << PAGE_BITS;
            let interval_size = pages.len() << PAGE_BITS;
            if delta > 0 && count == delta {
                self.memory
                    .mark_region_cached(interval_start_addr, interval_size, true);
            } else if delta < 0 && count == -delta {
                self.memory
                    .mark_region_cached(interval_start_addr, interval_size, false);
            } else {
                assert!(count >= 0, "negative page reference count");
            }
        }

        if delta < 0 {
            self.cached_pages.add(pages_interval, delta);
        }
    }

    // ── Matching ────────────────────────────────────────────────────────

    /// Finds the best cached surface for `params` under the given flags.
    /// Higher `res_scale` wins, then validity, then the intersection size.
    fn find_match(
        &self,
        flags: MatchFlags,
        params: &SurfaceParams,
        match_scale: ScaleMatch,
        validate_interval: Option<SurfaceInterval>,
    ) -> Option<SurfaceId> {
        self.find_match_excluding(flags, params, match_scale, validate_interval, None)
    }

    fn find_match_excluding(
        &self,
        flags: MatchFlags,
        params: &SurfaceParams,
        match_scale: ScaleMatch,
        validate_interval: Option<SurfaceInterval>,
        exclude: Option<SurfaceId>,
    ) -> Option<SurfaceId> {
        let mut match_id: Option<SurfaceId> = None;
        let mut match_valid = false;
        let mut match_scale_found: u16 = 0;
        let mut match_interval = SurfaceInterval::default();

        for (_, set) in self.surface_cache.overlapping(params.interval()) {
            for &id in set {
                if Some(id) == exclude {
                    continue;
                }
                let surface = self.surface(id);
                let res_scale_matched = match match_scale {
                    ScaleMatch::Exact => params.res_scale == surface.params.res_scale,
                    _ => params.res_scale <= surface.params.res_scale,
                };
                // For copy matches validity is decided per-interval below.
                let is_valid = if flags.contains(MatchFlags::COPY) {
                    true
                } else {
                    surface.is_region_valid(validate_interval.unwrap_or(params.interval()))
                };
                if !flags.contains(MatchFlags::INVALID) && !is_valid {
                    continue;
                }

                let mut consider = |matched: bool, interval: SurfaceInterval| {
                    if !matched {
                        return;
                    }
                    if !res_scale_matched
                        && match_scale != ScaleMatch::Ignore
                        && surface.params.surface_type != SurfaceType::Fill
                    {
                        return;
                    }
                    let scale = surface.params.res_scale;
                    let better = if scale != match_scale_found {
                        scale > match_scale_found
                    } else if is_valid != match_valid {
                        is_valid
                    } else {
                        interval.len() > match_interval.len()
                    };
                    if better {
                        match_id = Some(id);
                        match_valid = is_valid;
                        match_scale_found = scale;
                        match_interval = interval;
                    }
                };

                if flags.contains(MatchFlags::EXACT) {
                    consider(surface.params.exact_match(params), surface.interval());
                }
                if flags.contains(MatchFlags::SUB_RECT) {
                    consider(surface.params.can_sub_rect(params), surface.interval());
                }
                if flags.contains(MatchFlags::COPY) {
                    let vi = validate_interval.expect("copy match requires validate interval");
                    let copy_interval =
                        surface.get_copyable_interval(&params.from_interval(vi));
                    let matched = copy_interval.intersect(vi).len() != 0
                        && surface.can_copy(params, copy_interval);
                    consider(matched, copy_interval);
                }
                if flags.contains(MatchFlags::EXPAND) {
                    consider(surface.params.can_expand(params), surface.interval());
                }
                if flags.contains(MatchFlags::TEX_COPY) {
                    consider(surface.params.can_tex_copy(params), surface.interval());
                }
            }
        }
        match_id
    }

    // ── Copy / duplicate ────────────────────────────────────────────────

    /// Establishes `copy_interval` of `dst` from `src`: a scissored clear
    /// for fill surfaces, a blit otherwise. Callers must only pass
    /// copyable pairs.
    fn copy_surface(&mut self, src: SurfaceId, dst: SurfaceId, copy_interval: SurfaceInterval) {
        assert_ne!(src, dst);
        let dst_params = self.surface(dst).params;
        let subrect_params = dst_params.from_interval(copy_interval);
        assert_eq!(subrect_params.interval(), copy_interval);

        let src_surface = self.surface(src);
        if src_surface.params.surface_type == SurfaceType::Fill {
            // The fill pattern may be rotated relative to the destination.
            let fill_size = src_surface.fill_size;
            let fill_offset = (copy_interval.start - src_surface.params.addr) % fill_size;
            let mut fill_buffer = [0u8; 4];
            for (i, byte) in fill_buffer.iter_mut().enumerate() {
                *byte = src_surface.fill_data[((fill_offset + i as u32) % fill_size) as usize];
            }

            let clear = TextureClear {
                texture_level: 0,
                texture_rect: dst_params.get_scaled_sub_rect(&subrect_params),
                value: make_clear_value(
                    dst_params.surface_type,
                    dst_params.pixel_format,
                    &fill_buffer,
                ),
            };
            self.runtime
                .clear_texture(self.surfaces.get(&dst).unwrap(), &clear);
            return;
        }

        if src_surface.params.can_sub_rect(&subrect_params) {
            let blit = TextureBlit {
                src_rect: src_surface.params.get_scaled_sub_rect(&subrect_params),
                dst_rect: dst_params.get_scaled_sub_rect(&subrect_params),
                ..Default::default()
            };
            self.runtime.blit_textures(
                self.surfaces.get(&src).unwrap(),
                self.surfaces.get(&dst).unwrap(),
                &blit,
            );
            return;
        }

        unreachable!("copy_surface called with a non-copyable pair");
    }

    /// Copies the whole of `src` into the matching sub-rectangle of the
    /// larger surface `new`, merging validity and re-attributing dirty
    /// regions.
    fn duplicate_surface(&mut self, src: SurfaceId, new: SurfaceId) {
        let src_params = self.surface(src).params;
        let new_params = self.surface(new).params;
        assert!(new_params.addr <= src_params.addr && new_params.end >= src_params.end);

        let src_rect = src_params.scaled_rect();
        let dst_rect = new_params.get_scaled_sub_rect(&src_params);
        assert_eq!(src_rect.width(), dst_rect.width());

        let copy = TextureCopy {
            src_offset: Offset { x: 0, y: 0 },
            dst_offset: Offset {
                x: dst_rect.left,
                y: dst_rect.bottom,
            },
            extent: Extent {
                width: src_rect.width(),
                height: src_rect.height(),
            },
            ..Default::default()
        };
        self.runtime.copy_textures(
            self.surfaces.get(&src).unwrap(),
            self.surfaces.get(&new).unwrap(),
            &copy,
        );

        let src_invalid = self.surface(src).invalid_regions.clone();
        let new_surface = self.surface_mut(new);
        new_surface.invalid_regions.erase(src_params.interval());
        new_surface.invalid_regions.union_with(&src_invalid);

        let mut regions = IntervalSet::new();
        for (seg, &owner) in self.dirty_regions.overlapping(src_params.interval()) {
            if owner == src {
                regions.insert(seg);
            }
        }
        for seg in regions.iter() {
            self.dirty_regions.set(seg, new);
        }
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Brings `[addr, addr + size)` of the surface up to date, copying or
    /// reinterpreting from other cached surfaces where possible and
    /// uploading from guest memory otherwise. Idempotent.
    fn validate_surface(&mut self, id: SurfaceId, addr: PAddr, size: u32) {
        if size == 0 {
            return;
        }
        let validate_interval = SurfaceInterval::new(addr, addr + size);

        if self.surface(id).params.surface_type == SurfaceType::Fill {
            // Fill surfaces are always valid over their own interval.
            debug_assert!(self.surface(id).is_region_valid(validate_interval));
            return;
        }

        let mut validate_regions = self
            .surface(id)
            .invalid_regions
            .intersection(validate_interval);

        loop {
            let Some(first) = validate_regions.first() else {
                break;
            };
            let interval = first.intersect(validate_interval);
            let params = self.surface(id).params.from_interval(interval);

            // Prefer copying from another cached surface.
            if let Some(copy_id) =
                self.find_match(MatchFlags::COPY, &params, ScaleMatch::Ignore, Some(interval))
            {
                let copy_interval = self.surface(copy_id).get_copyable_interval(&params);
                self.copy_surface(copy_id, id, copy_interval);
                self.surface_mut(id).invalid_regions.erase(copy_interval);
                validate_regions.erase(copy_interval);
                continue;
            }

            // Then a cached surface of a reinterpretable format.
            if self.validate_by_reinterpretation(id, params, interval) {
                self.surface_mut(id).invalid_regions.erase(interval);
                validate_regions.erase(interval);
                continue;
            }

            // A region created entirely on the GPU with no usable
            // reinterpreter is skipped rather than clobbered from memory.
            if self.no_unimplemented_reinterpretations(id, params, interval)
                && !self.interval_has_invalid_pixel_format(interval)
                && self.dirty_regions.covers(interval)
            {
                log::debug!(
                    "Region created fully on GPU and reinterpretation is invalid. Skipping validation"
                );
                validate_regions.erase(interval);
                continue;
            }

            // Load from guest memory; push out other cached writers first.
            self.flush_region(params.addr, params.size, None);
            self.upload_surface(id, interval);
            self.surface_mut(id).invalid_regions.erase(params.interval());
            validate_regions.erase(params.interval());
        }
    }

    /// Attempts to establish `interval` by running a registered format
    /// reinterpreter from a cached surface of its source format.
    fn validate_by_reinterpretation(
        &mut self,
        id: SurfaceId,
        mut params: SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        let dest_format = self.surface(id).params.pixel_format;
        for reinterpreter in self.runtime.reinterpreters_for(dest_format) {
            params.pixel_format = reinterpreter.src_format;
            let Some(reinterpret_id) =
                self.find_match(MatchFlags::COPY, &params, ScaleMatch::Ignore, Some(interval))
            else {
                continue;
            };
            let reinterpret_interval = self.surface(reinterpret_id).get_copyable_interval(&params);
            let reinterpret_params = self.surface(id).params.from_interval(reinterpret_interval);
            let src_rect = self
                .surface(reinterpret_id)
                .params
                .get_scaled_sub_rect(&reinterpret_params);
            let dst_rect = self.surface(id).params.get_scaled_sub_rect(&reinterpret_params);
            self.runtime.reinterpret(
                self.surfaces.get(&reinterpret_id).unwrap(),
                src_rect,
                self.surfaces.get(&id).unwrap(),
                dst_rect,
            );
            return true;
        }
        false
    }

    /// False when another surface with the same bit-width overlaps the
    /// interval, meaning a reinterpreter is missing rather than the data.
    fn no_unimplemented_reinterpretations(
        &self,
        id: SurfaceId,
        mut params: SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        const ALL_FORMATS: [PixelFormat; 17] = [
            PixelFormat::Rgba8,
            PixelFormat::Rgb8,
            PixelFormat::Rgb5A1,
            PixelFormat::Rgb565,
            PixelFormat::Rgba4,
            PixelFormat::Ia8,
            PixelFormat::Rg8,
            PixelFormat::I8,
            PixelFormat::A8,
            PixelFormat::Ia4,
            PixelFormat::I4,
            PixelFormat::A4,
            PixelFormat::Etc1,
            PixelFormat::Etc1A4,
            PixelFormat::D16,
            PixelFormat::D24,
            PixelFormat::D24S8,
        ];
        let bpp = self.surface(id).params.format_bpp();
        let mut implemented = true;
        for format in ALL_FORMATS {
            if format.bpp() != bpp {
                continue;
            }
            params.pixel_format = format;
            if self
                .find_match(MatchFlags::COPY, &params, ScaleMatch::Ignore, Some(interval))
                .is_some()
            {
                log::warn!(
                    "Missing pixel_format reinterpreter: {} -> {}",
                    format.name(),
                    self.surface(id).params.pixel_format.name()
                );
                implemented = false;
            }
        }
        implemented
    }

    /// True when a surface with an invalid pixel format overlaps the
    /// interval.
    fn interval_has_invalid_pixel_format(&self, interval: SurfaceInterval) -> bool {
        for (_, set) in self.surface_cache.overlapping(interval) {
            for &id in set {
                if self.surface(id).params.pixel_format == PixelFormat::Invalid {
                    log::debug!(
                        "Surface {:#x} found with invalid pixel format",
                        self.surface(id).params.addr
                    );
                    return true;
                }
            }
        }
        false
    }

    // ── Guest memory transfers ──────────────────────────────────────────

    /// Decodes guest bytes over `interval` and uploads them into the
    /// surface, substituting a custom texture when one matches.
    fn upload_surface(&mut self, id: SurfaceId, interval: SurfaceInterval) {
        let load_info = self.surface(id).params.from_interval(interval);
        debug_assert!(
            load_info.addr >= self.surface(id).params.addr
                && load_info.end <= self.surface(id).params.end
        );

        let guest_size = load_info.end - load_info.addr;
        match self.memory.physical_bytes(load_info.addr, guest_size) {
            Some(span) if span.len() >= guest_size as usize => {}
            _ => return,
        }

        if self.settings.custom_textures || self.settings.dump_textures {
            let source = self
                .memory
                .physical_bytes(load_info.addr, guest_size)
                .unwrap();
            let hash = self.custom_tex_manager.compute_hash(&load_info, source);
            if self.settings.dump_textures {
                self.custom_tex_manager.dump_texture(&load_info, 0, source);
            }
            if self.settings.custom_textures && self.upload_custom_surface(id, &load_info, hash) {
                self.invalidate_watchers(id);
                return;
            }
        }

        let staging_size =
            load_info.width * load_info.height * self.surface(id).internal_bytes_per_pixel();
        let staging = self.runtime.find_staging(staging_size, true);

        let convert = self.settings.byte_swap_color_formats
            && matches!(
                load_info.pixel_format,
                PixelFormat::Rgba8 | PixelFormat::Rgb8
            );
        texture_codec::decode_texture(
            &load_info,
            load_info.addr,
            load_info.end,
            self.memory
                .physical_bytes(load_info.addr, guest_size)
                .unwrap(),
            self.runtime.staging_mut(&staging),
            convert,
        );

        let upload = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: staging.size,
            texture_rect: self.surface(id).params.get_sub_rect(&load_info),
            texture_level: 0,
        };
        self.runtime
            .upload(self.surfaces.get(&id).unwrap(), &upload, &staging);
        self.invalidate_watchers(id);
    }

    /// Uploads a decoded replacement texture instead of the guest pixels.
    /// Returns false when no usable replacement exists; the caller then
    /// takes the normal path.
    fn upload_custom_surface(
        &mut self,
        id: SurfaceId,
        load_info: &SurfaceParams,
        hash: u64,
    ) -> bool {
        // Partial validations cannot be replaced wholesale.
        if load_info.interval() != self.surface(id).interval() {
            return false;
        }
        // The replacement is uploaded through the surface's host tuple,
        // which must be plain RGBA8.
        let tuple = texture_runtime::get_format_tuple(load_info.pixel_format);
        if tuple.format != texture_runtime::HostFormat::Rgba8 {
            return false;
        }
        let Some(texture) = self.custom_tex_manager.get_texture(hash) else {
            return false;
        };

        let Some(pixels) = self.custom_tex_manager.with_decoded(&texture, |image| {
            if image.format.is_compressed() {
                log::debug!(
                    "Compressed replacement {} is not supported by this backend",
                    texture.path.display()
                );
                return None;
            }
            Some((image.width, image.height, image.data.clone()))
        }) else {
            return false;
        };
        let Some((width, height, data)) = pixels else {
            return false;
        };
        log::debug!(
            "Assigning {} to surface with hash {hash:016X}",
            texture.path.display()
        );

        // Resize to the surface rectangle if the pack uses other dimensions.
        let rect = self.surface(id).params.get_sub_rect(load_info);
        let (dst_w, dst_h) = (rect.width(), rect.height());
        let staging = self.runtime.find_staging(dst_w * dst_h * 4, true);
        let out = self.runtime.staging_mut(&staging);
        if (width, height) == (dst_w, dst_h) {
            out.copy_from_slice(&data);
        } else {
            for y in 0..dst_h {
                let sy = y * height / dst_h;
                for x in 0..dst_w {
                    let sx = x * width / dst_w;
                    let src_off = ((sy * width + sx) * 4) as usize;
                    let dst_off = ((y * dst_w + x) * 4) as usize;
                    out[dst_off..dst_off + 4].copy_from_slice(&data[src_off..src_off + 4]);
                }
            }
        }

        let upload = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: staging.size,
            texture_rect: rect,
            texture_level: 0,
        };
        self.runtime
            .upload(self.surfaces.get(&id).unwrap(), &upload, &staging);
        true
    }

    /// Downloads the surface pixels over `interval` and encodes them back
    /// into guest memory.
    fn download_surface(&mut self, id: SurfaceId, interval: SurfaceInterval) {
        let flush_info = self.surface(id).params.from_interval(interval);
        let flush_start = interval.start;
        let flush_end = interval.end;
        debug_assert!(
            flush_start >= self.surface(id).params.addr
                && flush_end <= self.surface(id).params.end
        );

        let staging_size =
            flush_info.width * flush_info.height * self.surface(id).internal_bytes_per_pixel();
        let staging = self.runtime.find_staging(staging_size, false);

        let download = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: staging.size,
            texture_rect: self.surface(id).params.get_sub_rect(&flush_info),
            texture_level: 0,
        };
        self.runtime
            .download(self.surfaces.get(&id).unwrap(), &download, &staging);

        let convert = self.settings.byte_swap_color_formats
            && matches!(
                flush_info.pixel_format,
                PixelFormat::Rgba8 | PixelFormat::Rgb8
            );
        let guest_size = flush_end - flush_start;
        match self.memory.physical_bytes_mut(flush_start, guest_size) {
            Some(dest) if dest.len() >= guest_size as usize => {
                texture_codec::encode_texture(
                    &flush_info,
                    flush_start,
                    flush_end,
                    self.runtime.staging(&staging),
                    dest,
                    convert,
                );
            }
            _ => {}
        }
    }

    /// Writes a fill surface's pattern directly into guest memory, phase
    /// aligned to the fill start address.
    fn download_fill_surface(&mut self, id: SurfaceId, interval: SurfaceInterval) {
        let surface = self.surface(id);
        let fill_size = surface.fill_size;
        let fill_data = surface.fill_data;
        let surface_addr = surface.params.addr;
        let flush_start = interval.start;
        let flush_end = interval.end;
        debug_assert!(flush_start >= surface_addr && flush_end <= surface.params.end);

        let Some(dest) = self
            .memory
            .physical_bytes_mut(flush_start, flush_end - flush_start)
        else {
            return;
        };
        let phase = (flush_start - surface_addr) % fill_size;
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = fill_data[((phase as usize + i) % fill_size as usize)];
        }
    }

    // ── Flush / invalidate ──────────────────────────────────────────────

    /// Writes cached content overlapping `[addr, addr + size)` back to
    /// guest memory if dirty. Small sizes flush each owner's whole dirty
    /// interval to amortise repeated CPU peeks.
    pub fn flush_region(&mut self, addr: PAddr, size: u32, flush_surface: Option<SurfaceId>) {
        if size == 0 {
            return;
        }
        let flush_interval = SurfaceInterval::new(addr, addr.saturating_add(size));
        let mut flushed_intervals = IntervalSet::new();

        let entries: Vec<(SurfaceInterval, SurfaceId)> = self
            .dirty_regions
            .overlapping(flush_interval)
            .map(|(seg, &owner)| (seg, owner))
            .collect();
        for (seg, owner) in entries {
            let interval = if size <= 8 {
                seg
            } else {
                seg.intersect(flush_interval)
            };
            if let Some(only) = flush_surface {
                if owner != only {
                    continue;
                }
            }
            // This surface is the last one that marked the region dirty, so
            // it must hold valid content there.
            debug_assert!(self.surface(owner).is_region_valid(interval));

            if self.surface(owner).params.surface_type == SurfaceType::Fill {
                self.download_fill_surface(owner, interval);
            } else {
                self.download_surface(owner, interval);
            }
            flushed_intervals.insert(interval);
        }

        for seg in flushed_intervals.iter() {
            self.dirty_regions.erase(seg);
        }
    }

    pub fn flush_all(&mut self) {
        self.flush_region(0, u32::MAX, None);
    }

    /// Marks `[addr, addr + size)` as freshly written by `region_owner`
    /// (or by the guest CPU when `None`), invalidating every other
    /// overlapping surface.
    pub fn invalidate_region(&mut self, addr: PAddr, size: u32, region_owner: Option<SurfaceId>) {
        if size == 0 {
            return;
        }
        let invalid_interval = SurfaceInterval::new(addr, addr.saturating_add(size));

        if let Some(owner) = region_owner {
            let owner_surface = self.surface(owner);
            assert!(owner_surface.params.surface_type != SurfaceType::Texture);
            assert!(
                addr >= owner_surface.params.addr
                    && invalid_interval.end <= owner_surface.params.end
            );
            // Surfaces can't have a gap.
            assert_eq!(owner_surface.params.width, owner_surface.params.stride);
            self.surface_mut(owner).invalid_regions.erase(invalid_interval);
        }

        let overlapping: Vec<SurfaceId> = {
            let mut ids = SurfaceSet::new();
            for (_, set) in self.surface_cache.overlapping(invalid_interval) {
                ids.extend(set.iter().copied());
            }
            ids.into_iter().collect()
        };
        for cached_id in overlapping {
            if Some(cached_id) == region_owner {
                continue;
            }

            // A small CPU write wants the surface gone so the pages can be
            // unmarked; save its content first.
            if region_owner.is_none() && size <= 8 {
                let (surface_addr, surface_size) = {
                    let params = &self.surface(cached_id).params;
                    (params.addr, params.size)
                };
                self.flush_region(surface_addr, surface_size, Some(cached_id));
                self.remove_surfaces.insert(cached_id);
                continue;
            }

            let interval = self.surface(cached_id).interval().intersect(invalid_interval);
            self.surface_mut(cached_id).invalid_regions.insert(interval);
            self.invalidate_watchers(cached_id);

            // Fully invalid surfaces would only clog the cache.
            if self.surface(cached_id).is_fully_invalid() {
                self.remove_surfaces.insert(cached_id);
            }
        }

        if let Some(owner) = region_owner {
            self.dirty_regions.set(invalid_interval, owner);
        } else {
            self.dirty_regions.erase(invalid_interval);
        }

        let removals: Vec<SurfaceId> = std::mem::take(&mut self.remove_surfaces)
            .into_iter()
            .collect();
        for remove_id in removals {
            if Some(remove_id) == region_owner {
                // The owner was replaced by an expanded surface earlier;
                // transfer what it still holds before dropping it.
                let owner_params = self.surface(remove_id).params;
                let expanded_id = self
                    .find_match_excluding(
                        MatchFlags::SUB_RECT | MatchFlags::INVALID,
                        &owner_params,
                        ScaleMatch::Ignore,
                        None,
                        Some(remove_id),
                    )
                    .expect("removed region owner has no expanded replacement");

                let mut unsalvageable = self.surface(remove_id).invalid_regions.clone();
                unsalvageable.subtract(&self.surface(expanded_id).invalid_regions);
                if unsalvageable.is_empty() {
                    self.duplicate_surface(remove_id, expanded_id);
                } else {
                    // Content the replacement lacks is still only here; keep
                    // the surface and retry on a later invalidation.
                    continue;
                }
            }
            self.unregister_surface(remove_id);
        }
    }

    /// Flushes everything and drops every cached surface and cube.
    pub fn clear_all(&mut self, flush: bool) {
        if flush {
            self.flush_region(0, u32::MAX, None);
        }

        // Unmark every cached page.
        let spans: Vec<SurfaceInterval> =
            self.cached_pages.iter().map(|(seg, _)| seg).collect();
        for pages in spans {
            self.memory.mark_region_cached(
                pages.start << PAGE_BITS,
                pages.len() << PAGE_BITS,
                false,
            );
        }

        self.cached_pages.clear();
        self.dirty_regions.clear();
        self.surface_cache.clear();
        self.remove_surfaces.clear();
        self.watchers.clear();
        for (_, surface) in self.surfaces.drain() {
            if let Some(alloc) = surface.alloc {
                self.runtime.recycle(alloc);
            }
        }
        for (_, cube) in self.texture_cube_cache.drain() {
            if let Some(alloc) = cube.alloc {
                self.runtime.recycle(alloc);
            }
        }
    }

    // ── Public request paths ────────────────────────────────────────────

    /// Returns a surface exactly matching `params`, creating one at the
    /// best available resolution scale if needed.
    pub fn get_surface(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<SurfaceId> {
        if params.addr == 0 || params.height * params.width == 0 {
            return None;
        }
        // Use get_surface_sub_rect instead for strided requests.
        assert_eq!(params.width, params.stride);
        assert!(!params.is_tiled || (params.width % 8 == 0 && params.height % 8 == 0));

        let mut surface = self.find_match(
            MatchFlags::EXACT | MatchFlags::INVALID,
            params,
            match_res_scale,
            None,
        );

        if surface.is_none() {
            let mut target_res_scale = params.res_scale;
            if match_res_scale != ScaleMatch::Exact {
                // The region may be a sub-rect of a higher-scale surface;
                // adopt its scale so the two stay compatible.
                let mut find_params = *params;
                if let Some(expandable) = self.find_match(
                    MatchFlags::EXPAND | MatchFlags::INVALID,
                    &find_params,
                    match_res_scale,
                    None,
                ) {
                    let scale = self.surface(expandable).params.res_scale;
                    if scale > target_res_scale {
                        target_res_scale = scale;
                    }
                }
                // Keep the scale when reinterpreting D24S8 -> RGBA8.
                if params.pixel_format == PixelFormat::Rgba8 {
                    find_params.pixel_format = PixelFormat::D24S8;
                    if let Some(expandable) = self.find_match(
                        MatchFlags::EXPAND | MatchFlags::INVALID,
                        &find_params,
                        match_res_scale,
                        None,
                    ) {
                        let scale = self.surface(expandable).params.res_scale;
                        if scale > target_res_scale {
                            target_res_scale = scale;
                        }
                    }
                }
            }
            let mut new_params = *params;
            new_params.res_scale = target_res_scale;
            let id = self.create_surface(new_params);
            self.register_surface(id);
            surface = Some(id);
        }

        let id = surface.unwrap();
        if load_if_create {
            self.validate_surface(id, params.addr, params.size);
        }
        Some(id)
    }

    /// Returns a surface containing `params` as a sub-rectangle, plus the
    /// scaled rectangle of `params` within it. Expands or creates surfaces
    /// as needed.
    pub fn get_surface_sub_rect(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<(SurfaceId, Rect<u32>)> {
        if params.addr == 0 || params.height * params.width == 0 {
            return None;
        }

        let mut surface = self.find_match(
            MatchFlags::SUB_RECT | MatchFlags::INVALID,
            params,
            match_res_scale,
            None,
        );

        // The match may have failed only because of the resolution scale.
        // Recreate the low-scale surface at the requested scale so the old
        // one stops being used.
        if surface.is_none() && match_res_scale != ScaleMatch::Ignore {
            if let Some(low_scale) = self.find_match(
                MatchFlags::SUB_RECT | MatchFlags::INVALID,
                params,
                ScaleMatch::Ignore,
                None,
            ) {
                let mut new_params = self.surface(low_scale).params;
                new_params.res_scale = params.res_scale;
                let id = self.create_surface(new_params);
                self.register_surface(id);
                surface = Some(id);
            }
        }

        let mut aligned_params = *params;
        if params.is_tiled {
            aligned_params.height = aligned_params.height.next_multiple_of(8);
            aligned_params.width = aligned_params.width.next_multiple_of(8);
            aligned_params.stride = aligned_params.stride.next_multiple_of(8);
            aligned_params.update_params();
        }

        // Try expanding an overlapping surface before creating a new one.
        if surface.is_none() {
            if let Some(expandable) = self.find_match(
                MatchFlags::EXPAND | MatchFlags::INVALID,
                &aligned_params,
                match_res_scale,
                None,
            ) {
                aligned_params.width = aligned_params.stride;
                aligned_params.update_params();

                let expandable_params = self.surface(expandable).params;
                let mut new_params = expandable_params;
                new_params.addr = aligned_params.addr.min(expandable_params.addr);
                new_params.end = aligned_params.end.max(expandable_params.end);
                new_params.size = new_params.end - new_params.addr;
                new_params.height =
                    new_params.size / aligned_params.bytes_in_pixels(aligned_params.stride);
                assert_eq!(
                    new_params.size % aligned_params.bytes_in_pixels(aligned_params.stride),
                    0
                );

                let new_id = self.create_surface(new_params);
                self.duplicate_surface(expandable, new_id);

                // The replaced surface may still be in use; unlink its
                // watchers now and remove it on the next invalidation.
                self.unlink_all_watchers(expandable);
                self.remove_surfaces.insert(expandable);

                self.register_surface(new_id);
                surface = Some(new_id);
            }
        }

        let id = match surface {
            None => {
                // No subrect found; make a full-stride surface and recurse
                // through get_surface which may adjust the scale.
                let mut new_params = aligned_params;
                new_params.width = aligned_params.stride;
                new_params.update_params();
                self.get_surface(&new_params, match_res_scale, load_if_create)?
            }
            Some(id) => {
                if load_if_create {
                    self.validate_surface(id, aligned_params.addr, aligned_params.size);
                }
                id
            }
        };

        Some((id, self.surface(id).params.get_scaled_sub_rect(params)))
    }

    /// Returns the level-0 surface for a texture configuration, keeping
    /// mip levels 1..=`max_level` populated through level watchers.
    pub fn get_texture_surface(
        &mut self,
        info: &TextureInfo,
        max_level: u32,
    ) -> Option<SurfaceId> {
        if info.physical_address == 0 {
            return None;
        }

        let mut params = SurfaceParams {
            addr: info.physical_address,
            width: info.width,
            height: info.height,
            levels: max_level + 1,
            is_tiled: true,
            pixel_format: PixelFormat::from_texture_format(info.format),
            res_scale: if self.runtime.is_null_filter() {
                1
            } else {
                self.resolution_scale_factor as u16
            },
            ..Default::default()
        };
        params.update_params();

        let min_width = info.width >> max_level;
        let min_height = info.height >> max_level;
        if min_width % 8 != 0 || min_height % 8 != 0 {
            log::error!("Texture size ({min_width}x{min_height}) is not multiple of 8");
            return None;
        }
        if info.width != (min_width << max_level) || info.height != (min_height << max_level) {
            log::error!(
                "Texture size ({}x{}) does not support required mipmap level ({max_level})",
                params.width,
                params.height
            );
            return None;
        }

        let surface = self.get_surface(&params, ScaleMatch::Ignore, true)?;

        // Update mipmap levels if necessary.
        if max_level != 0 {
            if max_level >= 8 {
                // PICA textures are at most 1024 wide, eight levels total.
                log::error!("Unsupported mipmap level {max_level}");
                return None;
            }

            // With a filter active the runtime generates the chain; without
            // one each level is blitted from its own cached surface.
            if !self.runtime.is_null_filter() {
                self.runtime
                    .generate_mipmaps(self.surfaces.get(&surface).unwrap(), max_level);
            }

            let mut level_params = self.surface(surface).params;
            for level in 1..=max_level {
                // Mip levels are stored contiguously after each other.
                level_params.addr +=
                    level_params.bytes_in_pixels(level_params.width * level_params.height);
                level_params.width /= 2;
                level_params.height /= 2;
                level_params.stride = 0;
                level_params.levels = 1;
                level_params.update_params();

                let slot = (level - 1) as usize;
                let watcher_alive = self.surface(surface).level_watchers[slot]
                    .and_then(|wid| self.watchers.get(&wid))
                    .is_some_and(|w| w.get().is_some());
                if !watcher_alive {
                    if let Some(old) = self.surface_mut(surface).level_watchers[slot].take() {
                        self.release_watcher(old);
                    }
                    let level_surface =
                        self.get_surface(&level_params, ScaleMatch::Ignore, true);
                    let watcher = level_surface.map(|ls| self.create_watcher(ls));
                    self.surface_mut(surface).level_watchers[slot] = watcher;
                }

                if let Some(wid) = self.surface(surface).level_watchers[slot] {
                    if !self.watchers[&wid].is_valid() {
                        let level_surface = self.watchers[&wid].get().unwrap();
                        if !self.surface(level_surface).invalid_regions.is_empty() {
                            let (ls_addr, ls_size) = {
                                let p = &self.surface(level_surface).params;
                                (p.addr, p.size)
                            };
                            self.validate_surface(level_surface, ls_addr, ls_size);
                        }

                        if self.runtime.is_null_filter() {
                            let blit = TextureBlit {
                                src_level: 0,
                                dst_level: level,
                                src_rect: self.surface(level_surface).params.scaled_rect(),
                                dst_rect: level_params.scaled_rect(),
                                ..Default::default()
                            };
                            self.runtime.blit_textures(
                                self.surfaces.get(&level_surface).unwrap(),
                                self.surfaces.get(&surface).unwrap(),
                                &blit,
                            );
                        }

                        self.watchers.get_mut(&wid).unwrap().validate();
                    }
                }
            }
        }

        Some(surface)
    }

    /// Returns the host cube texture for the configuration, assembling and
    /// refreshing faces from their 2D surfaces as needed.
    pub fn get_texture_cube(&mut self, config: TextureCubeConfig) -> Option<TextureHandle> {
        self.texture_cube_cache
            .entry(config)
            .or_insert_with(CachedTextureCube::default);

        // Re-resolve faces whose watchers expired.
        for (index, address) in config.face_addresses().into_iter().enumerate() {
            let alive = self.texture_cube_cache[&config].faces[index]
                .and_then(|wid| self.watchers.get(&wid))
                .is_some_and(|w| w.get().is_some());
            if alive {
                continue;
            }
            if let Some(old) = self.texture_cube_cache.get_mut(&config).unwrap().faces[index].take()
            {
                self.release_watcher(old);
            }
            let info = TextureInfo {
                physical_address: address,
                width: config.width,
                height: config.width,
                format: config.format,
            };
            // A dead face address leaves the watcher empty; games are not
            // supposed to draw with those.
            let watcher = self
                .get_texture_surface(&info, 0)
                .map(|face| self.create_watcher(face));
            self.texture_cube_cache.get_mut(&config).unwrap().faces[index] = watcher;
        }

        // Allocate the host cube lazily, at the highest face scale.
        if self.texture_cube_cache[&config].alloc.is_none() {
            let mut res_scale = 1u16;
            let faces = self.texture_cube_cache[&config].faces;
            for watcher in faces.into_iter().flatten() {
                if let Some(face) = self.watchers.get(&watcher).and_then(|w| w.get()) {
                    res_scale = res_scale.max(self.surface(face).params.res_scale);
                }
            }
            let scaled_size = u32::from(res_scale) * config.width;
            let levels = 32 - scaled_size.leading_zeros();
            let alloc = self.runtime.allocate(
                PixelFormat::from_texture_format(config.format),
                TextureType::CubeMap,
                config.width,
                config.width,
                levels,
                res_scale,
            );
            let cube = self.texture_cube_cache.get_mut(&config).unwrap();
            cube.res_scale = res_scale;
            cube.alloc = alloc;
        }

        let res_scale = self.texture_cube_cache[&config].res_scale;
        let scaled_size = u32::from(res_scale) * config.width;
        let cube_handle = self.texture_cube_cache[&config].alloc.as_ref()?.draw_handle();

        // Refresh faces invalidated since the last use.
        for index in 0..6 {
            let Some(wid) = self.texture_cube_cache[&config].faces[index] else {
                continue;
            };
            if self.watchers[&wid].is_valid() {
                continue;
            }
            let face = self.watchers[&wid].get().unwrap();
            if !self.surface(face).invalid_regions.is_empty() {
                let (addr, size) = {
                    let p = &self.surface(face).params;
                    (p.addr, p.size)
                };
                self.validate_surface(face, addr, size);
            }

            let copy = TextureCopy {
                dst_layer: index as u32,
                extent: Extent {
                    width: scaled_size,
                    height: scaled_size,
                },
                ..Default::default()
            };
            self.runtime
                .copy_to_cube(self.surfaces.get(&face).unwrap(), cube_handle, &copy);
            self.watchers.get_mut(&wid).unwrap().validate();
        }

        Some(cube_handle)
    }

    /// Returns the color/depth surfaces for the framebuffer configuration,
    /// validating them over the viewport.
    pub fn get_framebuffer_surfaces(
        &mut self,
        using_color_fb: bool,
        mut using_depth_fb: bool,
        config: &FramebufferConfig,
        viewport_rect: Rect<u32>,
    ) -> RenderTargets {
        // Apply pending resolution-scale / texture-filter changes; both
        // invalidate every cached allocation.
        let pending_scale = self.pending_resolution_scale.take();
        let resolution_scale_changed =
            pending_scale.is_some_and(|scale| scale != self.resolution_scale_factor);
        let texture_filter_changed = self
            .pending_texture_filter
            .take()
            .is_some_and(|filter| self.runtime.reset_filter(filter));
        if resolution_scale_changed || texture_filter_changed {
            if let Some(scale) = pending_scale {
                self.resolution_scale_factor = scale;
            }
            self.clear_all(true);
        }

        let mut color_params = SurfaceParams {
            is_tiled: true,
            res_scale: self.resolution_scale_factor as u16,
            width: config.width,
            height: config.height,
            ..Default::default()
        };
        let mut depth_params = color_params;

        color_params.addr = config.color_address;
        color_params.pixel_format = PixelFormat::from_color_format(config.color_format);
        color_params.update_params();

        depth_params.addr = config.depth_address;
        depth_params.pixel_format = PixelFormat::from_depth_format(config.depth_format);
        depth_params.update_params();

        let color_vp_interval = color_params.get_sub_rect_interval(viewport_rect);
        let depth_vp_interval = depth_params.get_sub_rect_interval(viewport_rect);

        // Overlapping color and depth framebuffers are not supported.
        if using_color_fb
            && using_depth_fb
            && color_vp_interval.intersect(depth_vp_interval).len() != 0
        {
            log::error!(
                "Color and depth framebuffer memory regions overlap; \
                 overlapping framebuffers not supported!"
            );
            using_depth_fb = false;
        }

        let mut color = None;
        let mut color_rect = Rect::default();
        if using_color_fb {
            if let Some((id, rect)) =
                self.get_surface_sub_rect(&color_params, ScaleMatch::Exact, false)
            {
                color = Some(id);
                color_rect = rect;
            }
        }

        let mut depth = None;
        let mut depth_rect = Rect::default();
        if using_depth_fb {
            if let Some((id, rect)) =
                self.get_surface_sub_rect(&depth_params, ScaleMatch::Exact, false)
            {
                depth = Some(id);
                depth_rect = rect;
            }
        }

        let mut fb_rect = Rect::default();
        match (color, depth) {
            (Some(_), Some(_)) => {
                fb_rect = color_rect;
                // Color and depth surfaces must have matching rectangles.
                if color_rect != depth_rect {
                    color = self.get_surface(&color_params, ScaleMatch::Exact, false);
                    depth = self.get_surface(&depth_params, ScaleMatch::Exact, false);
                    if let Some(id) = color {
                        fb_rect = self.surface(id).params.scaled_rect();
                    }
                }
            }
            (Some(_), None) => fb_rect = color_rect,
            (None, Some(_)) => fb_rect = depth_rect,
            (None, None) => {}
        }

        if let Some(id) = color {
            self.validate_surface(id, color_vp_interval.start, color_vp_interval.len());
            // A surface being drawn to must never be read back through a
            // watcher snapshot.
            self.invalidate_watchers(id);
        }
        if let Some(id) = depth {
            self.validate_surface(id, depth_vp_interval.start, depth_vp_interval.len());
            self.invalidate_watchers(id);
        }

        RenderTargets {
            color,
            depth,
            fb_rect,
        }
    }

    /// Creates and registers a fill surface for a memory fill descriptor.
    pub fn get_fill_surface(&mut self, config: &MemoryFillConfig) -> SurfaceId {
        let params = SurfaceParams {
            addr: config.start,
            end: config.end,
            size: config.end - config.start,
            surface_type: SurfaceType::Fill,
            // Matches any request scale.
            res_scale: u16::MAX,
            ..Default::default()
        };

        let mut surface = Surface::new(params, None);
        surface.fill_data = config.value_32bit.to_le_bytes();
        surface.fill_size = config.fill_size();

        self.next_surface_id += 1;
        let id = SurfaceId(self.next_surface_id);
        self.surfaces.insert(id, surface);
        self.register_surface(id);
        id
    }

    /// Finds the surface satisfying a "texture copy" descriptor, and the
    /// scaled rectangle of the copied run within it.
    pub fn get_tex_copy_surface(
        &mut self,
        params: &SurfaceParams,
    ) -> Option<(SurfaceId, Rect<u32>)> {
        let match_id = self.find_match(
            MatchFlags::TEX_COPY | MatchFlags::INVALID,
            params,
            ScaleMatch::Ignore,
            None,
        )?;

        self.validate_surface(match_id, params.addr, params.size);

        let match_params = self.surface(match_id).params;
        let match_subrect = if params.width != params.stride {
            let tiled_size = if match_params.is_tiled { 8 } else { 1 };
            let mut subrect = *params;
            subrect.width = match_params.pixels_in_bytes(params.width) / tiled_size;
            subrect.stride = match_params.pixels_in_bytes(params.stride) / tiled_size;
            subrect.height *= tiled_size;
            subrect
        } else {
            let subrect = match_params.from_interval(params.interval());
            assert_eq!(subrect.interval(), params.interval());
            subrect
        };

        Some((match_id, match_params.get_scaled_sub_rect(&match_subrect)))
    }

    // ── Accelerated guest operations ────────────────────────────────────

    /// Performs a "texture copy" display transfer on the GPU. Returns
    /// false when the descriptor cannot be accelerated.
    pub fn accelerate_texture_copy(&mut self, config: &DisplayTransferConfig) -> bool {
        let copy_size = config.texture_copy.size & !15;
        if copy_size == 0 {
            return false;
        }

        let mut input_gap = config.texture_copy.input_gap * 16;
        let mut input_width = config.texture_copy.input_width * 16;
        if input_width == 0 && input_gap != 0 {
            return false;
        }
        if input_gap == 0 || input_width >= copy_size {
            input_width = copy_size;
            input_gap = 0;
        }
        if copy_size % input_width != 0 {
            return false;
        }

        let mut output_gap = config.texture_copy.output_gap * 16;
        let mut output_width = config.texture_copy.output_width * 16;
        if output_width == 0 && output_gap != 0 {
            return false;
        }
        if output_gap == 0 || output_width >= copy_size {
            output_width = copy_size;
            output_gap = 0;
        }
        if copy_size % output_width != 0 {
            return false;
        }

        // Byte-oriented source parameters; the pixel format comes from the
        // matched surface.
        let mut src_params = SurfaceParams::default();
        src_params.addr = config.input_address;
        src_params.stride = input_width + input_gap;
        src_params.width = input_width;
        src_params.height = copy_size / input_width;
        src_params.size = (src_params.height - 1) * src_params.stride + src_params.width;
        src_params.end = src_params.addr + src_params.size;

        let Some((src_surface, src_rect)) = self.get_tex_copy_surface(&src_params) else {
            return false;
        };
        let src = self.surface(src_surface).params;

        if output_gap != 0
            && (output_width
                != src.bytes_in_pixels(src_rect.width() / u32::from(src.res_scale))
                    * if src.is_tiled { 8 } else { 1 }
                || output_gap % src.bytes_in_pixels(if src.is_tiled { 64 } else { 1 }) != 0)
        {
            return false;
        }

        let mut dst_params = src;
        dst_params.addr = config.output_address;
        dst_params.width = src_rect.width() / u32::from(src.res_scale);
        dst_params.stride = dst_params.width
            + src.pixels_in_bytes(if src.is_tiled { output_gap / 8 } else { output_gap });
        dst_params.height = src_rect.height() / u32::from(src.res_scale);
        dst_params.res_scale = src.res_scale;
        dst_params.update_params();

        // The gap will be invalidated too, so it has to be loaded first.
        let load_gap = output_gap != 0;
        let Some((dst_surface, dst_rect)) =
            self.get_surface_sub_rect(&dst_params, ScaleMatch::Upscale, load_gap)
        else {
            return false;
        };

        let dst = self.surface(dst_surface).params;
        if dst.surface_type == SurfaceType::Texture
            || !check_formats_blittable(src.pixel_format, dst.pixel_format)
        {
            return false;
        }

        assert_eq!(src_rect.width(), dst_rect.width());

        let texture_copy = TextureCopy {
            src_offset: Offset {
                x: src_rect.left,
                y: src_rect.bottom,
            },
            dst_offset: Offset {
                x: dst_rect.left,
                y: dst_rect.bottom,
            },
            extent: Extent {
                width: src_rect.width(),
                height: src_rect.height(),
            },
            ..Default::default()
        };
        self.runtime.copy_textures(
            self.surfaces.get(&src_surface).unwrap(),
            self.surfaces.get(&dst_surface).unwrap(),
            &texture_copy,
        );

        self.invalidate_region(dst_params.addr, dst_params.size, Some(dst_surface));
        true
    }

    /// Performs a display transfer (possibly scaled, swizzled or flipped)
    /// on the GPU. Returns false when it cannot be accelerated.
    pub fn accelerate_display_transfer(&mut self, config: &DisplayTransferConfig) -> bool {
        let mut src_params = SurfaceParams {
            addr: config.input_address,
            width: config.output_width,
            stride: config.input_width,
            height: config.output_height,
            is_tiled: !config.input_linear,
            pixel_format: PixelFormat::from_fb_format(config.input_format),
            ..Default::default()
        };
        src_params.update_params();

        let mut dst_params = SurfaceParams {
            addr: config.output_address,
            width: if config.scaling != ScalingMode::NoScale {
                config.output_width / 2
            } else {
                config.output_width
            },
            height: if config.scaling == ScalingMode::ScaleXY {
                config.output_height / 2
            } else {
                config.output_height
            },
            is_tiled: config.input_linear != config.dont_swizzle,
            pixel_format: PixelFormat::from_fb_format(config.output_format),
            ..Default::default()
        };
        dst_params.update_params();

        let Some((src_surface, mut src_rect)) =
            self.get_surface_sub_rect(&src_params, ScaleMatch::Ignore, true)
        else {
            return false;
        };

        dst_params.res_scale = self.surface(src_surface).params.res_scale;

        let Some((dst_surface, dst_rect)) =
            self.get_surface_sub_rect(&dst_params, ScaleMatch::Upscale, false)
        else {
            return false;
        };

        let src = self.surface(src_surface).params;
        let dst = self.surface(dst_surface).params;

        if src.is_tiled != dst.is_tiled {
            src_rect = src_rect.flipped();
        }
        if config.flip_vertically {
            src_rect = src_rect.flipped();
        }

        if !check_formats_blittable(src.pixel_format, dst.pixel_format) {
            return false;
        }

        let texture_blit = TextureBlit {
            src_rect,
            dst_rect,
            ..Default::default()
        };
        self.runtime.blit_textures(
            self.surfaces.get(&src_surface).unwrap(),
            self.surfaces.get(&dst_surface).unwrap(),
            &texture_blit,
        );

        self.invalidate_region(dst_params.addr, dst_params.size, Some(dst_surface));
        true
    }

    /// Registers a fill surface covering the memory fill region.
    pub fn accelerate_fill(&mut self, config: &MemoryFillConfig) -> bool {
        if config.end <= config.start {
            return false;
        }
        let fill_surface = self.get_fill_surface(config);
        let (addr, size) = {
            let params = &self.surface(fill_surface).params;
            (params.addr, params.size)
        };
        self.invalidate_region(addr, size, Some(fill_surface));
        true
    }
}

impl<M: GuestMemory> Drop for RasterizerCache<M> {
    fn drop(&mut self) {
        self.custom_tex_manager.drain();
        self.clear_all(true);
    }
}
