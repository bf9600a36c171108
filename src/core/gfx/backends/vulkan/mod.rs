mod batch;
mod buffer;
mod context;
mod interner;
mod pipeline;
mod slots;
mod swapchain;
mod texture;

use crate::core::gfx::{RenderQuad, SamplerDesc, SamplerFilter, SamplerWrap, TextureHandle};
use ash::vk;
use batch::QuadBatch;
use buffer::PersistentBuffer;
use cgmath::Matrix4;
use context::Context;
use image::RgbaImage;
use log::{debug, info, warn};
use pipeline::PipelineBundle;
use rustc_hash::FxHashMap;
use slots::SlotTable;
use std::error::Error;
use swapchain::SwapchainBundle;
use texture::TextureStore;
use winit::window::Window;

pub use slots::MAX_SLOTS;

/// Fixed GPU-resident storage, sized once at init. Exceeding any of these
/// is a per-frame submission refusal, not a reallocation.
pub const QUAD_BUFFER_SIZE: usize = 64 * 1024 * 1024;
pub const INDEX_BUFFER_SIZE: usize = 2 * 65535;
pub const UNIFORM_BUFFER_SIZE: usize = 65535;
/// Whole matrices that fit the uniform block (64 bytes each).
pub const MAX_MATRICES: usize = UNIFORM_BUFFER_SIZE / 64;
/// One shared staging buffer serves every texture upload; large enough for
/// a 2048x2048 RGBA8 surface, the biggest texture the renderer accepts.
const STAGING_BUFFER_SIZE: usize = 2048 * 2048 * 4;
pub const MAX_TEXTURE_SIZE: u32 = 2048;

const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Command pool, the frame's single command buffer, and the two semaphores
/// tying acquire -> submit -> present together. One frame is ever in
/// flight, so one of each suffices.
struct FrameSync {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    acquire: vk::Semaphore,
    release: vk::Semaphore,
}

impl FrameSync {
    fn new(device: &ash::Device, queue_family: u32) -> Result<Self, Box<dyn Error>> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("vkCreateCommandPool failed: {e}"))?
        };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let result = (|| -> Result<Self, Box<dyn Error>> {
            let command_buffer = unsafe {
                device
                    .allocate_command_buffers(&alloc_info)
                    .map_err(|e| format!("vkAllocateCommandBuffers failed: {e}"))?[0]
            };
            let acquire = unsafe {
                device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                    .map_err(|e| format!("vkCreateSemaphore failed: {e}"))?
            };
            let release = unsafe {
                match device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) {
                    Ok(s) => s,
                    Err(e) => {
                        device.destroy_semaphore(acquire, None);
                        return Err(format!("vkCreateSemaphore failed: {e}").into());
                    }
                }
            };
            Ok(Self {
                pool,
                command_buffer,
                acquire,
                release,
            })
        })();
        if result.is_err() {
            unsafe { device.destroy_command_pool(pool, None) };
        }
        result
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.release, None);
            device.destroy_semaphore(self.acquire, None);
            device.destroy_command_pool(self.pool, None);
        }
    }
}

/// All renderer state, explicitly constructed by `init` and threaded
/// through the free functions below. No globals.
pub struct State {
    ctx: Context,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: SwapchainBundle,
    pipeline: PipelineBundle,
    sync: FrameSync,
    quad_buffer: PersistentBuffer,
    index_buffer: PersistentBuffer,
    uniform_buffer: PersistentBuffer,
    staging: PersistentBuffer,
    samplers: FxHashMap<SamplerDesc, vk::Sampler>,
    textures: TextureStore,
    slots: SlotTable,
    batch: QuadBatch,
    fallback: TextureHandle,
    frame_counter: u64,
    pending_resize: bool,
    vsync: bool,
}

pub fn init(window: &Window, vsync: bool, gfx_debug: bool) -> Result<State, Box<dyn Error>> {
    info!("initializing Vulkan backend...");
    let ctx = Context::new(window, gfx_debug)?;

    if (ctx.limits.max_uniform_buffer_range as usize) < MAX_MATRICES * 64 {
        ctx.destroy();
        return Err(format!(
            "device uniform range {} is below the {} bytes the matrix array needs",
            ctx.limits.max_uniform_buffer_range,
            MAX_MATRICES * 64
        )
        .into());
    }
    if (ctx.limits.max_per_stage_descriptor_samplers as usize) < MAX_SLOTS {
        ctx.destroy();
        return Err(format!(
            "device exposes {} per-stage samplers, {} slots required",
            ctx.limits.max_per_stage_descriptor_samplers, MAX_SLOTS
        )
        .into());
    }

    let surface_format = match swapchain::select_surface_format(
        &ctx.surface_loader,
        ctx.physical_device,
        ctx.surface,
    ) {
        Ok(f) => f,
        Err(e) => {
            ctx.destroy();
            return Err(e);
        }
    };

    let pipeline = match PipelineBundle::new(&ctx.device, surface_format.format) {
        Ok(p) => p,
        Err(e) => {
            ctx.destroy();
            return Err(e);
        }
    };

    let swapchain_loader = ash::khr::swapchain::Device::new(&ctx.instance, &ctx.device);
    let swapchain = match SwapchainBundle::create(
        &ctx.device,
        &swapchain_loader,
        &ctx.surface_loader,
        ctx.physical_device,
        ctx.surface,
        surface_format,
        pipeline.render_pass,
        vsync,
        vk::SwapchainKHR::null(),
    ) {
        Ok(s) => s,
        Err(e) => {
            pipeline.destroy(&ctx.device);
            ctx.destroy();
            return Err(e);
        }
    };

    let sync = match FrameSync::new(&ctx.device, ctx.queue_family) {
        Ok(s) => s,
        Err(e) => {
            swapchain.destroy(&ctx.device, &swapchain_loader);
            pipeline.destroy(&ctx.device);
            ctx.destroy();
            return Err(e);
        }
    };

    let mut created: Vec<PersistentBuffer> = Vec::new();
    let requests = [
        (QUAD_BUFFER_SIZE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (INDEX_BUFFER_SIZE, vk::BufferUsageFlags::INDEX_BUFFER),
        (UNIFORM_BUFFER_SIZE, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (STAGING_BUFFER_SIZE, vk::BufferUsageFlags::TRANSFER_SRC),
    ];
    for (size, usage) in requests {
        match PersistentBuffer::new(&ctx.device, &ctx.memory_props, size as vk::DeviceSize, usage) {
            Ok(b) => created.push(b),
            Err(e) => {
                for b in created.iter().rev() {
                    b.destroy(&ctx.device);
                }
                sync.destroy(&ctx.device);
                swapchain.destroy(&ctx.device, &swapchain_loader);
                pipeline.destroy(&ctx.device);
                ctx.destroy();
                return Err(e);
            }
        }
    }
    let [quad_buffer, index_buffer, uniform_buffer, mut staging]: [PersistentBuffer; 4] =
        match created.try_into() {
            Ok(buffers) => buffers,
            Err(_) => unreachable!("four buffer requests yield four buffers"),
        };

    pipeline.write_buffer_bindings(
        &ctx.device,
        quad_buffer.buffer,
        QUAD_BUFFER_SIZE as vk::DeviceSize,
        uniform_buffer.buffer,
    );

    let samplers = match create_samplers(&ctx.device) {
        Ok(s) => s,
        Err(e) => {
            for b in [&staging, &uniform_buffer, &index_buffer, &quad_buffer] {
                b.destroy(&ctx.device);
            }
            sync.destroy(&ctx.device);
            swapchain.destroy(&ctx.device, &swapchain_loader);
            pipeline.destroy(&ctx.device);
            ctx.destroy();
            return Err(e);
        }
    };

    // The 1x1 white fallback permanently occupies slot 0, so drawing with
    // no texture bound samples plain white.
    let mut textures = TextureStore::new();
    let fallback_pixels = RgbaImage::from_pixel(1, 1, image::Rgba([255, 255, 255, 255]));
    let fallback = match textures.create(
        &ctx.device,
        &ctx.memory_props,
        sync.pool,
        ctx.queue,
        &mut staging,
        &fallback_pixels,
        SamplerDesc::default(),
    ) {
        Ok(h) => h,
        Err(e) => {
            for (_, sampler) in &samplers {
                unsafe { ctx.device.destroy_sampler(*sampler, None) };
            }
            for b in [&staging, &uniform_buffer, &index_buffer, &quad_buffer] {
                b.destroy(&ctx.device);
            }
            sync.destroy(&ctx.device);
            swapchain.destroy(&ctx.device, &swapchain_loader);
            pipeline.destroy(&ctx.device);
            ctx.destroy();
            return Err(e);
        }
    };
    let slots = SlotTable::new(fallback);
    if let Some(entry) = textures.get_mut(fallback) {
        entry.binding.slot = Some(0);
    }

    info!("Vulkan backend ready");
    Ok(State {
        ctx,
        swapchain_loader,
        swapchain,
        pipeline,
        sync,
        quad_buffer,
        index_buffer,
        uniform_buffer,
        staging,
        samplers,
        textures,
        slots,
        batch: QuadBatch::new(QUAD_BUFFER_SIZE, INDEX_BUFFER_SIZE, UNIFORM_BUFFER_SIZE),
        fallback,
        frame_counter: 1,
        pending_resize: false,
        vsync,
    })
}

/// Services a pending resize; otherwise a no-op synchronization point.
/// Acquisition is deliberately deferred to `end_frame`, right before
/// recording, so the previous frame's completion only has to be known then.
pub fn begin_frame(state: &mut State) -> Result<(), Box<dyn Error>> {
    if state.pending_resize {
        match recreate_swapchain(state) {
            Ok(()) => state.pending_resize = false,
            // Keep the flag; a minimized or mid-resize surface will come
            // back, and the next begin_frame retries.
            Err(e) => warn!("swapchain recreation failed ({e}); will retry"),
        }
    }
    Ok(())
}

/// The whole per-frame GPU cycle: wait-idle, acquire, record (descriptor
/// rebuild if stale, batch pack, one indexed draw), submit, present.
/// Acquire and present failures abort the frame and let the next one retry;
/// API failures in between are fatal.
pub fn end_frame(state: &mut State) -> Result<(), Box<dyn Error>> {
    let device = &state.ctx.device;
    unsafe {
        if let Err(e) = device.queue_wait_idle(state.ctx.queue) {
            panic!("vkQueueWaitIdle failed: {e}");
        }
    }

    let image_index = match unsafe {
        state.swapchain_loader.acquire_next_image(
            state.swapchain.handle,
            u64::MAX,
            state.sync.acquire,
            vk::Fence::null(),
        )
    } {
        Ok((index, suboptimal)) => {
            if suboptimal {
                state.pending_resize = true;
            }
            index
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            state.pending_resize = true;
            debug!(
                "swapchain out of date at acquire; dropping {} quads",
                state.batch.quad_count()
            );
            state.batch.reset();
            return Ok(());
        }
        Err(e) => {
            warn!(
                "image acquisition failed ({e}); dropping {} quads",
                state.batch.quad_count()
            );
            state.batch.reset();
            return Ok(());
        }
    };

    if state.slots.is_stale() {
        rebuild_slot_descriptors(state);
    }

    let counts = state.batch.pack(
        state.quad_buffer.mapped_slice(),
        state.index_buffer.mapped_slice(),
        state.uniform_buffer.mapped_slice(),
    );

    let device = &state.ctx.device;
    unsafe {
        if let Err(e) = device
            .reset_command_buffer(state.sync.command_buffer, vk::CommandBufferResetFlags::empty())
        {
            panic!("vkResetCommandBuffer failed: {e}");
        }
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = device.begin_command_buffer(state.sync.command_buffer, &begin_info) {
            panic!("vkBeginCommandBuffer failed: {e}");
        }

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: state.swapchain.extent,
        };
        let pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(state.pipeline.render_pass)
            .framebuffer(state.swapchain.framebuffers[image_index as usize])
            .render_area(render_area)
            .clear_values(&clear_values);
        device.cmd_begin_render_pass(
            state.sync.command_buffer,
            &pass_info,
            vk::SubpassContents::INLINE,
        );

        if counts.index_count > 0 {
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: state.swapchain.extent.width as f32,
                height: state.swapchain.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(state.sync.command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(state.sync.command_buffer, 0, &[render_area]);
            device.cmd_bind_pipeline(
                state.sync.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                state.pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                state.sync.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                state.pipeline.pipeline_layout,
                0,
                &[state.pipeline.descriptor_set],
                &[],
            );
            device.cmd_bind_index_buffer(
                state.sync.command_buffer,
                state.index_buffer.buffer,
                0,
                vk::IndexType::UINT16,
            );
            device.cmd_draw_indexed(state.sync.command_buffer, counts.index_count, 1, 0, 0, 0);
        }

        device.cmd_end_render_pass(state.sync.command_buffer);
        if let Err(e) = device.end_command_buffer(state.sync.command_buffer) {
            panic!("vkEndCommandBuffer failed: {e}");
        }
    }

    state.batch.reset();
    let rebuilt = state.slots.end_frame();
    if rebuilt {
        debug!(
            "frame {}: {} quads, descriptor set rebuilt",
            state.frame_counter, counts.quad_count
        );
    }

    let wait_semaphores = [state.sync.acquire];
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let command_buffers = [state.sync.command_buffer];
    let signal_semaphores = [state.sync.release];
    let submit = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(&command_buffers)
        .signal_semaphores(&signal_semaphores);
    unsafe {
        if let Err(e) = state
            .ctx
            .device
            .queue_submit(state.ctx.queue, &[submit], vk::Fence::null())
        {
            panic!("vkQueueSubmit failed: {e}");
        }
    }
    state.frame_counter += 1;

    let swapchains = [state.swapchain.handle];
    let image_indices = [image_index];
    let present_info = vk::PresentInfoKHR::default()
        .wait_semaphores(&signal_semaphores)
        .swapchains(&swapchains)
        .image_indices(&image_indices);
    match unsafe {
        state
            .swapchain_loader
            .queue_present(state.ctx.queue, &present_info)
    } {
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            state.pending_resize = true;
        }
        Ok(false) => {}
        Err(e) => warn!("present failed ({e}); frame dropped"),
    }
    Ok(())
}

/// New swapchain first (with the old one passed as a reuse hint), then a
/// full idle wait, then destruction of the old resources; the ordering
/// keeps the allocator warm and the stall short.
fn recreate_swapchain(state: &mut State) -> Result<(), Box<dyn Error>> {
    let new = SwapchainBundle::create(
        &state.ctx.device,
        &state.swapchain_loader,
        &state.ctx.surface_loader,
        state.ctx.physical_device,
        state.ctx.surface,
        state.swapchain.format,
        state.pipeline.render_pass,
        state.vsync,
        state.swapchain.handle,
    )?;
    unsafe {
        if let Err(e) = state.ctx.device.queue_wait_idle(state.ctx.queue) {
            panic!("vkQueueWaitIdle failed during resize: {e}");
        }
    }
    let old = std::mem::replace(&mut state.swapchain, new);
    old.destroy(&state.ctx.device, &state.swapchain_loader);
    info!(
        "swapchain recreated at {}x{}",
        state.swapchain.extent.width, state.swapchain.extent.height
    );
    Ok(())
}

/// Resize notification from the windowing layer; consumed at the next
/// `begin_frame`.
pub fn resolution_changed(state: &mut State) {
    state.pending_resize = true;
}

/// Resolves the batch's texture slot and appends the quads with the state
/// captured at this call. Returns false when the batch was refused.
#[allow(clippy::too_many_arguments)]
pub fn submit_quads(
    state: &mut State,
    quads: &[RenderQuad],
    world: &Matrix4<f32>,
    view: &Matrix4<f32>,
    projection: &Matrix4<f32>,
    uv_translate: [f32; 2],
    texture: Option<TextureHandle>,
    sampler: SamplerDesc,
) -> bool {
    let slot = match texture {
        None => 0,
        Some(handle) => {
            let Some(entry) = state.textures.get_mut(handle) else {
                panic!("draw call references unknown texture handle {handle}");
            };
            if entry.sampler != sampler {
                entry.sampler = sampler;
                state.slots.mark_stale();
            }
            state
                .slots
                .resolve(handle, &mut entry.binding, state.frame_counter)
        }
    };
    state
        .batch
        .submit(quads, world, view, projection, uv_translate, slot)
}

pub fn set_centering(state: &mut State, centering: Matrix4<f32>) {
    state.batch.set_centering(centering);
}

pub fn create_texture(
    state: &mut State,
    pixels: &RgbaImage,
    sampler: SamplerDesc,
) -> Result<TextureHandle, Box<dyn Error>> {
    let (w, h) = pixels.dimensions();
    assert!(
        w <= MAX_TEXTURE_SIZE && h <= MAX_TEXTURE_SIZE,
        "texture {w}x{h} exceeds the {MAX_TEXTURE_SIZE} limit"
    );
    state.textures.create(
        &state.ctx.device,
        &state.ctx.memory_props,
        state.sync.pool,
        state.ctx.queue,
        &mut state.staging,
        pixels,
        sampler,
    )
}

pub fn update_texture(
    state: &mut State,
    handle: TextureHandle,
    pixels: &RgbaImage,
) -> Result<(), Box<dyn Error>> {
    state.textures.update(
        &state.ctx.device,
        state.sync.pool,
        state.ctx.queue,
        &mut state.staging,
        handle,
        pixels,
    )
}

/// Waits for the queue to drain so no in-flight draw still samples the
/// image, then frees it and its slot. The next frame's descriptor set is
/// rebuilt without the dangling reference.
pub fn delete_texture(state: &mut State, handle: TextureHandle) {
    assert_ne!(
        handle, state.fallback,
        "the fallback texture cannot be deleted"
    );
    unsafe {
        if let Err(e) = state.ctx.device.queue_wait_idle(state.ctx.queue) {
            panic!("vkQueueWaitIdle failed before texture deletion: {e}");
        }
    }
    match state.textures.remove(&state.ctx.device, handle) {
        Some(mut binding) => state.slots.release(&mut binding),
        None => panic!("deletion of unknown texture handle {handle}"),
    }
}

pub fn texture_slot(state: &State, handle: TextureHandle) -> Option<u32> {
    state.textures.get(handle).and_then(|e| e.binding.slot)
}

/// Padded (power-of-two) dimensions the texture was allocated at; callers
/// scale their texture coordinates by source/padded.
pub fn texture_dimensions(state: &State, handle: TextureHandle) -> Option<(u32, u32)> {
    state.textures.get(handle).map(|e| (e.width, e.height))
}

pub fn frame_counter(state: &State) -> u64 {
    state.frame_counter
}

pub fn max_texture_size(state: &State) -> u32 {
    state.ctx.limits.max_image_dimension2_d.min(MAX_TEXTURE_SIZE)
}

pub fn cleanup(state: &mut State) {
    unsafe {
        let _ = state.ctx.device.device_wait_idle();
    }
    let device = &state.ctx.device;
    state.textures.destroy_all(device);
    for (_, sampler) in state.samplers.drain() {
        unsafe { device.destroy_sampler(sampler, None) };
    }
    state.staging.destroy(device);
    state.uniform_buffer.destroy(device);
    state.index_buffer.destroy(device);
    state.quad_buffer.destroy(device);
    state.sync.destroy(device);
    state.swapchain.destroy(device, &state.swapchain_loader);
    state.pipeline.destroy(device);
    state.ctx.destroy();
    info!("Vulkan backend cleanup complete");
}

fn create_samplers(
    device: &ash::Device,
) -> Result<FxHashMap<SamplerDesc, vk::Sampler>, Box<dyn Error>> {
    let mut samplers = FxHashMap::default();
    for filter in [SamplerFilter::Linear, SamplerFilter::Nearest] {
        for wrap in [SamplerWrap::Clamp, SamplerWrap::Repeat] {
            let desc = SamplerDesc { filter, wrap };
            let vk_filter = match filter {
                SamplerFilter::Linear => vk::Filter::LINEAR,
                SamplerFilter::Nearest => vk::Filter::NEAREST,
            };
            let address_mode = match wrap {
                SamplerWrap::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
                SamplerWrap::Repeat => vk::SamplerAddressMode::REPEAT,
            };
            let info = vk::SamplerCreateInfo::default()
                .mag_filter(vk_filter)
                .min_filter(vk_filter)
                .address_mode_u(address_mode)
                .address_mode_v(address_mode)
                .address_mode_w(address_mode);
            let sampler = unsafe {
                match device.create_sampler(&info, None) {
                    Ok(s) => s,
                    Err(e) => {
                        for (_, s) in samplers.drain() {
                            device.destroy_sampler(s, None);
                        }
                        return Err(format!("vkCreateSampler failed: {e}").into());
                    }
                }
            };
            samplers.insert(desc, sampler);
        }
    }
    Ok(samplers)
}

/// Mirrors the slot table into binding 2: resident textures get their view
/// and last-used sampler, empty slots fall back to slot 0's white texture.
fn rebuild_slot_descriptors(state: &mut State) {
    let fallback_entry = state
        .textures
        .get(state.fallback)
        .expect("fallback texture must outlive the renderer");
    let fallback_info = vk::DescriptorImageInfo {
        sampler: state.samplers[&SamplerDesc::default()],
        image_view: fallback_entry.view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };

    let mut infos = [fallback_info; MAX_SLOTS];
    for (slot, info) in infos.iter_mut().enumerate() {
        let Some(handle) = state.slots.resident(slot) else {
            continue;
        };
        let Some(entry) = state.textures.get(handle) else {
            continue;
        };
        *info = vk::DescriptorImageInfo {
            sampler: state.samplers[&entry.sampler],
            image_view: entry.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
    }
    state
        .pipeline
        .write_slot_bindings(&state.ctx.device, &infos);
    debug!(
        "descriptor set rebuilt ({} textures touched this frame)",
        state.slots.touched().len()
    );
}
