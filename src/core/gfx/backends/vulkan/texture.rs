use super::buffer::{self, PersistentBuffer};
use super::slots::SlotBinding;
use crate::core::gfx::{SamplerDesc, TextureHandle};
use ash::vk;
use image::RgbaImage;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::error::Error;

/// One live GPU texture. `width`/`height` are the padded power-of-two
/// dimensions the image was allocated at; `source_width`/`source_height`
/// are what the caller actually uploaded.
pub struct TextureEntry {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub sampler: SamplerDesc,
    pub binding: SlotBinding,
}

/// Owns every GPU image the renderer can sample from, keyed by the opaque
/// handles handed to callers. Uploads run through the shared staging buffer
/// and are synchronous; see `upload`.
pub struct TextureStore {
    entries: FxHashMap<TextureHandle, TextureEntry>,
    next_handle: TextureHandle,
}

impl TextureStore {
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            next_handle: 1,
        }
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&TextureEntry> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: TextureHandle) -> Option<&mut TextureEntry> {
        self.entries.get_mut(&handle)
    }

    /// Allocates a device-local image padded up to power-of-two dimensions
    /// (the texture-size constraint of the hardware generation this design
    /// targets), uploads the pixels, and returns a process-unique handle.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        pool: vk::CommandPool,
        queue: vk::Queue,
        staging: &mut PersistentBuffer,
        pixels: &RgbaImage,
        sampler: SamplerDesc,
    ) -> Result<TextureHandle, Box<dyn Error>> {
        let (source_width, source_height) = pixels.dimensions();
        assert!(
            source_width > 0 && source_height > 0,
            "texture creation requires a non-empty surface"
        );
        let width = source_width.next_power_of_two();
        let height = source_height.next_power_of_two();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|e| format!("vkCreateImage {width}x{height} failed: {e}"))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let Some(memory_type) = buffer::find_memory_type(
            memory_props,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            unsafe { device.destroy_image(image, None) };
            return Err("no device-local memory type for texture".into());
        };
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe {
            match device.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(e) => {
                    device.destroy_image(image, None);
                    return Err(format!("texture memory allocation failed: {e}").into());
                }
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(format!("vkBindImageMemory failed: {e}").into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(color_subresource_range());
        let view = unsafe {
            match device.create_image_view(&view_info, None) {
                Ok(v) => v,
                Err(e) => {
                    device.free_memory(memory, None);
                    device.destroy_image(image, None);
                    return Err(format!("vkCreateImageView failed: {e}").into());
                }
            }
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        let entry = TextureEntry {
            image,
            memory,
            view,
            width,
            height,
            source_width,
            source_height,
            sampler,
            binding: SlotBinding::default(),
        };

        if let Err(e) = upload(device, pool, queue, staging, &entry, pixels) {
            entry.destroy(device);
            return Err(e);
        }
        debug!(
            "texture {handle}: {source_width}x{source_height} (padded {width}x{height})"
        );
        self.entries.insert(handle, entry);
        Ok(handle)
    }

    /// Full-surface replacement of an existing texture's pixels. Partial
    /// updates are not supported; the surface must match the dimensions
    /// the texture was created with.
    pub fn update(
        &mut self,
        device: &ash::Device,
        pool: vk::CommandPool,
        queue: vk::Queue,
        staging: &mut PersistentBuffer,
        handle: TextureHandle,
        pixels: &RgbaImage,
    ) -> Result<(), Box<dyn Error>> {
        let entry = self
            .entries
            .get(&handle)
            .unwrap_or_else(|| panic!("update of unknown texture handle {handle}"));
        assert_eq!(
            pixels.dimensions(),
            (entry.source_width, entry.source_height),
            "texture update must replace the full surface"
        );
        upload(device, pool, queue, staging, entry, pixels)
    }

    /// Removes the texture and frees its GPU resources. The caller must
    /// have made the queue idle first (no in-flight draw may still sample
    /// the image) and is responsible for releasing its slot.
    pub fn remove(&mut self, device: &ash::Device, handle: TextureHandle) -> Option<SlotBinding> {
        let entry = self.entries.remove(&handle)?;
        let binding = entry.binding;
        entry.destroy(device);
        Some(binding)
    }

    /// Tears down every remaining texture at shutdown.
    pub fn destroy_all(&mut self, device: &ash::Device) {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.destroy(device);
        }
        if count > 0 {
            info!("released {count} textures");
        }
    }
}

impl TextureEntry {
    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// The upload pipeline: pixels into the shared staging buffer, then a
/// one-shot command buffer doing barrier (undefined -> transfer-dst),
/// buffer-to-image copy, barrier (-> shader-read-only), waited on before
/// returning. Only one staging buffer exists, so the wait also serializes
/// back-to-back uploads.
fn upload(
    device: &ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    staging: &mut PersistentBuffer,
    entry: &TextureEntry,
    pixels: &RgbaImage,
) -> Result<(), Box<dyn Error>> {
    let bytes: &[u8] = pixels.as_raw();
    assert_eq!(
        bytes.len(),
        (entry.source_width * entry.source_height * 4) as usize,
        "pixel surface must be tightly packed 8-bit RGBA"
    );
    assert!(
        bytes.len() as vk::DeviceSize <= staging.size,
        "texture upload of {} bytes exceeds the {}-byte staging buffer",
        bytes.len(),
        staging.size
    );
    staging.mapped_slice()[..bytes.len()].copy_from_slice(bytes);

    let image = entry.image;
    let extent = vk::Extent3D {
        width: entry.source_width,
        height: entry.source_height,
        depth: 1,
    };
    let staging_buffer = staging.buffer;
    buffer::execute_one_shot(device, pool, queue, |cmd| {
        let to_transfer = vk::ImageMemoryBarrier::default()
            .image(image)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_subresource_range());
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
        }

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: extent,
        };
        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        let to_sampled = vk::ImageMemoryBarrier::default()
            .image(image)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_subresource_range());
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        }
    })
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
