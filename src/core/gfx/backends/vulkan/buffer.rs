use ash::vk;
use std::error::Error;

/// A GPU buffer that stays host-mapped for its entire lifetime. The memory
/// is HOST_COHERENT, so CPU writes through `mapped` need no explicit flush,
/// and the per-frame map/unmap round trip some drivers make expensive never
/// happens.
pub struct PersistentBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    pub size: vk::DeviceSize,
}

impl PersistentBuffer {
    pub fn new(
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, Box<dyn Error>> {
        let (buffer, memory) = create_buffer(
            device,
            memory_props,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let mapped = unsafe {
            match device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) {
                Ok(ptr) => ptr.cast::<u8>(),
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                    return Err(format!("vkMapMemory failed: {e}").into());
                }
            }
        };
        Ok(Self {
            buffer,
            memory,
            mapped,
            size,
        })
    }

    /// The CPU-visible window onto the whole buffer. Writes land in GPU
    /// memory without further ceremony; the caller is responsible for not
    /// racing in-flight GPU reads (the frame driver's idle wait covers
    /// this).
    pub fn mapped_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) }
    }

    /// Releases the buffer and its backing allocation together. The caller
    /// must guarantee the GPU is done with it.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.unmap_memory(self.memory);
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

pub fn create_buffer(
    device: &ash::Device,
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory), Box<dyn Error>> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe {
        device
            .create_buffer(&buffer_info, None)
            .map_err(|e| format!("vkCreateBuffer ({size} bytes) failed: {e}"))?
    };

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let Some(memory_type) = find_memory_type(memory_props, requirements.memory_type_bits, properties)
    else {
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(format!("no {properties:?} memory type for buffer of {size} bytes").into());
    };

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);
    let memory = unsafe {
        match device.allocate_memory(&alloc_info, None) {
            Ok(m) => m,
            Err(e) => {
                device.destroy_buffer(buffer, None);
                return Err(format!("vkAllocateMemory ({size} bytes) failed: {e}").into());
            }
        }
    };
    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_buffer(buffer, None);
        }
        return Err(format!("vkBindBufferMemory failed: {e}").into());
    }
    Ok((buffer, memory))
}

pub fn find_memory_type(
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory_props.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Records `f` into a throwaway primary command buffer, submits it, and
/// blocks on a fence until the GPU has finished. Texture uploads ride this;
/// the synchronous wait is what serializes reuse of the shared staging
/// buffer.
pub fn execute_one_shot(
    device: &ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    f: impl FnOnce(vk::CommandBuffer),
) -> Result<(), Box<dyn Error>> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| format!("vkAllocateCommandBuffers failed: {e}"))?[0]
    };

    let result = (|| -> Result<(), Box<dyn Error>> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| format!("vkBeginCommandBuffer failed: {e}"))?;
        }
        f(cmd);
        unsafe {
            device
                .end_command_buffer(cmd)
                .map_err(|e| format!("vkEndCommandBuffer failed: {e}"))?;
        }

        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| format!("vkCreateFence failed: {e}"))?
        };
        let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        let submitted = unsafe { device.queue_submit(queue, &[submit], fence) };
        let waited = match submitted {
            Ok(()) => unsafe { device.wait_for_fences(&[fence], true, u64::MAX) },
            Err(e) => Err(e),
        };
        unsafe { device.destroy_fence(fence, None) };
        waited.map_err(|e| format!("one-shot command submission failed: {e}").into())
    })();

    unsafe { device.free_command_buffers(pool, &[cmd]) };
    result
}
