use ash::vk;
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::error::Error;
use std::ffi::CStr;
use winit::window::Window;

/// Instance, surface, and logical device: everything the renderer needs
/// before any frame resources exist. Initialization failures here come back
/// as strings so the caller can surface them and try another backend.
pub struct Context {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub limits: vk::PhysicalDeviceLimits,
    pub queue_family: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,
}

impl Context {
    pub fn new(window: &Window, debug: bool) -> Result<Self, Box<dyn Error>> {
        let entry = ash::Entry::linked();

        let display_handle = window
            .display_handle()
            .map_err(|e| format!("no display handle: {e}"))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| format!("no window handle: {e}"))?
            .as_raw();

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"strobe")
            .api_version(vk::API_VERSION_1_2);
        let extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| format!("required surface extensions unavailable: {e}"))?;

        let validation = c"VK_LAYER_KHRONOS_validation";
        let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
        if debug {
            if validation_layer_available(&entry) {
                info!("enabling {:?}", validation);
                layers.push(validation.as_ptr());
            } else {
                warn!("validation requested but {:?} is not installed", validation);
            }
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe {
            entry
                .create_instance(&instance_info, None)
                .map_err(|e| format!("vkCreateInstance failed: {e}"))?
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            match ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
            {
                Ok(s) => s,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(format!("surface creation failed: {e}").into());
                }
            }
        };

        let picked = pick_device(&instance, &surface_loader, surface);
        let (physical_device, queue_family) = match picked {
            Ok(pair) => pair,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        info!("using {device_name} (queue family {queue_family})");

        let device = match create_device(&instance, physical_device, queue_family) {
            Ok(d) => d,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            physical_device,
            memory_props,
            limits: properties.limits,
            queue_family,
            device,
            queue,
        })
    }

    pub fn destroy(&self) {
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) })
            == c"VK_LAYER_KHRONOS_validation"
    })
}

/// First device exposing a graphics+present queue for our surface wins; the
/// target machines have exactly one GPU worth using.
fn pick_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32), Box<dyn Error>> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|e| format!("vkEnumeratePhysicalDevices failed: {e}"))?
    };
    if devices.is_empty() {
        return Err("no Vulkan-capable GPU present".into());
    }

    for device in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let presents = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .unwrap_or(false)
            };
            if !presents {
                continue;
            }
            if !supports_slot_indexing(instance, device) {
                warn!("skipping a device without non-uniform sampler indexing");
                continue;
            }
            return Ok((device, index));
        }
    }
    Err("no GPU offers a graphics queue that can present to this surface \
         with non-uniform sampler indexing"
        .into())
}

/// The fragment stage indexes the slot sampler array per-quad, which is
/// non-uniform within a draw; core Vulkan 1.2 exposes the required feature
/// bit.
fn supports_slot_indexing(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    features12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device, Box<dyn Error>> {
    let priorities = [1.0f32];
    let queue_info = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)];
    let extensions = [ash::khr::swapchain::NAME.as_ptr()];
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .shader_sampled_image_array_non_uniform_indexing(true);
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_info)
        .enabled_extension_names(&extensions)
        .push_next(&mut features12);
    unsafe {
        instance
            .create_device(physical_device, &device_info, None)
            .map_err(|e| format!("vkCreateDevice failed: {e}").into())
    }
}
