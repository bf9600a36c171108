use ash::vk;
use log::info;
use std::error::Error;

/// The swapchain and the per-image resources hanging off it. Recreated
/// wholesale on resize; `create` takes the old handle so the driver can
/// recycle resources instead of stalling.
pub struct SwapchainBundle {
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

/// Picks the surface format once, before the render pass exists; the
/// swapchain is then created (and recreated) against it.
pub fn select_surface_format(
    surface_loader: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<vk::SurfaceFormatKHR, Box<dyn Error>> {
    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_err(|e| format!("surface format query failed: {e}"))?
    };
    choose_surface_format(&formats)
        .ok_or_else(|| "no 8-bit BGRA/RGBA sRGB-nonlinear surface format available".into())
}

impl SwapchainBundle {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        format: vk::SurfaceFormatKHR,
        render_pass: vk::RenderPass,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self, Box<dyn Error>> {
        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(|e| format!("surface capability query failed: {e}"))?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(|e| format!("present mode query failed: {e}"))?
        };

        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = capabilities.current_extent;
        if extent.width == 0 || extent.height == 0 {
            return Err("surface reports a zero-sized extent".into());
        }
        let image_count = choose_image_count(&capabilities);

        info!(
            "swapchain: {}x{}, {:?}/{:?}, {:?}, {} images",
            extent.width, extent.height, format.format, format.color_space, present_mode, image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let handle = unsafe {
            swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| format!("vkCreateSwapchainKHR failed: {e}"))?
        };

        let images = unsafe {
            match swapchain_loader.get_swapchain_images(handle) {
                Ok(images) => images,
                Err(e) => {
                    swapchain_loader.destroy_swapchain(handle, None);
                    return Err(format!("vkGetSwapchainImagesKHR failed: {e}").into());
                }
            }
        };

        let mut views = Vec::with_capacity(images.len());
        let mut framebuffers = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe {
                match device.create_image_view(&view_info, None) {
                    Ok(v) => v,
                    Err(e) => {
                        destroy_views(device, swapchain_loader, handle, &views, &framebuffers);
                        return Err(format!("swapchain image view creation failed: {e}").into());
                    }
                }
            };
            views.push(view);

            let attachments = [view];
            let fb_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe {
                match device.create_framebuffer(&fb_info, None) {
                    Ok(f) => f,
                    Err(e) => {
                        destroy_views(device, swapchain_loader, handle, &views, &framebuffers);
                        return Err(format!("framebuffer creation failed: {e}").into());
                    }
                }
            };
            framebuffers.push(framebuffer);
        }

        Ok(Self {
            handle,
            format,
            extent,
            views,
            framebuffers,
        })
    }

    pub fn destroy(&self, device: &ash::Device, swapchain_loader: &ash::khr::swapchain::Device) {
        unsafe {
            for &fb in &self.framebuffers {
                device.destroy_framebuffer(fb, None);
            }
            for &view in &self.views {
                device.destroy_image_view(view, None);
            }
            swapchain_loader.destroy_swapchain(self.handle, None);
        }
    }
}

fn destroy_views(
    device: &ash::Device,
    swapchain_loader: &ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    views: &[vk::ImageView],
    framebuffers: &[vk::Framebuffer],
) {
    unsafe {
        for &fb in framebuffers {
            device.destroy_framebuffer(fb, None);
        }
        for &view in views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(handle, None);
    }
}

/// sRGB-nonlinear color space with one of the two 8-bit swizzles, first
/// match wins. Anything else is an initialization failure upstream.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                && (f.format == vk::Format::B8G8R8A8_UNORM || f.format == vk::Format::R8G8B8A8_UNORM)
        })
        .copied()
}

/// Lowest-latency non-blocking mode when vsync is off; FIFO (guaranteed by
/// the API) otherwise and as the silent fallback.
fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for preferred in [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX] {
            if modes.contains(&preferred) {
                return preferred;
            }
        }
    }
    vk::PresentModeKHR::FIFO
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_first_match_wins() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn surface_format_requires_srgb_nonlinear() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        assert!(choose_surface_format(&formats).is_none());
    }

    #[test]
    fn present_mode_prefers_immediate_without_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_respects_surface_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 2);
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded), 3);
    }
}
