// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use forward_render::{PresentPreference, RenderSize};
use tracing::info;

use crate::device::{Device, QueueFamilies};
use crate::surface::Surface;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .unwrap_or_default()
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentPreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentPreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// The extent a swapchain would get, or `None` while the surface has no
/// area (minimised windows report a 0x0 current extent on some platforms).
pub fn drawable_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> Option<vk::Extent2D> {
    let extent = choose_extent(caps, want);
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// One more than the minimum, capped by the maximum (0 == "no max").
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&a| supported.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Concurrent sharing across both families when they differ.
pub fn sharing_mode(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    }
}

fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// Presentable image chain plus one view per image.
///
/// Never patched in place: `rebuild` creates a fresh chain from re-queried
/// surface capabilities and drops the old one.
pub struct SwapchainState {
    device: ash::Device,
    loader: swapchain::Device,
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl SwapchainState {
    pub fn build(
        device: &Device,
        surface: &Surface,
        want: RenderSize,
        preference: PresentPreference,
    ) -> Result<Self> {
        Self::create(device, surface, want, preference, vk::SwapchainKHR::null())
    }

    /// Caller must make sure the device is idle.
    pub fn rebuild(
        &mut self,
        device: &Device,
        surface: &Surface,
        want: RenderSize,
        preference: PresentPreference,
    ) -> Result<()> {
        let next = Self::create(device, surface, want, preference, self.raw)?;
        *self = next;
        Ok(())
    }

    fn create(
        device: &Device,
        surface: &Surface,
        want: RenderSize,
        preference: PresentPreference,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let phys = device.physical();
        let caps = surface
            .capabilities(phys)
            .context("get_physical_device_surface_capabilities")?;
        let formats = surface
            .formats(phys)
            .context("get_physical_device_surface_formats")?;
        let modes = surface
            .present_modes(phys)
            .context("get_physical_device_surface_present_modes")?;

        let surf_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&modes, preference);
        let extent = drawable_extent(&caps, want).context("surface has a zero extent")?;
        let min_count = choose_image_count(&caps);
        let (sharing, family_indices) = sharing_mode(device.families());

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw())
            .min_image_count(min_count)
            .image_format(surf_format.format)
            .image_color_space(surf_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(choose_composite_alpha(caps.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = device.swapchain_loader().clone();
        let raw = unsafe { loader.create_swapchain(&info, None) }.context("create_swapchain")?;

        // From here on, Drop releases whatever was created.
        let mut state = Self {
            device: device.raw().clone(),
            loader,
            raw,
            images: Vec::new(),
            views: Vec::new(),
            format: surf_format.format,
            color_space: surf_format.color_space,
            present_mode,
            extent,
        };

        state.images =
            unsafe { state.loader.get_swapchain_images(raw) }.context("get_swapchain_images")?;

        for &image in &state.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surf_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { state.device.create_image_view(&view_info, None) }
                .context("create_image_view")?;
            state.views.push(view);
        }

        info!(
            "vk: swapchain {}x{} fmt={:?}/{:?} present={} images={} (min={}, max={}) sharing={:?}",
            extent.width,
            extent.height,
            state.format,
            state.color_space,
            pm_name(present_mode),
            state.images.len(),
            caps.min_image_count,
            caps.max_image_count,
            sharing
        );

        Ok(state)
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub fn loader(&self) -> &swapchain::Device {
        &self.loader
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn image_count_is_min_plus_one_clamped_to_max() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
    }

    #[test]
    fn image_count_unbounded_when_max_is_zero() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert_eq!(choose_image_count(&caps(7, 0)), 8);
    }

    #[test]
    fn format_prefers_bgra_srgb_nonlinear() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), formats[1]);
    }

    #[test]
    fn format_falls_back_to_first_listed() {
        let formats = [
            fmt(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ),
            // right format, wrong color space
            fmt(
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            ),
        ];
        assert_eq!(choose_surface_format(&formats), formats[0]);
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_when_defined() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let e = choose_extent(
            &c,
            RenderSize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn extent_clamps_when_undefined() {
        let c = caps(2, 3);
        let big = choose_extent(
            &c,
            RenderSize {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((big.width, big.height), (1920, 64));

        let fits = choose_extent(
            &c,
            RenderSize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((fits.width, fits.height), (1280, 720));
    }

    #[test]
    fn zero_current_extent_is_not_drawable() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let want = RenderSize {
            width: 1280,
            height: 720,
        };
        let e = choose_extent(&c, want);
        assert_eq!((e.width, e.height), (0, 0));
        assert_eq!(drawable_extent(&c, want), None);

        c.current_extent = vk::Extent2D {
            width: 1280,
            height: 0,
        };
        assert_eq!(drawable_extent(&c, want), None);

        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(
            drawable_extent(&c, want),
            Some(vk::Extent2D {
                width: 800,
                height: 600
            })
        );
    }

    #[test]
    fn undefined_current_extent_is_drawable_after_clamping() {
        let c = caps(2, 3);
        let e = drawable_extent(
            &c,
            RenderSize {
                width: 0,
                height: 0,
            },
        );
        assert_eq!(
            e,
            Some(vk::Extent2D {
                width: 64,
                height: 64
            })
        );
    }

    #[test]
    fn sharing_is_concurrent_only_for_split_families() {
        let (mode, idx) = sharing_mode(QueueFamilies {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(idx.is_empty());

        let (mode, idx) = sharing_mode(QueueFamilies {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(idx, vec![0, 2]);
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        assert_eq!(
            choose_composite_alpha(
                vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT
            ),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED),
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
        );
    }
}
