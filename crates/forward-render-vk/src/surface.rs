// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::surface;
use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::instance::InstanceContext;

/// Window surface. Must be dropped before the instance it came from.
pub struct Surface {
    loader: surface::Instance,
    raw: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        instance: &InstanceContext,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let raw = unsafe {
            ash_window::create_surface(instance.entry(), instance.raw(), display, window, None)
        }
        .context("ash_window::create_surface")?;
        let loader = surface::Instance::new(instance.entry(), instance.raw());
        Ok(Self { loader, raw })
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    pub fn supports_present(&self, phys: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(phys, family, self.raw)
        }
        .unwrap_or(false)
    }

    pub fn capabilities(&self, phys: vk::PhysicalDevice) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(phys, self.raw)
        }
    }

    pub fn formats(&self, phys: vk::PhysicalDevice) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.loader.get_physical_device_surface_formats(phys, self.raw) }
    }

    pub fn present_modes(&self, phys: vk::PhysicalDevice) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(phys, self.raw)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}
