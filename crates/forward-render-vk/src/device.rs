// SPDX-License-Identifier: CEPL-1.0
//! GPU selection and the logical device.
//!
//! Candidates are queried once into plain snapshots and scored by a pure
//! function, so the selection policy can be exercised without a GPU.
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use std::ffi::CStr;
use tracing::{debug, info};

use crate::error::NoSuitableDeviceError;
use crate::instance::InstanceContext;
use crate::surface::Surface;

pub const DISCRETE_GPU_BONUS: u64 = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

/// Graphics and presentation families of a device that has both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

impl QueueFamilyIndices {
    /// `families[i]` is (flags, can present to the surface) of family `i`.
    /// A family doing both is preferred over a split pair.
    pub fn resolve(families: &[(vk::QueueFlags, bool)]) -> Self {
        let graphics = |f: &vk::QueueFlags| f.contains(vk::QueueFlags::GRAPHICS);

        if let Some(i) = families
            .iter()
            .position(|(flags, present)| graphics(flags) && *present)
        {
            return Self {
                graphics: Some(i as u32),
                present: Some(i as u32),
            };
        }

        Self {
            graphics: families
                .iter()
                .position(|(flags, _)| graphics(flags))
                .map(|i| i as u32),
            present: families
                .iter()
                .position(|(_, present)| *present)
                .map(|i| i as u32),
        }
    }

    pub fn complete(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
        })
    }
}

/// Capability snapshot of one physical device against our surface.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub queue_families: QueueFamilyIndices,
    pub supports_swapchain: bool,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl PhysicalDeviceCandidate {
    pub fn is_eligible(&self) -> bool {
        self.queue_families.complete().is_some()
            && self.supports_swapchain
            && !self.formats.is_empty()
            && !self.present_modes.is_empty()
    }

    /// 0 means ineligible.
    pub fn score(&self) -> u64 {
        if !self.is_eligible() {
            return 0;
        }
        let mut score = 0;
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += DISCRETE_GPU_BONUS;
        }
        score + u64::from(self.max_image_dimension_2d)
    }
}

/// Highest strictly positive score wins; on a tie the later candidate wins.
pub fn select_device(
    candidates: Vec<PhysicalDeviceCandidate>,
) -> Result<PhysicalDeviceCandidate, NoSuitableDeviceError> {
    let total = candidates.len();
    let mut best: Option<(u64, PhysicalDeviceCandidate)> = None;

    for c in candidates {
        let score = c.score();
        debug!(
            "gpu candidate '{}' type={:?} max2d={} families={:?} swapchain={} formats={} modes={} → score {}",
            c.name,
            c.device_type,
            c.max_image_dimension_2d,
            c.queue_families,
            c.supports_swapchain,
            c.formats.len(),
            c.present_modes.len(),
            score
        );
        if score == 0 {
            continue;
        }
        if best.as_ref().map_or(true, |(s, _)| score >= *s) {
            best = Some((score, c));
        }
    }

    best.map(|(_, c)| c)
        .ok_or(NoSuitableDeviceError { candidates: total })
}

fn supports_extension(exts: &[vk::ExtensionProperties], name: &CStr) -> bool {
    exts.iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
}

/// Queries everything the scorer looks at. Surface lists are only queried
/// when the swapchain extension is present.
pub fn query_candidate(
    instance: &InstanceContext,
    surface: &Surface,
    phys: vk::PhysicalDevice,
) -> Result<PhysicalDeviceCandidate> {
    let inst = instance.raw();
    let props = unsafe { inst.get_physical_device_properties(phys) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let families: Vec<(vk::QueueFlags, bool)> =
        unsafe { inst.get_physical_device_queue_family_properties(phys) }
            .iter()
            .enumerate()
            .map(|(i, q)| (q.queue_flags, surface.supports_present(phys, i as u32)))
            .collect();

    let exts = unsafe { inst.enumerate_device_extension_properties(phys) }
        .context("enumerate_device_extension_properties")?;
    let supports_swapchain = supports_extension(&exts, swapchain::NAME);

    let (formats, present_modes) = if supports_swapchain {
        (
            surface.formats(phys).context("surface formats")?,
            surface.present_modes(phys).context("surface present modes")?,
        )
    } else {
        (Vec::new(), Vec::new())
    };

    Ok(PhysicalDeviceCandidate {
        handle: phys,
        name,
        device_type: props.device_type,
        max_image_dimension_2d: props.limits.max_image_dimension2_d,
        queue_families: QueueFamilyIndices::resolve(&families),
        supports_swapchain,
        formats,
        present_modes,
    })
}

pub fn enumerate_candidates(
    instance: &InstanceContext,
    surface: &Surface,
) -> Result<Vec<PhysicalDeviceCandidate>> {
    let devices = unsafe { instance.raw().enumerate_physical_devices() }
        .context("enumerate_physical_devices")?;
    devices
        .into_iter()
        .map(|phys| query_candidate(instance, surface, phys))
        .collect()
}

/// Logical device with its graphics and presentation queues.
pub struct Device {
    raw: ash::Device,
    physical: vk::PhysicalDevice,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    swapchain_loader: swapchain::Device,
}

impl Device {
    pub fn new(instance: &InstanceContext, chosen: &PhysicalDeviceCandidate) -> Result<Self> {
        let families = chosen
            .queue_families
            .complete()
            .context("selected device lacks graphics/present queue families")?;

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let device_exts = [swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_exts)
            .enabled_features(&features);

        let raw = unsafe { instance.raw().create_device(chosen.handle, &info, None) }
            .context("create_device")?;
        let graphics_queue = unsafe { raw.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { raw.get_device_queue(families.present, 0) };
        let swapchain_loader = swapchain::Device::new(instance.raw(), &raw);

        info!(
            "vk: device '{}' (graphics family {}, present family {})",
            chosen.name, families.graphics, families.present
        );

        Ok(Self {
            raw,
            physical: chosen.handle,
            families,
            graphics_queue,
            present_queue,
            swapchain_loader,
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.device_wait_idle() }.context("device_wait_idle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe { self.raw.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        max2d: u32,
    ) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_owned(),
            device_type,
            max_image_dimension_2d: max2d,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            supports_swapchain: true,
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    #[test]
    fn score_adds_discrete_bonus_and_max_dimension() {
        let discrete = candidate("d", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        let integrated = candidate("i", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192);
        assert_eq!(discrete.score(), 1000 + 16384);
        assert_eq!(integrated.score(), 8192);
    }

    #[test]
    fn sole_discrete_gpu_wins_over_larger_image_limits() {
        let picked = select_device(vec![
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            candidate("cpu", vk::PhysicalDeviceType::CPU, 16384),
        ])
        .unwrap();
        assert_eq!(picked.name, "dgpu");
    }

    #[test]
    fn missing_queue_role_is_ineligible() {
        let mut no_present = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_present.queue_families.present = None;
        let mut no_graphics = candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_graphics.queue_families.graphics = None;

        assert_eq!(no_present.score(), 0);
        assert_eq!(no_graphics.score(), 0);
        assert_eq!(
            select_device(vec![no_present]).unwrap_err(),
            NoSuitableDeviceError { candidates: 1 }
        );
        assert!(select_device(vec![no_graphics]).is_err());
    }

    #[test]
    fn missing_swapchain_extension_is_ineligible() {
        let mut c = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        c.supports_swapchain = false;
        assert_eq!(c.score(), 0);
        assert!(select_device(vec![c]).is_err());
    }

    #[test]
    fn empty_surface_lists_are_ineligible() {
        let mut c = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        c.formats.clear();
        c.present_modes.clear();
        assert_eq!(c.score(), 0);

        let mut no_modes = candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_modes.present_modes.clear();
        assert!(!no_modes.is_eligible());

        assert!(select_device(vec![c, no_modes]).is_err());
    }

    #[test]
    fn ineligible_discrete_loses_to_eligible_integrated() {
        let mut dgpu = candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 32768);
        dgpu.supports_swapchain = false;
        let igpu = candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);
        assert_eq!(select_device(vec![dgpu, igpu]).unwrap().name, "igpu");
    }

    #[test]
    fn no_candidates_is_an_error() {
        assert_eq!(
            select_device(Vec::new()).unwrap_err(),
            NoSuitableDeviceError { candidates: 0 }
        );
    }

    #[test]
    fn ties_go_to_the_last_enumerated() {
        let picked = select_device(vec![
            candidate("first", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
            candidate("second", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
        ])
        .unwrap();
        assert_eq!(picked.name, "second");

        // A higher score enumerated first still beats a later, lower one.
        let picked = select_device(vec![
            candidate("best", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            candidate("tied-low", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096),
            candidate("tied-low-2", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096),
        ])
        .unwrap();
        assert_eq!(picked.name, "best");
    }

    #[test]
    fn resolve_prefers_a_family_doing_both() {
        let families = [
            (vk::QueueFlags::GRAPHICS, false),
            (vk::QueueFlags::COMPUTE, true),
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
        ];
        let idx = QueueFamilyIndices::resolve(&families);
        assert_eq!(idx.graphics, Some(2));
        assert_eq!(idx.present, Some(2));
        assert!(idx.complete().unwrap().is_shared());
    }

    #[test]
    fn resolve_falls_back_to_split_families() {
        let families = [
            (vk::QueueFlags::TRANSFER, false),
            (vk::QueueFlags::GRAPHICS, false),
            (vk::QueueFlags::COMPUTE, true),
        ];
        let idx = QueueFamilyIndices::resolve(&families);
        let complete = idx.complete().unwrap();
        assert_eq!(complete.graphics, 1);
        assert_eq!(complete.present, 2);
        assert_eq!(complete.unique(), vec![1, 2]);
    }

    #[test]
    fn resolve_without_present_is_incomplete() {
        let idx = QueueFamilyIndices::resolve(&[(vk::QueueFlags::GRAPHICS, false)]);
        assert_eq!(idx.graphics, Some(0));
        assert!(idx.complete().is_none());
    }
}
