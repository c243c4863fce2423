// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;

use crate::device::Device;

/// Frames the CPU may have queued on the GPU at once.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Synchronization objects owned by one in-flight frame slot.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub in_flight: vk::Fence,
}

pub struct FrameResources {
    device: ash::Device,
    slots: Vec<FrameSlot>,
}

impl FrameResources {
    pub fn new(device: &Device, count: usize) -> Result<Self> {
        let mut res = Self {
            device: device.raw().clone(),
            slots: Vec::with_capacity(count),
        };
        let sem_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        for i in 0..count {
            // Push first so a failure halfway through still gets cleaned up.
            res.slots.push(FrameSlot {
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            });
            unsafe {
                res.slots[i].image_available = res
                    .device
                    .create_semaphore(&sem_info, None)
                    .context("create_semaphore(image_available)")?;
                res.slots[i].render_finished = res
                    .device
                    .create_semaphore(&sem_info, None)
                    .context("create_semaphore(render_finished)")?;
                res.slots[i].in_flight = res
                    .device
                    .create_fence(&fence_info, None)
                    .context("create_fence(in_flight)")?;
            }
        }
        Ok(res)
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        // Null handles are ignored by the destroy calls.
        unsafe {
            for slot in &self.slots {
                self.device.destroy_fence(slot.in_flight, None);
                self.device.destroy_semaphore(slot.render_finished, None);
                self.device.destroy_semaphore(slot.image_available, None);
            }
        }
    }
}
