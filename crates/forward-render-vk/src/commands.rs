// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;

use crate::device::Device;
use crate::pipeline::{Framebuffers, GraphicsPipeline, RenderPass};

/// Parameters of the single non-indexed draw recorded per image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
}

impl DrawCommand {
    pub const TRIANGLE: DrawCommand = DrawCommand {
        vertex_count: 3,
        instance_count: 1,
    };
}

pub(crate) fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

pub(crate) fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub(crate) fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Owns the graphics command pool and one pre-recorded buffer per
/// swapchain image. Buffers are replayed every frame and only re-recorded
/// when the swapchain is rebuilt.
pub struct CommandRecorder {
    device: ash::Device,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    pub fn new(device: &Device) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.families().graphics);
        let pool = unsafe { device.raw().create_command_pool(&info, None) }
            .context("create_command_pool")?;
        Ok(Self {
            device: device.raw().clone(),
            pool,
            buffers: Vec::new(),
        })
    }

    /// Frees the previous buffers and records one per framebuffer.
    /// Caller must make sure none of the old buffers is still pending.
    pub fn record(
        &mut self,
        framebuffers: &Framebuffers,
        render_pass: &RenderPass,
        pipeline: &GraphicsPipeline,
        clear: [f32; 4],
        draw: DrawCommand,
    ) -> Result<()> {
        self.free_buffers();

        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(framebuffers.len() as u32);
        self.buffers = unsafe { self.device.allocate_command_buffers(&alloc) }
            .context("allocate_command_buffers")?;

        let extent = framebuffers.extent();
        let clears = [clear_value(clear)];
        let viewports = [full_viewport(extent)];
        let scissors = [full_scissor(extent)];

        for (i, &cmd) in self.buffers.iter().enumerate() {
            let framebuffer = framebuffers
                .get(i)
                .context("framebuffer count changed during recording")?;
            let begin = vk::CommandBufferBeginInfo::default();
            let rp_begin = vk::RenderPassBeginInfo::default()
                .render_pass(render_pass.raw())
                .framebuffer(framebuffer)
                .render_area(full_scissor(extent))
                .clear_values(&clears);

            unsafe {
                self.device
                    .begin_command_buffer(cmd, &begin)
                    .context("begin_command_buffer")?;
                self.device
                    .cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.raw());
                self.device.cmd_set_viewport(cmd, 0, &viewports);
                self.device.cmd_set_scissor(cmd, 0, &scissors);
                self.device
                    .cmd_draw(cmd, draw.vertex_count, draw.instance_count, 0, 0);
                self.device.cmd_end_render_pass(cmd);
                self.device
                    .end_command_buffer(cmd)
                    .context("end_command_buffer")?;
            }
        }
        Ok(())
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    fn free_buffers(&mut self) {
        if !self.buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.pool, &self.buffers) };
            self.buffers.clear();
        }
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        // Destroying the pool frees its buffers.
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_is_one_instance_of_three_vertices() {
        assert_eq!(DrawCommand::TRIANGLE.vertex_count, 3);
        assert_eq!(DrawCommand::TRIANGLE.instance_count, 1);
    }

    #[test]
    fn viewport_and_scissor_cover_extent() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let vp = full_viewport(extent);
        assert_eq!((vp.x, vp.y), (0.0, 0.0));
        assert_eq!((vp.width, vp.height), (800.0, 600.0));
        assert_eq!((vp.min_depth, vp.max_depth), (0.0, 1.0));

        let sc = full_scissor(extent);
        assert_eq!((sc.offset.x, sc.offset.y), (0, 0));
        assert_eq!(sc.extent, extent);
    }

    #[test]
    fn clear_value_carries_rgba() {
        let v = clear_value([0.1, 0.2, 0.3, 1.0]);
        assert_eq!(unsafe { v.color.float32 }, [0.1, 0.2, 0.3, 1.0]);
    }
}
