// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::vk;

use crate::device::Device;
use crate::shader::TriangleShaders;

/// Single color attachment render pass: clear, store, hand off to present.
pub struct RenderPass {
    device: ash::Device,
    raw: vk::RenderPass,
    format: vk::Format,
}

impl RenderPass {
    pub fn new(device: &Device, format: vk::Format) -> Result<Self> {
        let color = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];
        let color_ref = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpass = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)];

        // The layout transition must not start before the acquire semaphore
        // (waited at COLOR_ATTACHMENT_OUTPUT) has released the image.
        let dependency = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&color)
            .subpasses(&subpass)
            .dependencies(&dependency);
        let raw = unsafe { device.raw().create_render_pass(&info, None) }
            .context("create_render_pass")?;

        Ok(Self {
            device: device.raw().clone(),
            raw,
            format,
        })
    }

    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.destroy_render_pass(self.raw, None) };
    }
}

/// One framebuffer per swapchain image view.
pub struct Framebuffers {
    device: ash::Device,
    raw: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl Framebuffers {
    pub fn new(
        device: &Device,
        render_pass: &RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut fbs = Self {
            device: device.raw().clone(),
            raw: Vec::with_capacity(views.len()),
            extent,
        };
        for &view in views {
            let attachments = [view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass.raw())
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let fb = unsafe { fbs.device.create_framebuffer(&info, None) }
                .context("create_framebuffer")?;
            fbs.raw.push(fb);
        }
        Ok(fbs)
    }

    pub fn get(&self, index: usize) -> Option<vk::Framebuffer> {
        self.raw.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        unsafe {
            for &fb in &self.raw {
                self.device.destroy_framebuffer(fb, None);
            }
        }
    }
}

/// Fixed-function state for the hardcoded triangle. Viewport and scissor are
/// dynamic so the pipeline survives extent changes; it only has to be rebuilt
/// when the render pass (i.e. the surface format) changes.
pub struct GraphicsPipeline {
    device: ash::Device,
    layout: vk::PipelineLayout,
    raw: vk::Pipeline,
}

impl GraphicsPipeline {
    pub fn new(device: &Device, render_pass: &RenderPass, shaders: &TriangleShaders) -> Result<Self> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(shaders.vertex.raw())
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shaders.fragment.raw())
                .name(c"main"),
        ];

        // No vertex input: positions and colors come from gl_VertexIndex.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dyn_states);

        let layout_info = vk::PipelineLayoutCreateInfo::default();
        let layout = unsafe { device.raw().create_pipeline_layout(&layout_info, None) }
            .context("create_pipeline_layout")?;

        let mut pipeline = Self {
            device: device.raw().clone(),
            layout,
            raw: vk::Pipeline::null(),
        };

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.raw())
            .subpass(0);

        let pipelines = unsafe {
            pipeline.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        }
        .map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;
        pipeline.raw = pipelines
            .into_iter()
            .next()
            .context("create_graphics_pipelines returned no pipeline")?;

        Ok(pipeline)
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.raw, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
