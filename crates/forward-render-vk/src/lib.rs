// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use forward_render::{RenderConfig, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod commands;
mod device;
mod error;
mod frame;
mod instance;
mod pipeline;
mod shader;
mod surface;
mod swapchain;
mod sync;

pub use commands::{CommandRecorder, DrawCommand};
pub use device::{
    enumerate_candidates, select_device, Device, PhysicalDeviceCandidate, QueueFamilies,
    QueueFamilyIndices, DISCRETE_GPU_BONUS,
};
pub use error::{FrameError, FrameStage, NoSuitableDeviceError, ShaderError};
pub use frame::{
    AcquireOutcome, FrameBackend, FramePresenter, FrameStatus, PresentOutcome, SlotState,
    VkFrameBackend,
};
pub use instance::InstanceContext;
pub use pipeline::{Framebuffers, GraphicsPipeline, RenderPass};
pub use shader::{ShaderModule, TriangleShaders};
pub use surface::Surface;
pub use swapchain::{drawable_extent, SwapchainState};
pub use sync::{FrameResources, FrameSlot, FRAMES_IN_FLIGHT};

/// Forward renderer over Vulkan.
///
/// Fields drop top to bottom, which is the required teardown order.
pub struct VkRenderer {
    presenter: FramePresenter,
    sync: FrameResources,
    commands: CommandRecorder,
    pipeline: GraphicsPipeline,
    framebuffers: Framebuffers,
    render_pass: RenderPass,
    swapchain: SwapchainState,
    device: Device,
    surface: Surface,
    instance: InstanceContext,

    cfg: RenderConfig,
    size: RenderSize,
    paused: bool,
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("vk: wait idle on shutdown failed: {e:#}");
        }
    }
}

fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    cfg: &RenderConfig,
) -> Result<VkRenderer> {
    let display_raw = display
        .display_handle()
        .map_err(|e| anyhow!("display handle: {e}"))?
        .as_raw();
    let window_raw = window
        .window_handle()
        .map_err(|e| anyhow!("window handle: {e}"))?
        .as_raw();

    let instance = InstanceContext::new(display_raw, cfg.validation)?;
    let surface = Surface::new(&instance, display_raw, window_raw)?;

    let chosen = select_device(enumerate_candidates(&instance, &surface)?)?;
    let device = Device::new(&instance, &chosen)?;

    let swapchain = SwapchainState::build(&device, &surface, size, cfg.present)?;
    let render_pass = RenderPass::new(&device, swapchain.format())?;
    let pipeline = {
        let shaders = TriangleShaders::load(&device, cfg.shader_dir.as_deref())?;
        GraphicsPipeline::new(&device, &render_pass, &shaders)?
    };
    let framebuffers = Framebuffers::new(
        &device,
        &render_pass,
        swapchain.image_views(),
        swapchain.extent(),
    )?;

    let mut commands = CommandRecorder::new(&device)?;
    commands.record(
        &framebuffers,
        &render_pass,
        &pipeline,
        cfg.clear_color,
        DrawCommand::TRIANGLE,
    )?;

    let sync = FrameResources::new(&device, FRAMES_IN_FLIGHT)?;
    let presenter = FramePresenter::new(FRAMES_IN_FLIGHT, swapchain.image_count());

    Ok(VkRenderer {
        presenter,
        sync,
        commands,
        pipeline,
        framebuffers,
        render_pass,
        swapchain,
        device,
        surface,
        instance,
        cfg: cfg.clone(),
        size,
        paused: size.is_zero(),
    })
}

impl VkRenderer {
    pub fn frames_presented(&self) -> u64 {
        self.presenter.frames_presented()
    }

    pub fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }

    fn draw(&mut self) -> Result<FrameStatus, FrameError> {
        let mut backend = VkFrameBackend {
            device: &self.device,
            swapchain: &self.swapchain,
            sync: &self.sync,
            commands: self.commands.buffers(),
        };
        self.presenter.draw_frame(&mut backend)
    }

    fn record_commands(&mut self) -> Result<()> {
        self.commands.record(
            &self.framebuffers,
            &self.render_pass,
            &self.pipeline,
            self.cfg.clear_color,
            DrawCommand::TRIANGLE,
        )
    }

    /// Replaces the swapchain and everything derived from it. Pauses instead
    /// when the surface currently has no area.
    fn rebuild_swapchain(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let caps = self
            .surface
            .capabilities(self.device.physical())
            .context("get_physical_device_surface_capabilities")?;
        if drawable_extent(&caps, self.size).is_none() {
            if !self.paused {
                debug!("vk: surface extent is zero, pausing");
            }
            self.paused = true;
            return Ok(());
        }

        self.swapchain
            .rebuild(&self.device, &self.surface, self.size, self.cfg.present)?;
        self.paused = false;

        if self.render_pass.format() != self.swapchain.format() {
            debug!(
                "vk: surface format {:?} -> {:?}, rebuilding pipeline",
                self.render_pass.format(),
                self.swapchain.format()
            );
            self.render_pass = RenderPass::new(&self.device, self.swapchain.format())?;
            let shaders = TriangleShaders::load(&self.device, self.cfg.shader_dir.as_deref())?;
            self.pipeline = GraphicsPipeline::new(&self.device, &self.render_pass, &shaders)?;
        }

        self.framebuffers = Framebuffers::new(
            &self.device,
            &self.render_pass,
            self.swapchain.image_views(),
            self.swapchain.extent(),
        )?;
        self.record_commands()?;

        // Semaphores of a frame whose present went stale may still be pending.
        self.sync = FrameResources::new(&self.device, self.presenter.slot_count())?;
        self.presenter.reset_images(self.swapchain.image_count());

        let extent = self.swapchain.extent();
        debug!(
            "vk: swapchain rebuilt {}x{} {:?}/{:?} mode={:?} images={}",
            extent.width,
            extent.height,
            self.swapchain.format(),
            self.swapchain.color_space(),
            self.swapchain.present_mode(),
            self.swapchain.image_count()
        );
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> Result<Self> {
        let r = build_renderer(window, display, size, cfg)?;
        let extent = r.swapchain.extent();
        info!(
            "Vulkan renderer ready ({}x{}, fmt {:?}, {} images, {} frames in flight)",
            extent.width,
            extent.height,
            r.swapchain.format(),
            r.swapchain.image_count(),
            r.presenter.slot_count()
        );
        Ok(r)
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_zero() {
            if !self.paused {
                debug!("vk: zero-sized surface, pausing");
            }
            self.paused = true;
            self.size = size;
            return Ok(());
        }
        if size == self.size && !self.paused {
            return Ok(());
        }
        self.size = size;
        self.paused = false;
        self.rebuild_swapchain()
    }

    fn render(&mut self) -> Result<()> {
        if self.paused {
            if self.size.is_zero() {
                return Ok(());
            }
            // The window has a size but the surface reported none: keep
            // polling the surface until it comes back.
            self.rebuild_swapchain()?;
            if self.paused {
                return Ok(());
            }
        }

        let before = self.presenter.frames_submitted();
        if self.draw()? == FrameStatus::Presented {
            return Ok(());
        }

        debug!("vk: swapchain stale, rebuilding");
        self.rebuild_swapchain()?;
        if self.paused {
            return Ok(());
        }

        // A stale acquire drew nothing: run the frame once on the new chain.
        if self.presenter.frames_submitted() == before && self.draw()? == FrameStatus::Stale {
            debug!("vk: swapchain still stale after rebuild, retrying next frame");
        }
        Ok(())
    }
}
