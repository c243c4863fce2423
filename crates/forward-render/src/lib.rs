// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    /// Vsync-locked, always available.
    Fifo,
    /// Low-latency triple buffering, falls back to FIFO.
    #[default]
    Mailbox,
}

#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub present: PresentPreference,
    pub validation: bool,
    /// Directory holding `vert.spv` and `frag.spv`; embedded shaders otherwise.
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 0.0],
            present: PresentPreference::Mailbox,
            validation: cfg!(debug_assertions),
            shader_dir: None,
        }
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
}
