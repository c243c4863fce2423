// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Every enumerated GPU failed the eligibility checks (or none was found).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no suitable GPU: {candidates} candidate(s) enumerated, none eligible")]
pub struct NoSuitableDeviceError {
    pub candidates: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStage {
    FenceWait,
    Acquire,
    FenceReset,
    Submit,
    Present,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameStage::FenceWait => "wait_for_fences",
            FrameStage::Acquire => "acquire_next_image",
            FrameStage::FenceReset => "reset_fences",
            FrameStage::Submit => "queue_submit",
            FrameStage::Present => "queue_present",
        })
    }
}

/// Per-frame failure that is not a stale surface. Terminates the frame loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("{stage} failed: {result}")]
    Vulkan {
        stage: FrameStage,
        result: vk::Result,
    },
    #[error("acquired image {index} but the swapchain has {count} images")]
    ImageOutOfRange { index: u32, count: usize },
    #[error("frame slot {slot} out of range ({count} slots)")]
    SlotOutOfRange { slot: usize, count: usize },
}

impl FrameError {
    pub(crate) fn at(stage: FrameStage) -> impl FnOnce(vk::Result) -> FrameError {
        move |result| FrameError::Vulkan { stage, result }
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to read shader {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid SPIR-V in {origin}: {source}")]
    Spirv {
        origin: String,
        source: std::io::Error,
    },
    #[error("vkCreateShaderModule failed: {0}")]
    Create(#[from] vk::Result),
}
