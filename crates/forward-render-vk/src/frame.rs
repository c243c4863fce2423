// SPDX-License-Identifier: CEPL-1.0
//! Per-frame acquire / submit / present protocol.
//!
//! [`FramePresenter`] only tracks indices: which slot is current, which slot
//! last rendered into each swapchain image. The GPU side is behind
//! [`FrameBackend`] so the ordering can be exercised without a device.

use ash::vk;

use crate::device::Device;
use crate::error::{FrameError, FrameStage};
use crate::swapchain::SwapchainState;
use crate::sync::{FrameResources, FrameSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Submitted,
    /// Handed to the presentation engine; cleared by the next throttle wait.
    Presenting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { index: u32, suboptimal: bool },
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

/// Result of one `draw_frame`. `Stale` asks the caller to rebuild the
/// swapchain before the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    Stale,
}

/// GPU operations of one frame, addressed by frame slot.
pub trait FrameBackend {
    /// Blocks until the slot's in-flight fence is signaled.
    fn wait_for_slot(&mut self, slot: usize) -> Result<(), FrameError>;
    fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError>;
    /// Signals the slot's image-available semaphore on success.
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome, FrameError>;
    /// Waits image-available, signals render-finished and the slot fence.
    fn submit(&mut self, slot: usize, image: u32) -> Result<(), FrameError>;
    /// Waits render-finished.
    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome, FrameError>;
}

pub struct FramePresenter {
    states: Vec<SlotState>,
    current: usize,
    /// Slot whose fence guards the last submission that rendered each image.
    images_in_flight: Vec<Option<usize>>,
    submitted: u64,
    presented: u64,
}

impl FramePresenter {
    pub fn new(slot_count: usize, image_count: usize) -> Self {
        assert!(slot_count > 0, "frame presenter needs at least one slot");
        Self {
            states: vec![SlotState::Idle; slot_count],
            current: 0,
            images_in_flight: vec![None; image_count],
            submitted: 0,
            presented: 0,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.states.len()
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.states.get(slot).copied()
    }

    pub fn image_owner(&self, image: usize) -> Option<usize> {
        self.images_in_flight.get(image).copied().flatten()
    }

    /// Frames that reached the present step, stale or not.
    pub fn frames_submitted(&self) -> u64 {
        self.submitted
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    /// Forgets image ownership after the swapchain was rebuilt.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
        self.states.fill(SlotState::Idle);
    }

    pub fn draw_frame<B: FrameBackend>(&mut self, gpu: &mut B) -> Result<FrameStatus, FrameError> {
        let slot = self.current;

        gpu.wait_for_slot(slot)?;
        self.states[slot] = SlotState::Acquiring;

        let (image, suboptimal) = match gpu.acquire(slot) {
            Ok(AcquireOutcome::Ready { index, suboptimal }) => (index, suboptimal),
            Ok(AcquireOutcome::Stale) => {
                // Fence untouched and slot kept: the retry after rebuild reuses it.
                self.states[slot] = SlotState::Idle;
                return Ok(FrameStatus::Stale);
            }
            Err(err) => {
                self.states[slot] = SlotState::Idle;
                return Err(err);
            }
        };

        let count = self.images_in_flight.len();
        let owner = match self.images_in_flight.get(image as usize) {
            Some(owner) => *owner,
            None => {
                self.states[slot] = SlotState::Idle;
                return Err(FrameError::ImageOutOfRange { index: image, count });
            }
        };
        if let Some(owner) = owner {
            if owner != slot {
                gpu.wait_for_slot(owner)?;
            }
        }
        self.images_in_flight[image as usize] = Some(slot);

        gpu.reset_slot(slot)?;
        gpu.submit(slot, image)?;
        self.states[slot] = SlotState::Submitted;

        let presented = gpu.present(slot, image);
        self.states[slot] = SlotState::Presenting;
        self.current = (slot + 1) % self.states.len();
        self.submitted += 1;

        match presented? {
            PresentOutcome::Presented => {
                self.presented += 1;
                Ok(if suboptimal {
                    FrameStatus::Stale
                } else {
                    FrameStatus::Presented
                })
            }
            PresentOutcome::Stale => Ok(FrameStatus::Stale),
        }
    }
}

/// [`FrameBackend`] over the live device, swapchain and sync objects.
pub struct VkFrameBackend<'a> {
    pub device: &'a Device,
    pub swapchain: &'a SwapchainState,
    pub sync: &'a FrameResources,
    pub commands: &'a [vk::CommandBuffer],
}

impl VkFrameBackend<'_> {
    fn slot(&self, slot: usize) -> Result<&FrameSlot, FrameError> {
        self.sync.slot(slot).ok_or(FrameError::SlotOutOfRange {
            slot,
            count: self.sync.len(),
        })
    }
}

impl FrameBackend for VkFrameBackend<'_> {
    fn wait_for_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        let fence = [self.slot(slot)?.in_flight];
        unsafe { self.device.raw().wait_for_fences(&fence, true, u64::MAX) }
            .map_err(FrameError::at(FrameStage::FenceWait))
    }

    fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        let fence = [self.slot(slot)?.in_flight];
        unsafe { self.device.raw().reset_fences(&fence) }
            .map_err(FrameError::at(FrameStage::FenceReset))
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome, FrameError> {
        let sem = self.slot(slot)?.image_available;
        let res = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.raw(),
                u64::MAX,
                sem,
                vk::Fence::null(),
            )
        };
        match res {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(FrameError::at(FrameStage::Acquire)(e)),
        }
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let s = *self.slot(slot)?;
        let cmd = self
            .commands
            .get(image as usize)
            .copied()
            .ok_or(FrameError::ImageOutOfRange {
                index: image,
                count: self.commands.len(),
            })?;

        let wait_sems = [s.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [cmd];
        let signal_sems = [s.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_sems)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal_sems);

        unsafe {
            self.device.raw().queue_submit(
                self.device.graphics_queue(),
                std::slice::from_ref(&submit),
                s.in_flight,
            )
        }
        .map_err(FrameError::at(FrameStage::Submit))
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome, FrameError> {
        let wait_sems = [self.slot(slot)?.render_finished];
        let swapchains = [self.swapchain.raw()];
        let indices = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_sems)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let res = unsafe {
            self.swapchain
                .loader()
                .queue_present(self.device.present_queue(), &info)
        };
        match res {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(FrameError::at(FrameStage::Present)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        /// Slot waited on and the submission number its fence last guarded.
        Wait { slot: usize, guarded: Option<usize> },
        Acquire { slot: usize },
        Reset { slot: usize },
        Submit { slot: usize, image: u32 },
        Present { slot: usize, image: u32 },
    }

    /// In-order GPU: submissions complete FIFO, and only when someone waits.
    struct MockGpu {
        images: u32,
        next_image: u32,
        signaled: Vec<bool>,
        queue: VecDeque<usize>,
        submissions: usize,
        last_submit: Vec<Option<usize>>,
        max_outstanding: usize,
        acquire_script: VecDeque<Result<AcquireOutcome, FrameError>>,
        present_script: VecDeque<Result<PresentOutcome, FrameError>>,
        events: Vec<Event>,
    }

    impl MockGpu {
        fn new(slots: usize, images: u32) -> Self {
            Self {
                images,
                next_image: 0,
                signaled: vec![true; slots],
                queue: VecDeque::new(),
                submissions: 0,
                last_submit: vec![None; slots],
                max_outstanding: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                events: Vec::new(),
            }
        }

        fn submitted_slots(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Submit { slot, .. } => Some(*slot),
                    _ => None,
                })
                .collect()
        }

        /// Waits that directly precede an acquire.
        fn throttle_waits(&self) -> Vec<Event> {
            self.events
                .windows(2)
                .filter(|w| matches!(w[1], Event::Acquire { .. }))
                .map(|w| w[0])
                .collect()
        }
    }

    impl FrameBackend for MockGpu {
        fn wait_for_slot(&mut self, slot: usize) -> Result<(), FrameError> {
            while !self.signaled[slot] {
                let done = self
                    .queue
                    .pop_front()
                    .expect("waiting on an unsignaled fence with no work queued");
                self.signaled[done] = true;
            }
            self.events.push(Event::Wait {
                slot,
                guarded: self.last_submit[slot],
            });
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError> {
            assert!(self.signaled[slot], "reset of a fence still in flight");
            self.signaled[slot] = false;
            self.events.push(Event::Reset { slot });
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome, FrameError> {
            self.events.push(Event::Acquire { slot });
            if let Some(scripted) = self.acquire_script.pop_front() {
                return scripted;
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images;
            Ok(AcquireOutcome::Ready {
                index,
                suboptimal: false,
            })
        }

        fn submit(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
            assert!(!self.signaled[slot], "submit with a signaled fence");
            self.queue.push_back(slot);
            self.submissions += 1;
            self.last_submit[slot] = Some(self.submissions);
            self.max_outstanding = self.max_outstanding.max(self.queue.len());
            self.events.push(Event::Submit { slot, image });
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome, FrameError> {
            self.events.push(Event::Present { slot, image });
            self.present_script
                .pop_front()
                .unwrap_or(Ok(PresentOutcome::Presented))
        }
    }

    #[test]
    fn three_images_two_slots_five_frames() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        for _ in 0..5 {
            assert_eq!(fp.draw_frame(&mut gpu), Ok(FrameStatus::Presented));
        }
        assert_eq!(gpu.submitted_slots(), vec![0, 1, 0, 1, 0]);
        assert_eq!(fp.frames_presented(), 5);

        // Each reuse is preceded by exactly one wait that saw the previous
        // submission on that slot.
        let throttles = gpu.throttle_waits();
        assert_eq!(
            throttles,
            vec![
                Event::Wait { slot: 0, guarded: None },
                Event::Wait { slot: 1, guarded: None },
                Event::Wait { slot: 0, guarded: Some(1) },
                Event::Wait { slot: 1, guarded: Some(2) },
                Event::Wait { slot: 0, guarded: Some(3) },
            ]
        );
        for slot in 0..2 {
            let resets = gpu
                .events
                .iter()
                .filter(|e| **e == Event::Reset { slot })
                .count();
            let submits = gpu
                .submitted_slots()
                .iter()
                .filter(|s| **s == slot)
                .count();
            assert_eq!(resets, submits);
        }
    }

    #[test]
    fn never_more_than_two_frames_outstanding() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        for _ in 0..20 {
            fp.draw_frame(&mut gpu).unwrap();
        }
        assert!(gpu.max_outstanding <= 2, "{} outstanding", gpu.max_outstanding);
    }

    #[test]
    fn throttle_observes_frame_two_back() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        for _ in 0..10 {
            fp.draw_frame(&mut gpu).unwrap();
        }
        for (i, wait) in gpu.throttle_waits().into_iter().enumerate() {
            let n = i + 1;
            let expected = if n > 2 { Some(n - 2) } else { None };
            assert_eq!(
                wait,
                Event::Wait {
                    slot: i % 2,
                    guarded: expected
                }
            );
        }
    }

    #[test]
    fn waits_on_other_slot_that_owns_the_image() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        // Images 0,1,2 go to slots 0,1,0. Frame 4 gets image 0 on slot 1.
        for _ in 0..3 {
            fp.draw_frame(&mut gpu).unwrap();
        }
        assert_eq!(fp.image_owner(0), Some(0));
        let before = gpu.events.len();
        fp.draw_frame(&mut gpu).unwrap();
        let frame: Vec<Event> = gpu.events[before..].to_vec();
        assert_eq!(
            frame,
            vec![
                Event::Wait { slot: 1, guarded: Some(2) },
                Event::Acquire { slot: 1 },
                Event::Wait { slot: 0, guarded: Some(3) },
                Event::Reset { slot: 1 },
                Event::Submit { slot: 1, image: 0 },
                Event::Present { slot: 1, image: 0 },
            ]
        );
        assert_eq!(fp.image_owner(0), Some(1));
    }

    #[test]
    fn no_extra_wait_when_image_owned_by_same_slot() {
        let mut gpu = MockGpu::new(2, 2);
        let mut fp = FramePresenter::new(2, 2);
        for _ in 0..6 {
            fp.draw_frame(&mut gpu).unwrap();
        }
        let waits = gpu
            .events
            .iter()
            .filter(|e| matches!(e, Event::Wait { .. }))
            .count();
        assert_eq!(waits, 6);
    }

    #[test]
    fn rotation_ignores_present_results() {
        let mut gpu = MockGpu::new(2, 3);
        for i in 0..7 {
            gpu.present_script.push_back(Ok(if i % 2 == 0 {
                PresentOutcome::Stale
            } else {
                PresentOutcome::Presented
            }));
        }
        let mut fp = FramePresenter::new(2, 3);
        for f in 1..=7u64 {
            let status = fp.draw_frame(&mut gpu).unwrap();
            let expected = if f % 2 == 1 {
                FrameStatus::Stale
            } else {
                FrameStatus::Presented
            };
            assert_eq!(status, expected);
            assert_eq!(fp.current_slot() as u64, f % 2);
        }
        assert_eq!(fp.frames_submitted(), 7);
        assert_eq!(fp.frames_presented(), 3);
    }

    #[test]
    fn stale_acquire_keeps_slot_and_fence() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Ok(AcquireOutcome::Stale));
        let mut fp = FramePresenter::new(2, 3);

        assert_eq!(fp.draw_frame(&mut gpu), Ok(FrameStatus::Stale));
        assert_eq!(fp.current_slot(), 0);
        assert_eq!(fp.slot_state(0), Some(SlotState::Idle));
        assert!(gpu.signaled[0]);
        assert!(gpu.submitted_slots().is_empty());
        assert!(!gpu.events.iter().any(|e| matches!(e, Event::Reset { .. })));

        // Retry goes through on the same slot without blocking.
        fp.reset_images(3);
        assert_eq!(fp.draw_frame(&mut gpu), Ok(FrameStatus::Presented));
        assert_eq!(gpu.submitted_slots(), vec![0]);
        assert_eq!(fp.current_slot(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Ok(AcquireOutcome::Ready {
            index: 1,
            suboptimal: true,
        }));
        let mut fp = FramePresenter::new(2, 3);
        assert_eq!(fp.draw_frame(&mut gpu), Ok(FrameStatus::Stale));
        assert_eq!(gpu.submitted_slots(), vec![0]);
        assert_eq!(fp.image_owner(1), Some(0));
        assert_eq!(fp.current_slot(), 1);
    }

    #[test]
    fn present_error_still_advances() {
        let mut gpu = MockGpu::new(2, 3);
        let lost = FrameError::Vulkan {
            stage: FrameStage::Present,
            result: vk::Result::ERROR_DEVICE_LOST,
        };
        gpu.present_script.push_back(Err(lost));
        let mut fp = FramePresenter::new(2, 3);
        assert_eq!(fp.draw_frame(&mut gpu), Err(lost));
        assert_eq!(fp.current_slot(), 1);
        assert_eq!(fp.frames_presented(), 0);
    }

    #[test]
    fn acquire_error_is_fatal_and_keeps_slot() {
        let mut gpu = MockGpu::new(2, 3);
        let err = FrameError::Vulkan {
            stage: FrameStage::Acquire,
            result: vk::Result::ERROR_SURFACE_LOST_KHR,
        };
        gpu.acquire_script.push_back(Err(err));
        let mut fp = FramePresenter::new(2, 3);
        assert_eq!(fp.draw_frame(&mut gpu), Err(err));
        assert_eq!(fp.current_slot(), 0);
        assert!(gpu.submitted_slots().is_empty());
    }

    #[test]
    fn out_of_range_image_is_rejected() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Ok(AcquireOutcome::Ready {
            index: 5,
            suboptimal: false,
        }));
        let mut fp = FramePresenter::new(2, 3);
        assert_eq!(
            fp.draw_frame(&mut gpu),
            Err(FrameError::ImageOutOfRange { index: 5, count: 3 })
        );
        assert!(gpu.submitted_slots().is_empty());
        assert!(gpu.signaled[0]);
    }

    #[test]
    fn slot_states_follow_the_frame() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        assert_eq!(fp.slot_count(), 2);
        assert_eq!(fp.slot_state(0), Some(SlotState::Idle));
        fp.draw_frame(&mut gpu).unwrap();
        assert_eq!(fp.slot_state(0), Some(SlotState::Presenting));
        assert_eq!(fp.slot_state(1), Some(SlotState::Idle));
        assert_eq!(fp.slot_state(2), None);
    }

    #[test]
    fn reset_images_clears_ownership() {
        let mut gpu = MockGpu::new(2, 3);
        let mut fp = FramePresenter::new(2, 3);
        for _ in 0..3 {
            fp.draw_frame(&mut gpu).unwrap();
        }
        fp.reset_images(4);
        for image in 0..4 {
            assert_eq!(fp.image_owner(image), None);
        }
        assert_eq!(fp.slot_state(0), Some(SlotState::Idle));
        // Slot rotation survives a rebuild.
        assert_eq!(fp.current_slot(), 1);
    }
}
