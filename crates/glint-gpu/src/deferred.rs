//! Deferred resource deletion.
//!
//! Buffers read by in-flight frames cannot be freed the moment the CPU
//! stops referencing them. Resources queued here are destroyed once the
//! frame that last used them has completed.

use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;
use glint_core::FrameCount;
use std::collections::VecDeque;

/// A resource awaiting safe destruction.
pub enum DeferredResource {
    Buffer(GpuBuffer),
    Image(GpuImage),
    ImageView(vk::ImageView),
}

struct PendingDeletion {
    resource: DeferredResource,
    queued_frame: FrameCount,
}

/// Queue of resources to delete once in-flight frames no longer use them.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: FrameCount,
}

impl DeferredDeletionQueue {
    pub fn new(frames_in_flight: FrameCount) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource for deletion after the current frame completes.
    pub fn queue(&mut self, resource: DeferredResource, current_frame: FrameCount) {
        self.pending.push_back(PendingDeletion {
            resource,
            queued_frame: current_frame,
        });
    }

    /// Destroy all resources whose frames are no longer in flight.
    ///
    /// Entries are queued in frame order, so only the front of the queue
    /// needs checking.
    pub fn process(
        &mut self,
        allocator: &mut GpuAllocator,
        device: &ash::Device,
        current_frame: FrameCount,
    ) {
        let cutoff = current_frame.saturating_sub(self.frames_in_flight);

        while matches!(self.pending.front(), Some(p) if p.queued_frame <= cutoff) {
            if let Some(pending) = self.pending.pop_front() {
                Self::destroy(pending.resource, allocator, device);
            }
        }
    }

    /// Destroy everything immediately. Only valid once the device is idle.
    pub fn flush(&mut self, allocator: &mut GpuAllocator, device: &ash::Device) {
        while let Some(pending) = self.pending.pop_front() {
            Self::destroy(pending.resource, allocator, device);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_frames_in_flight(&mut self, frames_in_flight: FrameCount) {
        self.frames_in_flight = frames_in_flight;
    }

    fn destroy(resource: DeferredResource, allocator: &mut GpuAllocator, device: &ash::Device) {
        match resource {
            DeferredResource::Buffer(mut buffer) => {
                if let Err(e) = allocator.free_buffer(&mut buffer) {
                    tracing::warn!("Failed to free deferred buffer: {e}");
                }
            }
            DeferredResource::Image(mut image) => {
                if let Err(e) = allocator.free_image(&mut image) {
                    tracing::warn!("Failed to free deferred image: {e}");
                }
            }
            DeferredResource::ImageView(view) => unsafe {
                device.destroy_image_view(view, None);
            },
        }
    }
}
