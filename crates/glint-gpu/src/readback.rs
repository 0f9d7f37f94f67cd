//! Asynchronous image-to-CPU readback.
//!
//! Probe placement reads the last mip of every placement probe back to the
//! CPU. Each readback owns a host-visible buffer and a fence; the copy is
//! recorded into a caller-submitted command buffer and the result collected
//! later without stalling the frame that issued it.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;

/// Fence wait budget. Placement readbacks cover a handful of texels, so a
/// timeout here means the submit was lost, not that the copy is slow.
const READBACK_TIMEOUT_NS: u64 = 5_000_000_000;

/// Source region of a cubemap readback.
#[derive(Debug, Clone, Copy)]
pub struct ReadbackRegion {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub width: u32,
    pub height: u32,
}

/// An in-flight image readback.
pub struct SliceReadback {
    buffer: GpuBuffer,
    fence: vk::Fence,
    size: u64,
}

impl SliceReadback {
    /// Create the host-visible buffer and fence for one readback.
    pub fn new(device: &ash::Device, allocator: &mut GpuAllocator, size: u64, name: &str) -> Result<Self> {
        let buffer = allocator.create_readback_buffer(size, name)?;

        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(GpuError::from)?
        };

        Ok(Self {
            buffer,
            fence,
            size,
        })
    }

    /// Fence to attach to the queue submit carrying the recorded copy.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Record the image-to-buffer copy.
    ///
    /// Transitions the source region to `TRANSFER_SRC_OPTIMAL`, copies, and
    /// transitions back to `image_layout`.
    ///
    /// # Safety
    /// The command buffer must be in the recording state and the image valid
    /// and in `image_layout` when the commands execute.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        region: ReadbackRegion,
    ) {
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: region.mip_level,
            level_count: 1,
            base_array_layer: region.base_layer,
            layer_count: region.layer_count,
        };

        let to_transfer = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .old_layout(image_layout)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .image(image)
            .subresource_range(subresource_range);

        let barriers = [to_transfer];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency_info);

        let copy = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: region.mip_level,
                base_array_layer: region.base_layer,
                layer_count: region.layer_count,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: region.width,
                height: region.height,
                depth: 1,
            });

        device.cmd_copy_image_to_buffer(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.buffer.buffer,
            &[copy],
        );

        let to_original = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(image_layout)
            .image(image)
            .subresource_range(subresource_range);

        let barriers = [to_original];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency_info);
    }

    /// Wait for the submit carrying the copy, then return the buffer contents.
    pub fn wait(&self, device: &ash::Device) -> Result<Vec<u8>> {
        unsafe {
            device
                .wait_for_fences(&[self.fence], true, READBACK_TIMEOUT_NS)
                .map_err(GpuError::from)?;
        }

        let ptr = self
            .buffer
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Readback buffer not mapped".to_string()))?;

        let mut data = vec![0u8; self.size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), self.size as usize);
        }

        Ok(data)
    }

    /// Reset the fence so the readback can be reissued.
    pub fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device
                .reset_fences(&[self.fence])
                .map_err(GpuError::from)?;
        }
        Ok(())
    }

    /// Destroy the buffer and fence.
    ///
    /// # Safety
    /// No submitted work may still reference the buffer or fence.
    pub unsafe fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        if let Err(e) = allocator.free_buffer(&mut self.buffer) {
            tracing::warn!("Failed to free readback buffer: {e}");
        }
        device.destroy_fence(self.fence, None);
    }
}
