//! Rendering backend seam for probe capture.
//!
//! Probes do not talk to the compositor or swapchain directly; everything
//! they need from the renderer goes through [`RenderBackend`]. The engine
//! implements it on top of its workspace and texture machinery, and tests
//! implement it with a recording mock, which is what lets the whole probe
//! lifecycle run headless.

use glint_core::types::VisibilityMask;
use glint_scene::Camera;
use serde::{Deserialize, Serialize};

/// Opaque handle to a backend-owned texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

/// Opaque handle to a capture workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceId(pub u32);

/// Handle to an in-flight GPU-to-CPU readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadbackTicket(pub u32);

/// Pixel formats the probe pipeline can capture into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl TextureFormat {
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Size, format and sampling of a capture texture.
///
/// Doubles as the pool key when temporary render targets are shared: two
/// probes can share an RTT only if their descs match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub samples: u32,
}

impl TextureDesc {
    pub const fn square(resolution: u32, format: TextureFormat) -> Self {
        Self {
            width: resolution,
            height: resolution,
            format,
            samples: 1,
        }
    }
}

/// Everything needed to instantiate one capture workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceParams {
    /// Cube texture the workspace renders into
    pub render_target: TextureHandle,
    /// Name of the workspace definition to instantiate
    pub definition: String,
    /// Extra input channels (GBuffer depth, IBL terms) beyond the target
    pub additional_channels: Vec<TextureHandle>,
    /// Which scheduled passes run the mip generation. In pooled mode the
    /// array owns the mips so the per-probe workspace runs all of them.
    pub mipmaps_execution_mask: u8,
}

/// One mapped readback: tightly packed pixels for one or more slices.
#[derive(Debug, Clone)]
pub struct ReadbackImage {
    pub width: u32,
    pub height: u32,
    pub num_slices: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl ReadbackImage {
    /// Alpha channel at the given texel, decoded to `f32`.
    pub fn alpha_at(&self, x: u32, y: u32, slice: u32) -> f32 {
        let bpp = self.format.bytes_per_pixel();
        let index = ((slice * self.height + y) * self.width + x) as usize * bpp;
        match self.format {
            TextureFormat::Rgba8Unorm => f32::from(self.data[index + 3]) / 255.0,
            TextureFormat::Rgba16Float => {
                let bits = u16::from_le_bytes([self.data[index + 6], self.data[index + 7]]);
                half_to_f32(bits)
            }
            TextureFormat::Rgba32Float => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.data[index + 12..index + 16]);
                f32::from_le_bytes(bytes)
            }
        }
    }
}

/// Decode an IEEE 754 binary16 value.
pub fn half_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = u32::from((bits >> 10) & 0x1f);
    let mantissa = u32::from(bits & 0x3ff);
    let bits32 = if exponent == 0 {
        if mantissa == 0 {
            sign
        } else {
            // Subnormal half, normal f32: renormalize the mantissa.
            let shift = mantissa.leading_zeros() - 21;
            let mantissa = (mantissa << (shift + 1)) & 0x3ff;
            sign | (113 - shift) << 23 | mantissa << 13
        }
    } else if exponent == 0x1f {
        sign | 0x7f80_0000 | mantissa << 13
    } else {
        sign | (exponent + 112) << 23 | mantissa << 13
    };
    f32::from_bits(bits32)
}

/// Renderer services the probe system depends on.
///
/// Workspace updates are driven with the probe's own camera passed
/// explicitly, so implementations must not cache camera state between
/// calls.
pub trait RenderBackend {
    fn create_render_target(&mut self, desc: &TextureDesc, name: &str) -> TextureHandle;
    fn create_cubemap(&mut self, desc: &TextureDesc, name: &str) -> TextureHandle;
    fn create_cubemap_array(&mut self, desc: &TextureDesc, num_slices: u32, name: &str)
        -> TextureHandle;
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Promote a texture's backing memory ahead of capture.
    fn make_resident(&mut self, texture: TextureHandle);
    /// Demote a texture that no longer has a workspace rendering into it.
    fn return_to_storage(&mut self, texture: TextureHandle);

    fn add_workspace(&mut self, params: &WorkspaceParams) -> WorkspaceId;
    fn remove_workspace(&mut self, workspace: WorkspaceId);
    /// Render one workspace now, outside the regular frame loop.
    fn update_workspace(&mut self, workspace: WorkspaceId, camera: &Camera);

    fn begin_frame(&mut self);
    fn end_frame(&mut self);
    fn update_scene_graph(&mut self);
    /// Drop per-frame render data accumulated by out-of-band flushes.
    fn clear_frame_data(&mut self);

    /// Swap the scene-wide visibility mask, returning the previous one.
    fn swap_visibility_mask(&mut self, mask: VisibilityMask) -> VisibilityMask;

    /// Full copy, all faces and mips.
    fn copy_texture(&mut self, source: TextureHandle, destination: TextureHandle);
    /// Copy a rendered cube into one cubemap-array slot (6 faces starting
    /// at array layer `slice * 6`).
    fn copy_to_cubemap_slice(&mut self, source: TextureHandle, array: TextureHandle, slice: u32);

    /// Queue an async download of the texture's last (1x1) mip, all slices.
    fn read_back_last_mip(&mut self, texture: TextureHandle) -> ReadbackTicket;
    /// Block until the download finished and map every slice at once.
    /// Only valid when [`Self::can_map_more_than_one_slice`] is true.
    fn wait_readback(&mut self, ticket: ReadbackTicket) -> ReadbackImage;
    /// Block and map a single slice. Always valid.
    fn wait_readback_slice(&mut self, ticket: ReadbackTicket, slice: u32) -> ReadbackImage;
    fn destroy_readback(&mut self, ticket: ReadbackTicket);

    fn can_map_more_than_one_slice(&self) -> bool {
        true
    }
    fn supports_dpm_2d_array(&self) -> bool {
        false
    }
}
