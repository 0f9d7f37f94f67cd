//! Per-camera cache of culling results.
//!
//! Each camera (per reflection pass, aspect ratio, visibility mask, and
//! shadow node) owns one cache entry holding a list of buffer generations.
//! A camera reused within one frame with a different pose gets the next
//! generation instead of overwriting buffers that may still be referenced by
//! in-flight command lists; cubemap capture renders the same camera six
//! times per frame and relies on this.
//!
//! The generation store is generic over the buffer-pair type so the
//! bookkeeping is testable without a GPU device.

use glint_core::{CameraId, FrameCount, ShadowNodeId, VisibilityMask};
use glint_scene::{Camera, CameraPose};

/// Aspect ratios closer than this match the same cache entry.
pub const ASPECT_RATIO_TOLERANCE: f32 = 1e-6;

/// Entries untouched for more than this many frames are evicted.
pub const STALE_FRAME_EVICTION_AGE: FrameCount = 3;

/// One camera's cached culling state.
pub struct CachedGrid<B> {
    camera: CameraId,
    reflection: bool,
    aspect_ratio: f32,
    visibility_mask: VisibilityMask,
    shadow_node: Option<ShadowNodeId>,
    last_pose: CameraPose,
    last_frame: FrameCount,
    current_generation: usize,
    generations: Vec<B>,
}

impl<B> CachedGrid<B> {
    fn matches(
        &self,
        camera: CameraId,
        reflection: bool,
        aspect_ratio: f32,
        visibility_mask: VisibilityMask,
        shadow_node: Option<ShadowNodeId>,
    ) -> bool {
        self.camera == camera
            && self.reflection == reflection
            && (self.aspect_ratio - aspect_ratio).abs() < ASPECT_RATIO_TOLERANCE
            && self.visibility_mask == visibility_mask
            && self.shadow_node == shadow_node
    }

    /// Buffers of the generation selected by the last checkout.
    #[inline]
    pub fn current(&self) -> &B {
        &self.generations[self.current_generation]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut B {
        &mut self.generations[self.current_generation]
    }

    #[inline]
    pub fn generation_index(&self) -> usize {
        self.current_generation
    }

    #[inline]
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    #[inline]
    pub fn last_frame(&self) -> FrameCount {
        self.last_frame
    }
}

/// Result of a mutating cache lookup.
#[derive(Debug, Clone, Copy)]
pub struct Checkout {
    pub index: usize,
    /// True when the entry's buffers were already filled this frame for
    /// this exact pose and can be reused as-is.
    pub up_to_date: bool,
}

/// Linear-scan cache over all camera entries.
///
/// The entry count is small (a handful of cameras and shadow passes), so a
/// scan beats a hash map here and keeps iteration order deterministic.
pub struct GridCache<B> {
    entries: Vec<CachedGrid<B>>,
}

impl<B: Default> GridCache<B> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Find or create the entry for `camera`, advancing generations on
    /// same-frame pose changes.
    pub fn checkout(
        &mut self,
        camera: &Camera,
        reflection: bool,
        visibility_mask: VisibilityMask,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> Checkout {
        let pose = camera.pose();

        let found = self.entries.iter().position(|entry| {
            entry.matches(camera.id, reflection, camera.aspect, visibility_mask, shadow_node)
        });

        if let Some(index) = found {
            let entry = &mut self.entries[index];
            let mut up_to_date = entry.last_frame == frame;
            entry.last_frame = frame;

            if up_to_date {
                if entry.last_pose != pose {
                    // Same frame, new pose: the current generation's buffers
                    // may already be referenced by a submitted command list,
                    // so move on to the next generation.
                    entry.current_generation += 1;
                    if entry.current_generation >= entry.generations.len() {
                        entry.generations.push(B::default());
                    }
                    up_to_date = false;
                }
            } else {
                entry.current_generation = 0;
            }

            entry.last_pose = pose;
            return Checkout { index, up_to_date };
        }

        self.entries.push(CachedGrid {
            camera: camera.id,
            reflection,
            aspect_ratio: camera.aspect,
            visibility_mask,
            shadow_node,
            last_pose: pose,
            last_frame: frame,
            current_generation: 0,
            generations: vec![B::default()],
        });

        Checkout {
            index: self.entries.len() - 1,
            up_to_date: false,
        }
    }

    /// Non-mutating lookup; the flag is true when the entry is up to date
    /// for this frame and pose.
    pub fn peek(
        &self,
        camera: &Camera,
        reflection: bool,
        visibility_mask: VisibilityMask,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> Option<(&CachedGrid<B>, bool)> {
        self.entries
            .iter()
            .find(|entry| {
                entry.matches(camera.id, reflection, camera.aspect, visibility_mask, shadow_node)
            })
            .map(|entry| {
                let up_to_date = entry.last_frame == frame && entry.last_pose == camera.pose();
                (entry, up_to_date)
            })
    }

    /// True when a collect is required before this camera's buffers may be
    /// consumed.
    pub fn is_dirty(
        &self,
        camera: &Camera,
        reflection: bool,
        visibility_mask: VisibilityMask,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> bool {
        !self
            .peek(camera, reflection, visibility_mask, shadow_node, frame)
            .is_some_and(|(_, up_to_date)| up_to_date)
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &CachedGrid<B> {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut CachedGrid<B> {
        &mut self.entries[index]
    }

    /// Evict entries stale by more than [`STALE_FRAME_EVICTION_AGE`] frames,
    /// handing every buffer generation to `release`.
    pub fn evict_stale(&mut self, frame: FrameCount, mut release: impl FnMut(B)) {
        self.entries.retain_mut(|entry| {
            if entry.last_frame + STALE_FRAME_EVICTION_AGE < frame {
                for generation in entry.generations.drain(..) {
                    release(generation);
                }
                false
            } else {
                true
            }
        });
    }

    /// Drop every entry, handing buffers to `release`. For shutdown.
    pub fn clear(&mut self, mut release: impl FnMut(B)) {
        for mut entry in self.entries.drain(..) {
            for generation in entry.generations.drain(..) {
                release(generation);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: Default> Default for GridCache<B> {
    fn default() -> Self {
        Self::new()
    }
}
