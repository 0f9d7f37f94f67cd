//! Object identity, masks, and render-queue vocabulary.

/// Identifies a camera across frames.
///
/// The cull cache keys on camera identity, not camera value: the same
/// camera re-rendered with a changed pose is a different situation from
/// two distinct cameras that happen to share a pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CameraId(pub u64);

/// Identifies a shadow node participating in a render pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShadowNodeId(pub u32);

/// Render queue a scene object is submitted to.
///
/// Decals and probe proxies are bucketed into dedicated queue ranges so the
/// grid builder can walk them in deterministic order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RenderQueueId(pub u8);

impl RenderQueueId {
    /// First queue carrying decals
    pub const DECAL_FIRST: Self = Self(0);
    /// Last queue carrying decals (inclusive)
    pub const DECAL_LAST: Self = Self(4);
    /// First queue carrying reflection-probe proxies
    pub const PROBE_FIRST: Self = Self(5);
    /// Last queue carrying reflection-probe proxies (inclusive)
    pub const PROBE_LAST: Self = Self(8);

    /// Returns true if this queue holds decals
    #[inline]
    pub const fn is_decal_queue(self) -> bool {
        self.0 >= Self::DECAL_FIRST.0 && self.0 <= Self::DECAL_LAST.0
    }

    /// Returns true if this queue holds probe proxies
    #[inline]
    pub const fn is_probe_queue(self) -> bool {
        self.0 >= Self::PROBE_FIRST.0 && self.0 <= Self::PROBE_LAST.0
    }
}

/// Per-object visibility mask, ANDed against the viewport mask during culling.
pub type VisibilityMask = u32;

/// Per-light grouping mask, forwarded into the packed GPU records.
pub type LightMask = u32;

/// Mask with every group bit set; objects default to visible everywhere.
pub const ALL_VISIBLE: u32 = 0xFFFF_FFFF;

/// Monotonically increasing frame counter.
pub type FrameCount = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ranges_are_disjoint() {
        for raw in 0..=u8::MAX {
            let queue = RenderQueueId(raw);
            assert!(
                !(queue.is_decal_queue() && queue.is_probe_queue()),
                "queue {raw} classified as both decal and probe"
            );
        }
        assert!(RenderQueueId(0).is_decal_queue());
        assert!(RenderQueueId(4).is_decal_queue());
        assert!(RenderQueueId(5).is_probe_queue());
        assert!(RenderQueueId(8).is_probe_queue());
        assert!(!RenderQueueId(9).is_probe_queue());
    }
}
