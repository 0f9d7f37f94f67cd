//! Error types for the probe system.

use thiserror::Error;

/// Errors raised by probe setup and lifecycle operations.
///
/// Per-frame paths (scene graph updates, rendering, blending) never fail;
/// they handle degraded states with warnings instead, so only the setup
/// surface returns these.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// A probe id that this manager never issued, or one it already freed
    #[error("probe {0} does not belong to this manager or was already destroyed")]
    ForeignProbe(u64),

    /// Pool operation attempted on a manually managed manager
    #[error("operation requires automatic slot pooling, this manager uses manual slots")]
    ManualMode,

    /// `init_workspace` on a manual probe that never got texture params
    #[error("texture parameters were never set; call set_texture_params first")]
    TextureParamsNotSet,

    /// GPU allocation failed
    #[error(transparent)]
    Gpu(#[from] glint_gpu::GpuError),
}

/// Result type alias for probe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
