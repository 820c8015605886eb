//! Seam to the external inference library.
//!
//! The convolutional network itself is a black box behind these traits: the
//! engine loads weight pairs, creates a per-tile extractor, and borrows a
//! few auxiliary operations (bilinear/bicubic resize, edge-replicate
//! padding) that such libraries ship alongside the network runtime.
//!
//! A production host binds its Vulkan inference library here once per
//! process; the GPU instance it creates is intentionally never torn down,
//! as repeated teardown has been observed to stall mobile GPU drivers.

use std::path::Path;

use crate::error::BackendError;
use crate::image::{Plane, PlanarImage};

/// Network/runtime options, passed through to the backend at creation.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub use_vulkan_compute: bool,
    pub use_fp16_packed: bool,
    pub use_fp16_storage: bool,
    pub use_fp16_arithmetic: bool,
    pub use_packing_layout: bool,
    pub use_sgemm_convolution: bool,
    pub use_winograd_convolution: bool,
    pub use_local_pool_allocator: bool,
    pub use_shader_local_memory: bool,
    pub num_threads: u32,
    /// GPU device index; `None` selects the default device.
    pub gpu_device: Option<u32>,
    /// Test-time augmentation. Recognized by backends that ship TTA
    /// pre/post shaders; the default pipeline does not use it.
    pub tta_mode: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            use_vulkan_compute: true,
            use_fp16_packed: true,
            use_fp16_storage: true,
            // Vulkan lacks BF16 math, keep arithmetic in FP32
            use_fp16_arithmetic: false,
            use_packing_layout: true,
            use_sgemm_convolution: true,
            use_winograd_convolution: true,
            use_local_pool_allocator: true,
            use_shader_local_memory: true,
            num_threads: 3,
            gpu_device: Some(0),
            tta_mode: false,
        }
    }
}

/// Creates backend instances and owns the process-wide GPU handle.
pub trait BackendFactory: Send + Sync {
    /// Create the GPU instance if it does not exist yet. Idempotent; the
    /// instance lives for the rest of the process.
    fn ensure_gpu(&self) -> Result<(), BackendError>;

    /// Create a fresh, unloaded network with the given options.
    fn create(&self, options: &BackendOptions) -> Result<Box<dyn InferenceBackend>, BackendError>;
}

/// A loaded (or loadable) network plus the auxiliary image operations the
/// pipeline borrows from the runtime.
pub trait InferenceBackend: Send {
    fn load_param(&mut self, path: &Path) -> Result<(), BackendError>;
    fn load_model(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Declared input blob names, in declaration order.
    fn input_names(&self) -> Vec<String>;
    /// Declared output blob names, in declaration order.
    fn output_names(&self) -> Vec<String>;

    /// One forward pass facade. `light_mode` releases intermediate
    /// activations eagerly and is what the tile loop uses.
    fn create_extractor(&self, light_mode: bool) -> Box<dyn Extractor + '_>;

    /// Bilinear plane resize to an explicit size.
    fn resize_bilinear(&self, src: &Plane, width: u32, height: u32)
        -> Result<Plane, BackendError>;

    /// Exact 2x bicubic interpolation (the runtime's interp layer).
    fn interp_bicubic_2x(&self, src: &Plane) -> Result<Plane, BackendError>;

    /// Border padding by edge replication.
    fn edge_replicate_pad(
        &self,
        src: &PlanarImage,
        top: u32,
        bottom: u32,
        left: u32,
        right: u32,
    ) -> Result<PlanarImage, BackendError>;
}

/// Per-forward-pass binding: one input, one extracted output.
pub trait Extractor {
    fn input(&mut self, name: &str, tile: &PlanarImage) -> Result<(), BackendError>;
    fn extract(&mut self, name: &str) -> Result<PlanarImage, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_engine_configuration() {
        let opts = BackendOptions::default();
        assert!(opts.use_vulkan_compute);
        assert!(opts.use_fp16_packed);
        assert!(opts.use_fp16_storage);
        assert!(!opts.use_fp16_arithmetic);
        assert!(opts.use_sgemm_convolution);
        assert!(opts.use_winograd_convolution);
        assert_eq!(opts.num_threads, 3);
        assert!(!opts.tta_mode);
    }
}
