//! Alpha plane upscaling.
//!
//! The alpha channel never goes through the model: it is scaled straight
//! from the original input so transparency survives unchanged. The
//! backend's bicubic interp layer handles the exact 2x case; every other
//! factor falls back to bilinear resize.

use crate::backend::InferenceBackend;
use crate::error::BackendError;
use crate::image::Plane;

/// Scale the input alpha plane to the target size, values staying in
/// [0,255].
pub fn scale_alpha(
    backend: &dyn InferenceBackend,
    alpha: &Plane,
    scale: u32,
    target_w: u32,
    target_h: u32,
) -> Result<Plane, BackendError> {
    if scale == 2 {
        backend.interp_bicubic_2x(alpha)
    } else {
        backend.resize_bilinear(alpha, target_w, target_h)
    }
}
