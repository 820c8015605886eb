//! CPU resampling stand-in for the inference backend.
//!
//! The CLI has no Vulkan inference library linked in, so `upscale` runs the
//! full pipeline (catalog resolution, tiling, color conversion, alpha
//! compositing, buffered write-back) with plain interpolation in place of
//! the network forward pass. A production host binds its real backend
//! behind the same traits.

use std::path::Path;

use tracing::debug;
use upres_core::backend::{BackendFactory, BackendOptions, Extractor, InferenceBackend};
use upres_core::error::BackendError;
use upres_core::image::{Plane, PlanarImage};

pub struct ResampleFactory;

impl BackendFactory for ResampleFactory {
    fn ensure_gpu(&self) -> Result<(), BackendError> {
        // Nothing to create for the CPU stand-in.
        Ok(())
    }

    fn create(&self, options: &BackendOptions) -> Result<Box<dyn InferenceBackend>, BackendError> {
        debug!(num_threads = options.num_threads, "creating resample backend");
        Ok(Box::new(ResampleBackend { scale: 2 }))
    }
}

/// Upscale factor implied by a weight-file stem, e.g. `x4`, `up3x-…`,
/// `noise1_scale2.0x_model`. Denoise-only models (`noise{n}_model`) are 1x.
fn scale_from_weights(path: &Path) -> u32 {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if stem.contains("scale2.0x") {
        return 2;
    }
    if let Some(rest) = stem.strip_prefix("up") {
        if let Some(n) = rest.chars().next().and_then(|c| c.to_digit(10)) {
            return n;
        }
    }
    if let Some(rest) = stem.strip_prefix('x') {
        if let Some(n) = rest.chars().next().and_then(|c| c.to_digit(10)) {
            return n;
        }
    }
    1
}

pub struct ResampleBackend {
    scale: u32,
}

impl InferenceBackend for ResampleBackend {
    fn load_param(&mut self, path: &Path) -> Result<(), BackendError> {
        if !path.is_file() {
            return Err(BackendError::Load {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }
        self.scale = scale_from_weights(path);
        debug!(path = %path.display(), scale = self.scale, "resample backend loaded params");
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> Result<(), BackendError> {
        if !path.is_file() {
            return Err(BackendError::Load {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }
        Ok(())
    }

    fn input_names(&self) -> Vec<String> {
        vec!["data".to_string()]
    }

    fn output_names(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn create_extractor(&self, _light_mode: bool) -> Box<dyn Extractor + '_> {
        Box::new(ResampleExtractor {
            scale: self.scale,
            tile: None,
        })
    }

    fn resize_bilinear(&self, src: &Plane, width: u32, height: u32) -> Result<Plane, BackendError> {
        Ok(resize_plane_bilinear(src, width as usize, height as usize))
    }

    fn interp_bicubic_2x(&self, src: &Plane) -> Result<Plane, BackendError> {
        // The stand-in approximates the bicubic interp layer bilinearly.
        Ok(resize_plane_bilinear(src, src.width() * 2, src.height() * 2))
    }

    fn edge_replicate_pad(
        &self,
        src: &PlanarImage,
        top: u32,
        bottom: u32,
        left: u32,
        right: u32,
    ) -> Result<PlanarImage, BackendError> {
        Ok(replicate_pad(src, top as usize, bottom as usize, left as usize, right as usize))
    }
}

struct ResampleExtractor {
    scale: u32,
    tile: Option<PlanarImage>,
}

impl Extractor for ResampleExtractor {
    fn input(&mut self, _name: &str, tile: &PlanarImage) -> Result<(), BackendError> {
        self.tile = Some(tile.clone());
        Ok(())
    }

    fn extract(&mut self, _name: &str) -> Result<PlanarImage, BackendError> {
        let tile = self
            .tile
            .take()
            .ok_or_else(|| BackendError::Inference("no input bound".into()))?;
        Ok(upscale_planar_bilinear(&tile, self.scale as usize))
    }
}

fn replicate_pad(
    src: &PlanarImage,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> PlanarImage {
    let w = src.width();
    let h = src.height();
    let out_w = w + left + right;
    let out_h = h + top + bottom;
    let mut out = PlanarImage::zeros(src.channels(), out_h, out_w);

    for c in 0..src.channels() {
        for y in 0..out_h {
            let sy = y.saturating_sub(top).min(h - 1);
            let src_row = src.row(c, sy);
            let dst_row = out.row_mut(c, y);
            for (x, dst) in dst_row.iter_mut().enumerate() {
                let sx = x.saturating_sub(left).min(w - 1);
                *dst = src_row[sx];
            }
        }
    }
    out
}

fn resize_plane_bilinear(src: &Plane, out_w: usize, out_h: usize) -> Plane {
    let w = src.width();
    let h = src.height();
    let mut out = Plane::zeros(out_h, out_w);

    for y in 0..out_h {
        let fy = (y as f32 + 0.5) * h as f32 / out_h as f32 - 0.5;
        let y0 = fy.floor().max(0.0) as usize;
        let y1 = (y0 + 1).min(h - 1);
        let wy = (fy - y0 as f32).clamp(0.0, 1.0);
        let row0 = src.row(y0);
        let row1 = src.row(y1);
        let dst = out.row_mut(y);
        for (x, d) in dst.iter_mut().enumerate() {
            let fx = (x as f32 + 0.5) * w as f32 / out_w as f32 - 0.5;
            let x0 = fx.floor().max(0.0) as usize;
            let x1 = (x0 + 1).min(w - 1);
            let wx = (fx - x0 as f32).clamp(0.0, 1.0);
            let a = row0[x0] * (1.0 - wx) + row0[x1] * wx;
            let b = row1[x0] * (1.0 - wx) + row1[x1] * wx;
            *d = a * (1.0 - wy) + b * wy;
        }
    }
    out
}

fn upscale_planar_bilinear(src: &PlanarImage, scale: usize) -> PlanarImage {
    let out_w = src.width() * scale;
    let out_h = src.height() * scale;
    let mut out = PlanarImage::zeros(src.channels(), out_h, out_w);
    for c in 0..src.channels() {
        let plane = plane_from_channel(src, c);
        let resized = resize_plane_bilinear(&plane, out_w, out_h);
        out.channel_mut(c).copy_from_slice(resized.as_slice());
    }
    out
}

fn plane_from_channel(src: &PlanarImage, c: usize) -> Plane {
    let mut plane = Plane::zeros(src.height(), src.width());
    plane.as_slice_mut().copy_from_slice(src.channel(c));
    plane
}
