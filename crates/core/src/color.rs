//! Color pipeline: packed RGBA to normalized planar BGR on the way in,
//! planar BGR back to packed RGBA on the way out.
//!
//! Preprocessing makes a single pass over the input, producing the three
//! normalized BGR planes, the raw alpha plane and a color census used for
//! grayscale detection. Write-back runs per tile on worker threads and
//! writes straight into the caller-owned output image.

use tracing::debug;

use crate::image::{OutputImage, PackedImage, Plane, PlanarImage};

/// Byte-unit channel difference above which a pixel counts as colored.
const COLOR_DIFF_THRESHOLD: f32 = 5.0;

/// Result of input preprocessing.
pub struct Preprocessed {
    /// Three planes, BGR order, normalized to [0,1].
    pub planar: PlanarImage,
    /// Raw alpha plane in [0,255].
    pub alpha: Plane,
    /// Whether the image should be collapsed to pure grayscale at output.
    pub grayscale: bool,
}

/// Convert packed RGBA to normalized planar BGR, reading the alpha plane
/// and counting colored pixels in the same pass.
///
/// The image is flagged grayscale when at most 0.5% of its pixels differ
/// across channels by more than [`COLOR_DIFF_THRESHOLD`] (noise tolerance),
/// unless the check is disabled.
pub fn preprocess(input: &PackedImage<'_>, disable_grayscale_check: bool) -> Preprocessed {
    let w = input.width() as usize;
    let h = input.height() as usize;
    let norm = 1.0 / 255.0;

    let mut planar = PlanarImage::zeros(3, h, w);
    let mut alpha = Plane::zeros(h, w);

    let mut color_pixel_count = 0usize;
    let color_threshold_count = w * h / 200; // 0.5%

    let hw = h * w;
    let planes = planar.as_slice_mut();
    for y in 0..h {
        let src = input.row(y as u32);
        let a_row = alpha.row_mut(y);
        let row = y * w;
        for (x, px) in src.chunks_exact(4).enumerate() {
            let r = px[0] as f32;
            let g = px[1] as f32;
            let b = px[2] as f32;

            if (r - g).abs() > COLOR_DIFF_THRESHOLD || (r - b).abs() > COLOR_DIFF_THRESHOLD {
                color_pixel_count += 1;
            }

            a_row[x] = px[3] as f32;
            planes[row + x] = b * norm; // B plane at offset 0
            planes[hw + row + x] = g * norm;
            planes[2 * hw + row + x] = r * norm;
        }
    }

    let grayscale = color_pixel_count <= color_threshold_count && !disable_grayscale_check;
    if grayscale {
        debug!(color_pixel_count, "grayscale image detected, forcing pure grayscale output");
    }

    Preprocessed {
        planar,
        alpha,
        grayscale,
    }
}

/// Raw view over the caller-owned output image, shared across write-back
/// workers. Each worker writes a disjoint pixel rectangle, which is what
/// makes the aliasing sound; the executor guarantees disjointness by
/// construction of the tile grid.
#[derive(Clone, Copy)]
pub(crate) struct SharedOutput {
    ptr: *mut u8,
    stride: usize,
    pub target_w: usize,
    pub target_h: usize,
}

unsafe impl Send for SharedOutput {}
unsafe impl Sync for SharedOutput {}

impl SharedOutput {
    pub fn new(out: &mut OutputImage<'_>) -> Self {
        Self {
            ptr: out.as_mut_ptr(),
            stride: out.stride(),
            target_w: out.width() as usize,
            target_h: out.height() as usize,
        }
    }

    /// # Safety
    ///
    /// The `pixels`-wide span at `(x, y)` must not be written by any other
    /// thread for the lifetime of the returned slice.
    unsafe fn pixel_span(&self, y: usize, x: usize, pixels: usize) -> &mut [u8] {
        let offset = y * self.stride + x * 4;
        std::slice::from_raw_parts_mut(self.ptr.add(offset), pixels * 4)
    }
}

/// Placement of one tile's output.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TilePlacement {
    /// Tile origin in source coordinates.
    pub x: usize,
    pub y: usize,
    /// Valid tile extent in source coordinates.
    pub w: usize,
    pub h: usize,
    pub scale: usize,
    pub prepadding: usize,
    pub grayscale: bool,
}

/// Write one model output tile into the packed output image.
///
/// The tile's scaled pre-padding margin is discarded: rows are read at an
/// offset of `prepadding * scale` in both axes unless the model already
/// returned a cropped tile smaller than the fully padded extent, in which
/// case the offset is zero. Values are scaled by 255 and quantized by
/// truncation after clamping. For grayscale images the three channels are
/// collapsed to their arithmetic mean. The alpha byte comes from the
/// pre-scaled alpha plane at the destination pixel, clamped to [0,255].
pub(crate) fn write_tile(
    out: &SharedOutput,
    tile: &PlanarImage,
    alpha: Option<&Plane>,
    p: &TilePlacement,
) {
    let out_x = p.x * p.scale;
    let out_y = p.y * p.scale;
    let out_w_tile = p.w * p.scale;
    let out_h_tile = p.h * p.scale;
    let out_pad = p.prepadding * p.scale;

    let mut src_offset_x = out_pad;
    let mut src_offset_y = out_pad;
    if tile.width() < out_w_tile + 2 * out_pad || tile.height() < out_h_tile + 2 * out_pad {
        src_offset_x = 0;
        src_offset_y = 0;
    }

    let tile_w = tile.width();
    let tile_b = tile.channel(0);
    let tile_g = tile.channel(1);
    let tile_r = tile.channel(2);

    for i in 0..out_h_tile {
        let dst_y = out_y + i;
        if dst_y >= out.target_h {
            break;
        }
        let src_y = src_offset_y + i;
        if src_y >= tile.height() {
            break;
        }

        let mut copy_w = out_w_tile;
        if out_x + copy_w > out.target_w {
            copy_w = out.target_w - out_x;
        }
        if src_offset_x + copy_w > tile_w {
            copy_w = tile_w - src_offset_x;
        }

        let src_row = src_y * tile_w + src_offset_x;
        let ptr_b = &tile_b[src_row..src_row + copy_w];
        let ptr_g = &tile_g[src_row..src_row + copy_w];
        let ptr_r = &tile_r[src_row..src_row + copy_w];
        let ptr_a = alpha.map(|a| &a.row(dst_y)[out_x..out_x + copy_w]);

        // Disjointness: this tile owns output columns [out_x, out_x+copy_w)
        // of row dst_y; no other tile maps to them.
        let dst = unsafe { out.pixel_span(dst_y, out_x, copy_w) };

        for j in 0..copy_w {
            let mut r = ptr_r[j] * 255.0;
            let mut g = ptr_g[j] * 255.0;
            let mut b = ptr_b[j] * 255.0;

            if p.grayscale {
                let gray = (r + g + b) / 3.0;
                r = gray;
                g = gray;
                b = gray;
            }

            let px = &mut dst[j * 4..j * 4 + 4];
            px[0] = r.clamp(0.0, 255.0) as u8;
            px[1] = g.clamp(0.0, 255.0) as u8;
            px[2] = b.clamp(0.0, 255.0) as u8;
            px[3] = match ptr_a {
                Some(a) => a[j].clamp(0.0, 255.0) as u8,
                None => 255,
            };
        }
    }
}
