//! Tile grid computation and padded tile extraction.
//!
//! The image is split into `tile_size`-sized cells in row-major order. Each
//! tile's network input is read out of a globally edge-replicated copy of
//! the image, so tile extraction itself is plain row copies with no border
//! handling.

use crate::image::PlanarImage;

/// One cell of the grid, in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row-major index, `xi + yi * xtiles`.
    pub index: usize,
    pub xi: usize,
    pub yi: usize,
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

/// Row-major tile grid over a `width x height` image.
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    width: usize,
    height: usize,
    tile_size: usize,
    xtiles: usize,
    ytiles: usize,
}

impl TileGrid {
    pub fn new(width: usize, height: usize, tile_size: usize) -> Self {
        let tile_size = tile_size.max(1);
        Self {
            width,
            height,
            tile_size,
            xtiles: width.div_ceil(tile_size),
            ytiles: height.div_ceil(tile_size),
        }
    }

    pub fn xtiles(&self) -> usize {
        self.xtiles
    }

    pub fn ytiles(&self) -> usize {
        self.ytiles
    }

    pub fn len(&self) -> usize {
        self.xtiles * self.ytiles
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Tile> + '_ {
        let grid = *self;
        (0..grid.ytiles).flat_map(move |yi| {
            (0..grid.xtiles).map(move |xi| {
                let x = xi * grid.tile_size;
                let y = yi * grid.tile_size;
                Tile {
                    index: xi + yi * grid.xtiles,
                    xi,
                    yi,
                    x,
                    y,
                    w: grid.tile_size.min(grid.width - x),
                    h: grid.tile_size.min(grid.height - y),
                }
            })
        })
    }
}

/// Extract the padded input for `tile` from the globally padded image.
///
/// `padded` is the `(W+2p) x (H+2p)` edge-replicated image; the extraction
/// starts at the tile origin in padded coordinates and spans
/// `(w+2p) x (h+2p)`, copied row by row per plane.
pub fn extract_padded_tile(padded: &PlanarImage, tile: &Tile, prepadding: usize) -> PlanarImage {
    let in_w = tile.w + 2 * prepadding;
    let in_h = tile.h + 2 * prepadding;
    let channels = padded.channels();
    let mut out = PlanarImage::zeros(channels, in_h, in_w);

    for c in 0..channels {
        for i in 0..in_h {
            let src = &padded.row(c, tile.y + i)[tile.x..tile.x + in_w];
            out.row_mut(c, i).copy_from_slice(src);
        }
    }

    out
}
