//! Per-request orchestration: preprocess, tile submission, buffered
//! write-back, early lock release.
//!
//! GPU inference and CPU byte-packing touch disjoint resources, so the tile
//! loop overlaps them: every finished tile is handed to a worker task while
//! the next tile runs on the GPU. The bounded FIFO caps the number of tile
//! outputs alive at once; the producer blocks on the oldest task when it is
//! full. Once every tile has been submitted, the session lock is dropped so
//! the next request can start its GPU phase while this request finishes its
//! CPU tail.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::alpha::scale_alpha;
use crate::color::{self, SharedOutput, TilePlacement};
use crate::error::{BackendError, ProcessError};
use crate::image::{OutputImage, PackedImage, PixelFormat};
use crate::session::{SessionAtomics, SessionState};
use crate::tiler::{extract_padded_tile, TileGrid};

/// Maximum in-flight write-back tasks. Back-pressure, not throughput: at
/// most this many tile outputs are held in memory while the GPU runs ahead.
pub const WRITEBACK_QUEUE_DEPTH: usize = 32;

/// The thermal sleep is skipped for the last few tiles of a request.
const SLEEP_FREE_TAIL_TILES: isize = 5;

/// Run one request. `state` is the held session lock; it is released as
/// soon as the last tile has been submitted to the GPU, while write-back
/// may still be in flight. Returns only after all write-backs completed.
pub(crate) fn run(
    state: MutexGuard<'_, SessionState>,
    atomics: &Arc<SessionAtomics>,
    input: &PackedImage<'_>,
    out: &mut OutputImage<'_>,
) -> Result<(), ProcessError> {
    let shared = SharedOutput::new(out);
    let mut queue = WriteBackQueue::default();

    match submit_tiles(&state, atomics, input, shared, &mut queue) {
        Ok(()) => {
            // All GPU work is submitted; release the lock so the next image
            // can start its GPU phase while we drain the CPU tail.
            debug!("gpu work finished, releasing session lock early");
            drop(state);
            queue.drain();
            atomics.progress.store(100, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            // No task may touch the caller's buffer after we return.
            queue.drain();
            Err(err)
        }
    }
}

/// Bounded FIFO of in-flight write-back tasks. Draining on drop keeps
/// workers from outliving the caller's output buffer on every exit path.
#[derive(Default)]
struct WriteBackQueue {
    fifo: VecDeque<Receiver<()>>,
}

impl WriteBackQueue {
    /// Block on the oldest task while the queue is at capacity.
    fn wait_for_capacity(&mut self) {
        while self.fifo.len() >= WRITEBACK_QUEUE_DEPTH {
            if let Some(rx) = self.fifo.pop_front() {
                let _ = rx.recv();
            }
        }
    }

    fn push(&mut self, rx: Receiver<()>) {
        self.fifo.push_back(rx);
    }

    fn drain(&mut self) {
        while let Some(rx) = self.fifo.pop_front() {
            let _ = rx.recv();
        }
    }
}

impl Drop for WriteBackQueue {
    fn drop(&mut self) {
        self.drain();
    }
}

fn submit_tiles(
    state: &SessionState,
    atomics: &Arc<SessionAtomics>,
    input: &PackedImage<'_>,
    shared: SharedOutput,
    queue: &mut WriteBackQueue,
) -> Result<(), ProcessError> {
    let model = state.model.as_ref().ok_or(ProcessError::NotInitialized)?;
    if input.format() != PixelFormat::Rgba8888 {
        return Err(ProcessError::UnsupportedPixelFormat);
    }

    let w = input.width() as usize;
    let h = input.height() as usize;
    if w == 0 || h == 0 {
        return Err(ProcessError::InvalidBuffer("empty input image".into()));
    }
    let scale = model.scale as usize;
    let target_w = w * scale;
    let target_h = h * scale;
    if shared.target_w != target_w || shared.target_h != target_h {
        return Err(ProcessError::InvalidBuffer(format!(
            "output is {}x{}, expected {}x{}",
            shared.target_w, shared.target_h, target_w, target_h
        )));
    }

    debug!(
        width = w,
        height = h,
        target_w,
        target_h,
        family = %model.family,
        tile_size = model.tile_size,
        "processing image"
    );

    let input_name = model
        .backend
        .input_names()
        .first()
        .cloned()
        .ok_or_else(|| BackendError::Inference("model has no inputs".into()))?;
    let output_name = model
        .backend
        .output_names()
        .last()
        .cloned()
        .ok_or_else(|| BackendError::Inference("model has no outputs".into()))?;

    let pre = color::preprocess(input, model.disable_grayscale_check);
    let grayscale = pre.grayscale;

    // Full alpha map up front so tiles can composite on the fly. Scaled
    // from the original input, never from the model path.
    let alpha = Arc::new(scale_alpha(
        model.backend.as_ref(),
        &pre.alpha,
        model.scale,
        target_w as u32,
        target_h as u32,
    )?);

    let prepadding = model.prepadding as usize;
    let p = model.prepadding;
    let padded = model.backend.edge_replicate_pad(&pre.planar, p, p, p, p)?;

    let grid = TileGrid::new(w, h, model.tile_size as usize);
    let total = grid.len();
    let tile_sleep_ms = model.tile_sleep_ms;

    for tile in grid.iter() {
        let in_tile = extract_padded_tile(&padded, &tile, prepadding);

        // GPU work: one forward pass, extractor in light mode.
        let out_tile = {
            let mut extractor = model.backend.create_extractor(true);
            extractor.input(&input_name, &in_tile)?;
            extractor.extract(&output_name)?
        };

        if out_tile.is_empty() || out_tile.channels() < 3 {
            warn!(
                xi = tile.xi,
                yi = tile.yi,
                channels = out_tile.channels(),
                "inference produced an invalid tile, skipping"
            );
            continue;
        }

        // Publish progress right after GPU inference so the host sees
        // activity before write-back lands.
        let interim = ((tile.index * 99) / total + 1) as i32;
        atomics.progress.fetch_max(interim, Ordering::Relaxed);

        // Wait for the oldest task when the pipeline is full.
        queue.wait_for_capacity();

        let placement = TilePlacement {
            x: tile.x,
            y: tile.y,
            w: tile.w,
            h: tile.h,
            scale,
            prepadding,
            grayscale,
        };
        let final_progress = (((tile.index + 1) * 99) / total) as i32;
        let task_alpha = Arc::clone(&alpha);
        let task_atomics = Arc::clone(atomics);
        let (tx, rx) = mpsc::channel();

        rayon::spawn(move || {
            color::write_tile(&shared, &out_tile, Some(task_alpha.as_ref()), &placement);
            // Tasks complete out of order; fetch_max keeps progress
            // non-decreasing.
            task_atomics
                .progress
                .fetch_max(final_progress, Ordering::Relaxed);
            let _ = tx.send(());
        });
        queue.push(rx);

        if atomics.should_abort.load(Ordering::Relaxed) {
            debug!("process aborted by signal");
            return Err(ProcessError::Aborted);
        }

        let near_end = tile.index as isize > total as isize - SLEEP_FREE_TAIL_TILES;
        if tile_sleep_ms > 0 && !near_end {
            std::thread::sleep(Duration::from_millis(tile_sleep_ms));
        }
    }

    Ok(())
}
