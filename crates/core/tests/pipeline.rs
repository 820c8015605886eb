//! End-to-end pipeline tests against a deterministic mock backend.
//!
//! The mock upscales tiles by nearest-neighbor replication, which makes the
//! tiled result bit-comparable to an untiled run of the same image: any
//! seam or off-by-one in padding, extraction or write-back shows up as an
//! exact mismatch.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use upres_core::backend::{BackendFactory, BackendOptions, Extractor, InferenceBackend};
use upres_core::error::BackendError;
use upres_core::image::{Plane, PlanarImage};
use upres_core::{Engine, InitOptions, ModelFamily, OutputImage, PackedImage, ProcessError};

#[derive(Clone, Default)]
struct MockConfig {
    /// Artificial per-tile inference latency.
    extract_delay: Option<Duration>,
    /// Tile indices (in extraction order) that produce an empty output.
    fail_tiles: HashSet<usize>,
    /// When set, the mock returns the already-cropped valid region, like
    /// models that discard their own padding margin.
    crop_margin: Option<usize>,
    /// Timestamp sink recording the start of every forward pass.
    extract_log: Option<Arc<Mutex<Vec<Instant>>>>,
}

struct MockFactory {
    config: MockConfig,
}

impl MockFactory {
    fn new() -> Self {
        Self {
            config: MockConfig::default(),
        }
    }

    fn with_config(config: MockConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for MockFactory {
    fn ensure_gpu(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn create(&self, _options: &BackendOptions) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(MockBackend {
            scale: 2,
            config: self.config.clone(),
            tiles_seen: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

struct MockBackend {
    scale: usize,
    config: MockConfig,
    tiles_seen: Arc<AtomicUsize>,
}

impl InferenceBackend for MockBackend {
    fn load_param(&mut self, path: &Path) -> Result<(), BackendError> {
        // model zoo naming carries the factor, e.g. up2x-no-denoise
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if let Some(rest) = stem.strip_prefix("up") {
            if let Some(n) = rest.chars().next().and_then(|c| c.to_digit(10)) {
                self.scale = n as usize;
            }
        }
        Ok(())
    }

    fn load_model(&mut self, _path: &Path) -> Result<(), BackendError> {
        Ok(())
    }

    fn input_names(&self) -> Vec<String> {
        vec!["data".to_string()]
    }

    fn output_names(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn create_extractor(&self, _light_mode: bool) -> Box<dyn Extractor + '_> {
        Box::new(MockExtractor {
            backend: self,
            tile: None,
        })
    }

    fn resize_bilinear(&self, src: &Plane, width: u32, height: u32) -> Result<Plane, BackendError> {
        Ok(resize_nearest(src, width as usize, height as usize))
    }

    fn interp_bicubic_2x(&self, src: &Plane) -> Result<Plane, BackendError> {
        Ok(resize_nearest(src, src.width() * 2, src.height() * 2))
    }

    fn edge_replicate_pad(
        &self,
        src: &PlanarImage,
        top: u32,
        bottom: u32,
        left: u32,
        right: u32,
    ) -> Result<PlanarImage, BackendError> {
        let (top, bottom, left, right) =
            (top as usize, bottom as usize, left as usize, right as usize);
        let w = src.width();
        let h = src.height();
        let mut out = PlanarImage::zeros(src.channels(), h + top + bottom, w + left + right);
        for c in 0..src.channels() {
            for y in 0..out.height() {
                let sy = y.saturating_sub(top).min(h - 1);
                for x in 0..out.width() {
                    let sx = x.saturating_sub(left).min(w - 1);
                    out.row_mut(c, y)[x] = src.row(c, sy)[sx];
                }
            }
        }
        Ok(out)
    }
}

struct MockExtractor<'a> {
    backend: &'a MockBackend,
    tile: Option<PlanarImage>,
}

impl Extractor for MockExtractor<'_> {
    fn input(&mut self, _name: &str, tile: &PlanarImage) -> Result<(), BackendError> {
        self.tile = Some(tile.clone());
        Ok(())
    }

    fn extract(&mut self, _name: &str) -> Result<PlanarImage, BackendError> {
        if let Some(log) = &self.backend.config.extract_log {
            log.lock().unwrap().push(Instant::now());
        }
        if let Some(delay) = self.backend.config.extract_delay {
            std::thread::sleep(delay);
        }
        let index = self.backend.tiles_seen.fetch_add(1, Ordering::Relaxed);
        if self.backend.config.fail_tiles.contains(&index) {
            return Ok(PlanarImage::zeros(3, 0, 0));
        }

        let tile = self
            .tile
            .take()
            .ok_or_else(|| BackendError::Inference("no input bound".into()))?;
        let scale = self.backend.scale;
        let mut up = upscale_nearest(&tile, scale);

        if let Some(margin) = self.backend.config.crop_margin {
            up = crop_planar(&up, margin * scale);
        }
        Ok(up)
    }
}

fn upscale_nearest(src: &PlanarImage, scale: usize) -> PlanarImage {
    let out_w = src.width() * scale;
    let out_h = src.height() * scale;
    let mut out = PlanarImage::zeros(src.channels(), out_h, out_w);
    for c in 0..src.channels() {
        for y in 0..out_h {
            let src_row = src.row(c, y / scale);
            let dst_row = out.row_mut(c, y);
            for (x, dst) in dst_row.iter_mut().enumerate() {
                *dst = src_row[x / scale];
            }
        }
    }
    out
}

fn crop_planar(src: &PlanarImage, margin: usize) -> PlanarImage {
    let out_w = src.width() - 2 * margin;
    let out_h = src.height() - 2 * margin;
    let mut out = PlanarImage::zeros(src.channels(), out_h, out_w);
    for c in 0..src.channels() {
        for y in 0..out_h {
            out.row_mut(c, y)
                .copy_from_slice(&src.row(c, y + margin)[margin..margin + out_w]);
        }
    }
    out
}

fn resize_nearest(src: &Plane, out_w: usize, out_h: usize) -> Plane {
    let mut out = Plane::zeros(out_h, out_w);
    for y in 0..out_h {
        let sy = y * src.height() / out_h;
        for x in 0..out_w {
            let sx = x * src.width() / out_w;
            out.row_mut(y)[x] = src.row(sy)[sx];
        }
    }
    out
}

/// Weight fixtures for real-cugan 2x.
fn model_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("up2x-no-denoise.param"), b"p").unwrap();
    fs::write(dir.path().join("up2x-no-denoise.bin"), b"b").unwrap();
    dir
}

fn init_engine(engine: &Engine, dir: &TempDir) {
    engine
        .init(InitOptions::new(ModelFamily::RealCugan, dir.path(), 0, 2))
        .unwrap();
}

/// Deterministic colorful test image.
fn gradient_rgba(w: u32, h: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity((w * h * 4) as usize);
    for y in 0..h {
        for x in 0..w {
            buf.push((x * 255 / w.max(1)) as u8);
            buf.push((y * 255 / h.max(1)) as u8);
            buf.push(((x + y) * 127 / (w + h).max(1)) as u8);
            buf.push(255);
        }
    }
    buf
}

fn process_to_vec(engine: &Engine, input_buf: &[u8], w: u32, h: u32, id: i32) -> Vec<u8> {
    let input = PackedImage::from_rgba8(input_buf, w, h).unwrap();
    let mut out_buf = vec![0u8; (w * 2 * h * 2 * 4) as usize];
    let mut out = OutputImage::new(&mut out_buf, w * 2, h * 2, (w * 2 * 4) as usize).unwrap();
    engine.process(&input, &mut out, id).unwrap();
    out_buf
}

#[test]
fn output_has_exact_scaled_geometry_and_opaque_alpha() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let (w, h) = (8u32, 8u32);
    let out = process_to_vec(&engine, &gradient_rgba(w, h), w, h, 1);

    assert_eq!(out.len(), (16 * 16 * 4) as usize);
    // every pixel written, alpha uniformly opaque
    for px in out.chunks_exact(4) {
        assert_eq!(px[3], 255);
    }
    // red grows left to right in every output row (gradient preserved)
    for y in 0..16usize {
        let row = &out[y * 16 * 4..(y + 1) * 16 * 4];
        assert!(row[0] <= row[15 * 4]);
    }
}

#[test]
fn tiled_output_is_seamless() {
    // nearest-neighbor model: a tiled run must be bit-identical to an
    // untiled run, otherwise padding or placement is off
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let (w, h) = (200u32, 200u32);
    let input = gradient_rgba(w, h);

    engine.update_performance_config(0, 64);
    let tiled = process_to_vec(&engine, &input, w, h, 1);

    engine.update_performance_config(0, 512);
    let untiled = process_to_vec(&engine, &input, w, h, 2);

    assert_eq!(tiled, untiled);
}

#[test]
fn cropped_model_output_is_placed_identically() {
    // models that return the valid region without their padding margin go
    // through the zero-offset read path and must land on the same pixels
    let dir = model_dir();

    let engine_full = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine_full, &dir);
    engine_full.update_performance_config(0, 32);
    let engine_cropped = Engine::new(Box::new(MockFactory::with_config(MockConfig {
        crop_margin: Some(18), // real-cugan 2x prepadding
        ..Default::default()
    })));
    init_engine(&engine_cropped, &dir);
    engine_cropped.update_performance_config(0, 32);

    let (w, h) = (100u32, 60u32);
    let input = gradient_rgba(w, h);
    let full = process_to_vec(&engine_full, &input, w, h, 1);
    let cropped = process_to_vec(&engine_cropped, &input, w, h, 2);
    assert_eq!(full, cropped);
}

#[test]
fn output_is_deterministic_across_runs() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 32);

    let (w, h) = (96u32, 96u32);
    let input = gradient_rgba(w, h);
    let first = process_to_vec(&engine, &input, w, h, 1);
    let second = process_to_vec(&engine, &input, w, h, 2);
    assert_eq!(first, second);
}

#[test]
fn near_gray_input_yields_exactly_gray_output() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    // channel deltas within the census tolerance, but not identical
    let (w, h) = (100u32, 100u32);
    let mut input = Vec::with_capacity((w * h * 4) as usize);
    let mut seed = 0x2545_f491u32;
    for _ in 0..(w * h) {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let v = (seed >> 24) as u8;
        let v = v.clamp(5, 250);
        input.extend_from_slice(&[v, v.wrapping_add(3), v.wrapping_sub(2), 255]);
    }

    let out = process_to_vec(&engine, &input, w, h, 1);
    for px in out.chunks_exact(4) {
        assert_eq!(px[0], px[1]);
        assert_eq!(px[0], px[2]);
    }
}

#[test]
fn fully_transparent_input_stays_transparent() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let (w, h) = (16u32, 16u32);
    let mut input = gradient_rgba(w, h);
    for px in input.chunks_exact_mut(4) {
        px[3] = 0;
    }
    let out = process_to_vec(&engine, &input, w, h, 1);
    for px in out.chunks_exact(4) {
        assert_eq!(px[3], 0);
    }
}

#[test]
fn invalid_tiles_are_skipped_without_failing_the_request() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::with_config(MockConfig {
        fail_tiles: HashSet::from([0]),
        ..Default::default()
    })));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 32);

    let (w, h) = (64u32, 64u32);
    let mut input = gradient_rgba(w, h);
    // make the image bright everywhere so written pixels are never zero
    for px in input.chunks_exact_mut(4) {
        px[0] = px[0].max(32);
        px[1] = px[1].max(32);
        px[2] = px[2].max(32);
    }

    let out = process_to_vec(&engine, &input, w, h, 1);
    // the first tile's rectangle (64x64 output pixels) was left untouched
    assert_eq!(&out[0..4], &[0, 0, 0, 0]);
    // a pixel from the second tile column was written
    let px = &out[(70 * 4) as usize..(70 * 4 + 4) as usize];
    assert_ne!(&px[0..3], &[0, 0, 0]);
    assert_eq!(px[3], 255);
}

#[test]
fn progress_is_monotone_and_ends_at_one_hundred() {
    let dir = model_dir();
    let engine = Arc::new(Engine::new(Box::new(MockFactory::with_config(
        MockConfig {
            extract_delay: Some(Duration::from_millis(1)),
            ..Default::default()
        },
    ))));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 32);

    let poller = {
        let engine = Arc::clone(&engine);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let mut samples = Vec::new();
            loop {
                samples.push(engine.progress());
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            samples
        });
        (stop_tx, handle)
    };

    let (w, h) = (128u32, 128u32);
    let _ = process_to_vec(&engine, &gradient_rgba(w, h), w, h, 9);

    poller.0.send(()).unwrap();
    let samples = poller.1.join().unwrap();

    assert_eq!(engine.progress(), 100);
    assert_eq!(engine.packed_progress(), (9i64 << 32) | 100);
    for pair in samples.windows(2) {
        assert!(pair[1] >= pair[0], "progress regressed: {pair:?}");
    }
    assert!(samples.iter().all(|&p| (0..=100).contains(&p)));
}

#[test]
fn abort_stops_the_request_and_init_recovers() {
    let dir = model_dir();
    let engine = Arc::new(Engine::new(Box::new(MockFactory::with_config(
        MockConfig {
            extract_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        },
    ))));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 64);

    let aborter = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(35));
            engine.request_abort();
        })
    };

    let (w, h) = (256u32, 256u32); // 16 tiles at ~10ms each
    let input_buf = gradient_rgba(w, h);
    let input = PackedImage::from_rgba8(&input_buf, w, h).unwrap();
    let mut out_buf = vec![0u8; (w * 2 * h * 2 * 4) as usize];
    let mut out = OutputImage::new(&mut out_buf, w * 2, h * 2, (w * 2 * 4) as usize).unwrap();

    let err = engine.process(&input, &mut out, 1).unwrap_err();
    assert!(matches!(err, ProcessError::Aborted));
    aborter.join().unwrap();

    // a fresh init clears the latched abort and processing works again
    init_engine(&engine, &dir);
    let out = process_to_vec(&engine, &gradient_rgba(8, 8), 8, 8, 2);
    assert_eq!(out.len(), 16 * 16 * 4);
}

#[test]
fn concurrent_requests_serialize_and_both_complete() {
    let dir = model_dir();
    let engine = Arc::new(Engine::new(Box::new(MockFactory::new())));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 32);

    let (w, h) = (96u32, 96u32);
    let input = gradient_rgba(w, h);
    let expected = process_to_vec(&engine, &input, w, h, 0);

    let mut handles = Vec::new();
    for id in 1..=2 {
        let engine = Arc::clone(&engine);
        let input = input.clone();
        handles.push(std::thread::spawn(move || {
            process_to_vec(&engine, &input, w, h, id)
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

/// Poll `cond` for up to five seconds; false on timeout.
fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn second_request_starts_gpu_phase_before_first_finishes_writeback() {
    // The lock must drop after the last tile is submitted, not after the
    // write-back drain. To observe it, every rayon worker is parked so
    // request 1 cannot finish draining until the test allows it; request 2
    // can then only reach the backend through the early release.
    let dir = model_dir();
    let extract_log = Arc::new(Mutex::new(Vec::new()));
    let engine = Arc::new(Engine::new(Box::new(MockFactory::with_config(
        MockConfig {
            extract_log: Some(Arc::clone(&extract_log)),
            ..Default::default()
        },
    ))));
    init_engine(&engine, &dir);
    engine.update_performance_config(0, 32); // 64x64 input -> 4 tiles

    let release_workers = Arc::new(AtomicBool::new(false));
    for _ in 0..rayon::current_num_threads() {
        let release = Arc::clone(&release_workers);
        rayon::spawn(move || {
            while !release.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    }

    let (w, h) = (64u32, 64u32);
    let tiles_per_request = 4usize;
    let input = gradient_rgba(w, h);

    let first = {
        let engine = Arc::clone(&engine);
        let input = input.clone();
        std::thread::spawn(move || {
            let out = process_to_vec(&engine, &input, w, h, 1);
            (out, Instant::now())
        })
    };

    // request 1 holds the lock once its GPU phase is underway
    assert!(
        wait_for(|| !extract_log.lock().unwrap().is_empty()),
        "request 1 never reached its GPU phase"
    );

    let second = {
        let engine = Arc::clone(&engine);
        let input = input.clone();
        std::thread::spawn(move || process_to_vec(&engine, &input, w, h, 2))
    };

    // request 2's first forward pass can only happen after request 1
    // dropped the lock, and request 1's drain is still parked
    let overlapped = wait_for(|| extract_log.lock().unwrap().len() > tiles_per_request);
    release_workers.store(true, Ordering::Relaxed);

    let (first_out, first_done) = first.join().unwrap();
    let second_out = second.join().unwrap();

    assert!(
        overlapped,
        "request 2 never reached its GPU phase while request 1 was draining"
    );
    let second_gpu_start = extract_log.lock().unwrap()[tiles_per_request];
    assert!(
        second_gpu_start < first_done,
        "request 2's GPU phase began only after request 1 completed its drain"
    );
    assert_eq!(first_out, second_out);
}

#[test]
fn stride_padded_input_is_read_correctly() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let (w, h) = (8u32, 8u32);
    let tight = gradient_rgba(w, h);

    // same pixels with 16 bytes of garbage padding per row
    let stride = (w * 4 + 16) as usize;
    let mut padded = vec![0xAAu8; stride * h as usize];
    for y in 0..h as usize {
        padded[y * stride..y * stride + (w * 4) as usize]
            .copy_from_slice(&tight[y * (w * 4) as usize..(y + 1) * (w * 4) as usize]);
    }

    let expected = process_to_vec(&engine, &tight, w, h, 1);

    let input = PackedImage::new(
        &padded,
        w,
        h,
        stride,
        upres_core::PixelFormat::Rgba8888,
    )
    .unwrap();
    let mut out_buf = vec![0u8; (w * 2 * h * 2 * 4) as usize];
    let mut out = OutputImage::new(&mut out_buf, w * 2, h * 2, (w * 2 * 4) as usize).unwrap();
    engine.process(&input, &mut out, 2).unwrap();
    assert_eq!(out_buf, expected);
}

#[test]
fn unsupported_pixel_format_is_rejected() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let buf = vec![0u8; 8 * 8 * 4];
    let input = PackedImage::new(&buf, 8, 8, 32, upres_core::PixelFormat::Unsupported).unwrap();
    let mut out_buf = vec![0u8; 16 * 16 * 4];
    let mut out = OutputImage::new(&mut out_buf, 16, 16, 64).unwrap();
    let err = engine.process(&input, &mut out, 1).unwrap_err();
    assert!(matches!(err, ProcessError::UnsupportedPixelFormat));
}

#[test]
fn mismatched_output_buffer_is_rejected() {
    let dir = model_dir();
    let engine = Engine::new(Box::new(MockFactory::new()));
    init_engine(&engine, &dir);

    let buf = gradient_rgba(8, 8);
    let input = PackedImage::from_rgba8(&buf, 8, 8).unwrap();
    let mut out_buf = vec![0u8; 8 * 8 * 4];
    let mut out = OutputImage::new(&mut out_buf, 8, 8, 32).unwrap();
    let err = engine.process(&input, &mut out, 1).unwrap_err();
    assert!(matches!(err, ProcessError::InvalidBuffer(_)));
}
