//! Process-wide session: the loaded model, the serialization lock and the
//! lock-free progress/abort state.
//!
//! One request holds the lock at a time. Model swaps use an abort-then-lock
//! protocol: the abort flag is raised before blocking on the lock, which
//! makes any running request exit at its next abort check, then the flag is
//! cleared once the lock is held. The GPU instance behind the backend
//! factory is created lazily on the first `init` and never torn down;
//! repeated teardown is known to stall mobile GPU drivers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, info};

use crate::backend::{BackendFactory, BackendOptions, InferenceBackend};
use crate::catalog::{self, ModelFamily};
use crate::error::{ChainError, InitError, ProcessError};
use crate::executor;
use crate::image::{OutputImage, PackedImage};
use crate::shader_chain::ShaderChain;

/// Default tile edge length, balancing speed and memory.
pub const DEFAULT_TILE_SIZE: u32 = 128;

/// Lock-free session state, readable without the lock.
pub struct SessionAtomics {
    /// Percent complete of the active request, 0..=100.
    pub progress: AtomicI32,
    /// Identifier of the active request; -1 before the first request.
    pub current_id: AtomicI32,
    /// Host hint; not consulted by the pipeline.
    pub ui_busy: AtomicI32,
    /// Raised to make the running request exit at its next tile boundary.
    pub should_abort: AtomicBool,
}

impl Default for SessionAtomics {
    fn default() -> Self {
        Self {
            progress: AtomicI32::new(0),
            current_id: AtomicI32::new(-1),
            ui_busy: AtomicI32::new(0),
            should_abort: AtomicBool::new(false),
        }
    }
}

/// The loaded network plus its per-family hyper-parameters.
pub struct LoadedModel {
    pub backend: Box<dyn InferenceBackend>,
    pub family: ModelFamily,
    pub noise: i32,
    pub scale: u32,
    pub tile_size: u32,
    pub prepadding: u32,
    /// Per-tile sleep for thermal management; 0 disables it.
    pub tile_sleep_ms: u64,
    pub tta_mode: bool,
    pub disable_grayscale_check: bool,
    pub is_snapdragon: bool,
}

/// Lock-protected mutable session state.
pub struct SessionState {
    pub model: Option<LoadedModel>,
    pub(crate) chain: Option<ShaderChain>,
}

/// Options for [`Engine::init`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub family: ModelFamily,
    pub model_dir: PathBuf,
    /// Denoise level; -1..=4 depending on the family.
    pub noise: i32,
    pub scale: u32,
    pub tile_sleep_ms: u64,
    pub disable_grayscale_check: bool,
    pub tta_mode: bool,
    pub is_snapdragon: bool,
}

impl InitOptions {
    pub fn new(family: ModelFamily, model_dir: impl Into<PathBuf>, noise: i32, scale: u32) -> Self {
        Self {
            family,
            model_dir: model_dir.into(),
            noise,
            scale,
            tile_sleep_ms: 0,
            disable_grayscale_check: false,
            tta_mode: false,
            is_snapdragon: false,
        }
    }
}

/// The engine: session owner and caller interface.
pub struct Engine {
    factory: Box<dyn BackendFactory>,
    state: Mutex<SessionState>,
    atomics: Arc<SessionAtomics>,
}

static GLOBAL_ENGINE: OnceLock<Engine> = OnceLock::new();

impl Engine {
    pub fn new(factory: Box<dyn BackendFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(SessionState {
                model: None,
                chain: None,
            }),
            atomics: Arc::new(SessionAtomics::default()),
        }
    }

    /// Install the process-wide engine. The first call wins; later calls
    /// return the already-installed instance.
    pub fn install(factory: Box<dyn BackendFactory>) -> &'static Engine {
        GLOBAL_ENGINE.get_or_init(|| Engine::new(factory))
    }

    pub fn global() -> Option<&'static Engine> {
        GLOBAL_ENGINE.get()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load (or swap) the model for the given selection.
    ///
    /// Raises the abort flag before blocking on the lock so a running
    /// request exits promptly, then clears it once the lock is held.
    pub fn init(&self, opts: InitOptions) -> Result<(), InitError> {
        self.atomics.should_abort.store(true, Ordering::SeqCst);
        let mut state = self.lock_state();
        self.atomics.should_abort.store(false, Ordering::SeqCst);

        self.factory.ensure_gpu()?;

        let spec = catalog::resolve(opts.family, opts.noise, opts.scale, &opts.model_dir)?;

        let backend_opts = BackendOptions {
            tta_mode: opts.tta_mode,
            ..BackendOptions::default()
        };
        let mut backend = self.factory.create(&backend_opts)?;
        backend
            .load_param(&spec.param_path)
            .map_err(InitError::ModelLoad)?;
        backend
            .load_model(&spec.bin_path)
            .map_err(InitError::ModelLoad)?;

        state.model = Some(LoadedModel {
            backend,
            family: opts.family,
            noise: opts.noise,
            scale: opts.scale,
            tile_size: DEFAULT_TILE_SIZE,
            prepadding: spec.prepadding,
            tile_sleep_ms: opts.tile_sleep_ms,
            tta_mode: opts.tta_mode,
            disable_grayscale_check: opts.disable_grayscale_check,
            is_snapdragon: opts.is_snapdragon,
        });
        self.atomics.progress.store(0, Ordering::Relaxed);

        info!(
            family = %opts.family,
            noise = opts.noise,
            scale = opts.scale,
            prepadding = spec.prepadding,
            tile_sleep_ms = opts.tile_sleep_ms,
            "model loaded"
        );
        Ok(())
    }

    /// Drop the loaded model and shader chain. The GPU instance stays
    /// alive for the rest of the process.
    pub fn destroy(&self) {
        let mut state = self.lock_state();
        state.model = None;
        state.chain = None;
        self.atomics.should_abort.store(false, Ordering::SeqCst);
        debug!("session destroyed");
    }

    /// Upscale one image into the caller-owned output buffer.
    ///
    /// Serialized against other requests and against `init`/`destroy`. The
    /// session lock is released internally once all GPU work is submitted,
    /// so the next request may start before this one returns; the call
    /// itself returns only after the output buffer is fully written.
    pub fn process(
        &self,
        input: &PackedImage<'_>,
        out: &mut OutputImage<'_>,
        id: i32,
    ) -> Result<(), ProcessError> {
        let state = self.lock_state();
        // Active only once the lock is held.
        self.atomics.progress.store(0, Ordering::Relaxed);
        self.atomics.current_id.store(id, Ordering::Relaxed);
        executor::run(state, &self.atomics, input, out)
    }

    /// Request id and progress packed into one value: id in the high
    /// 32 bits, progress in the low 32 bits.
    pub fn packed_progress(&self) -> i64 {
        let id = self.atomics.current_id.load(Ordering::Relaxed) as i64;
        let progress = self.atomics.progress.load(Ordering::Relaxed) as i64;
        (id << 32) | (progress & 0xFFFF_FFFF)
    }

    pub fn progress(&self) -> i32 {
        self.atomics.progress.load(Ordering::Relaxed)
    }

    pub fn set_ui_busy(&self, busy: bool) {
        self.atomics.ui_busy.store(busy as i32, Ordering::Relaxed);
    }

    pub fn ui_busy(&self) -> bool {
        self.atomics.ui_busy.load(Ordering::Relaxed) != 0
    }

    /// Make the running request exit at its next tile boundary. The flag
    /// stays raised until the next `init` (or `destroy`), so a host that
    /// cancels a queue of requests follows this with one of those.
    pub fn request_abort(&self) {
        self.atomics.should_abort.store(true, Ordering::SeqCst);
    }

    /// Adjust thermal sleep and tile size of the loaded model. The tile
    /// grid clamps degenerate tile sizes; the value is stored as given.
    pub fn update_performance_config(&self, tile_sleep_ms: u64, tile_size: u32) {
        let mut state = self.lock_state();
        if let Some(model) = state.model.as_mut() {
            model.tile_sleep_ms = tile_sleep_ms;
            model.tile_size = tile_size;
            debug!(tile_sleep_ms, tile_size, "performance config updated");
        }
    }

    /// Compile a shader chain from directive-annotated fragment sources.
    pub fn init_shader_chain(&self, sources: &[String], names: &[String]) -> Result<(), ChainError> {
        let chain = ShaderChain::load(sources, names)?;
        let mut state = self.lock_state();
        state.chain = Some(chain);
        Ok(())
    }

    /// Run the shader chain over one packed RGBA image. The session lock is
    /// held for the whole call.
    pub fn process_shader_chain(
        &self,
        input: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Vec<u8>, u32, u32), ChainError> {
        let mut state = self.lock_state();
        let chain = state.chain.as_mut().ok_or(ChainError::NotInitialized)?;
        chain.process(input, width, height)
    }

    /// Output size the current shader chain would produce, if one is loaded.
    pub fn shader_chain_output_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let state = self.lock_state();
        state.chain.as_ref().map(|c| c.output_size(width, height))
    }
}
