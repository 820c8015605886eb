//! On-device image super-resolution engine.
//!
//! Upscales still images by an integer factor with convolutional models
//! (Waifu2x, Real-CUGAN, Real-ESRGAN, UpConv7) executed on an injected GPU
//! inference backend. Large images are split into padded tiles; GPU
//! inference of later tiles overlaps with CPU write-back of earlier ones,
//! and the session lock is released as soon as all GPU work is submitted so
//! the next image can start. A secondary shader-chain post-processor runs
//! user-supplied GLSL fragment passes (Anime4K-style `//!` directives).
//!
//! The convolutional operators themselves live in an external inference
//! library bound through the traits in [`backend`]; this crate supplies
//! everything around them.

pub mod alpha;
pub mod backend;
pub mod catalog;
pub mod color;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod logging;
pub mod session;
pub mod shader_chain;
pub mod tiler;

pub use catalog::{ModelFamily, ModelSpec};
pub use error::{status_code, InitError, ProcessError, STATUS_FAILURE, STATUS_OK};
pub use image::{OutputImage, PackedImage, PixelFormat, Plane, PlanarImage};
pub use session::{Engine, InitOptions, DEFAULT_TILE_SIZE};
pub use shader_chain::ShaderChain;
