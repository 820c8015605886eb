//! Shader-chain post-processor.
//!
//! Runs a user-supplied sequence of GLSL fragment passes over an image.
//! Each source carries `//!` directive lines naming its output render
//! target, the prior targets it reads, and an optional per-axis 2x scale;
//! the initial input is published under the name `MAIN`.

mod chain;
mod directive;

pub use chain::ShaderChain;
pub use directive::{assemble_fragment, chain_output_size, parse_pass, ParsedPass};
