//! Model catalog: resolves a (family, noise, scale) selection into concrete
//! weight files and per-family hyper-parameters.
//!
//! Weight files live on local disk as `.param`/`.bin` pairs following the
//! upstream model-zoo naming for each family. Resolution is pure apart from
//! the final existence check.

use std::path::{Path, PathBuf};

use crate::error::CatalogError;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// Waifu2x CUNet models (`noise{n}_scale2.0x_model.*` et al).
    Waifu2xCunet,
    /// Waifu2x UpConv7 models, 2x only.
    UpConv7,
    /// Real-CUGAN SE models (`up{s}x-{variant}.*`).
    RealCugan,
    /// Real-ESRGAN v3 anime models (`x{s}.*`). Noise is ignored.
    RealEsrgan,
    /// Fixed `up2x-no-denoise` model.
    Nose,
}

impl ModelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waifu2xCunet => "waifu2x-cunet",
            Self::UpConv7 => "waifu2x-upconv7",
            Self::RealCugan => "real-cugan",
            Self::RealEsrgan => "real-esrgan",
            Self::Nose => "nose",
        }
    }

    pub fn supported_scales(&self) -> &'static [u32] {
        match self {
            Self::Waifu2xCunet => &[1, 2],
            Self::UpConv7 => &[2],
            Self::RealCugan => &[2, 3, 4],
            Self::RealEsrgan => &[2, 3, 4],
            Self::Nose => &[2],
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved model: weight files plus the hyper-parameters the pipeline
/// needs to tile correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub family: ModelFamily,
    pub param_path: PathBuf,
    pub bin_path: PathBuf,
    /// Per-side tile border in source pixels; its scaled counterpart is
    /// discarded on write-back.
    pub prepadding: u32,
    pub supported_scales: &'static [u32],
}

/// Real-CUGAN denoise variant for a noise level. 3x/4x model sets only ship
/// no-denoise, denoise3x and conservative, so noise 1 and 2 are promoted.
fn cugan_variant(noise: i32, scale: u32) -> &'static str {
    if scale > 2 && (1..=2).contains(&noise) {
        return "denoise3x";
    }
    match noise {
        1 => "denoise1x",
        2 => "denoise2x",
        3 => "denoise3x",
        4 => "conservative",
        _ => "no-denoise",
    }
}

fn cugan_prepadding(scale: u32) -> u32 {
    match scale {
        3 => 14,
        4 => 19,
        _ => 18,
    }
}

/// Resolve a model selection against `model_dir`.
///
/// Fails with [`CatalogError::ModelNotFound`] when either weight file is
/// missing, and with [`CatalogError::UnsupportedScale`] when the family has
/// no model at the requested factor.
pub fn resolve(
    family: ModelFamily,
    noise: i32,
    scale: u32,
    model_dir: &Path,
) -> Result<ModelSpec, CatalogError> {
    if !family.supported_scales().contains(&scale) {
        return Err(CatalogError::UnsupportedScale {
            family: family.name(),
            scale,
            supported: family.supported_scales(),
        });
    }

    let (stem, prepadding) = match family {
        ModelFamily::Waifu2xCunet => {
            let stem = if noise == -1 {
                "scale2.0x_model".to_string()
            } else if scale == 1 {
                format!("noise{noise}_model")
            } else {
                format!("noise{noise}_scale2.0x_model")
            };
            (stem, 18)
        }
        ModelFamily::UpConv7 => (format!("noise{noise}_scale2.0x_model"), 7),
        ModelFamily::RealCugan => (
            format!("up{scale}x-{}", cugan_variant(noise, scale)),
            cugan_prepadding(scale),
        ),
        ModelFamily::RealEsrgan => (format!("x{scale}"), 10),
        ModelFamily::Nose => ("up2x-no-denoise".to_string(), 18),
    };

    let param_path = model_dir.join(format!("{stem}.param"));
    let bin_path = model_dir.join(format!("{stem}.bin"));

    if !param_path.is_file() || !bin_path.is_file() {
        return Err(CatalogError::ModelNotFound {
            param: param_path,
            bin: bin_path,
        });
    }

    Ok(ModelSpec {
        family,
        param_path,
        bin_path,
        prepadding,
        supported_scales: family.supported_scales(),
    })
}
