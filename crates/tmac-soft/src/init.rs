//! Seeded Xavier/Glorot initialisation of model parameters.
//!
//! candle's own initialisers draw from the device RNG, which cannot be
//! seeded on CPU. Models here are built through a [`VarMap`] first and
//! then overwritten in place from one explicitly seeded [`StdRng`]:
//!
//! - every conv/linear weight (rank ≥ 2, named `*.weight`) gets Xavier
//!   uniform or normal values, and its sibling `*.bias` is zeroed
//! - the learned initial memory vector gets standard-normal values
//! - batch-norm scales, shifts and running statistics are left alone
//!
//! Variables are visited in sorted name order so the draw sequence, and
//! therefore every weight, is reproducible from the seed.

use candle_core::Tensor;
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use tmac_core::{InitConfig, InitScheme, TmacError};

/// Name suffix of the learned initial memory parameter.
pub const INIT_MEMORY_NAME: &str = "init_memory";

/// `(fan_in, fan_out)` of a weight shaped `(out, in, k1, k2, ...)`.
///
/// # Example
///
/// ```
/// use tmac_soft::init::fans;
///
/// assert_eq!(fans(&[4, 8]), (8, 4));
/// assert_eq!(fans(&[16, 3, 3, 3]), (27, 144));
/// ```
pub fn fans(dims: &[usize]) -> (usize, usize) {
    match dims {
        [] => (1, 1),
        [n] => (*n, *n),
        [out_dim, in_dim, receptive @ ..] => {
            let field: usize = receptive.iter().product();
            (in_dim * field, out_dim * field)
        }
    }
}

/// Initialises every parameter under `prefix` in `var_map`.
///
/// Returns the number of variables that were overwritten.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the var map lock is poisoned or a
/// tensor cannot be written.
pub fn initialize_parameters(
    var_map: &VarMap,
    prefix: &str,
    config: &InitConfig,
) -> Result<usize, TmacError> {
    let map_err = |e: candle_core::Error| TmacError::Internal {
        message: format!("initialize_parameters: {e}"),
    };

    let data = var_map.data().lock().map_err(|_| TmacError::Internal {
        message: "initialize_parameters: var map lock poisoned".to_string(),
    })?;

    let mut names: Vec<&String> = data.keys().filter(|n| n.starts_with(prefix)).collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut written = 0;

    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let count = var.elem_count();

        let values: Vec<f32> = if name.ends_with(INIT_MEMORY_NAME) {
            (0..count).map(|_| rng.sample(StandardNormal)).collect()
        } else if dims.len() >= 2 && name.ends_with(".weight") {
            let (fan_in, fan_out) = fans(&dims);
            xavier(&mut rng, config.scheme, fan_in, fan_out, count)?
        } else if let Some(stem) = name.strip_suffix(".bias") {
            let weight_rank = data
                .get(&format!("{stem}.weight"))
                .map(|w| w.rank())
                .unwrap_or(0);
            if weight_rank < 2 {
                continue;
            }
            vec![0.0; count]
        } else {
            continue;
        };

        let tensor = Tensor::from_vec(values, dims, var.device()).map_err(map_err)?;
        var.set(&tensor).map_err(map_err)?;
        written += 1;
    }

    tracing::debug!(prefix, written, seed = config.seed, "initialised parameters");
    Ok(written)
}

fn xavier(
    rng: &mut StdRng,
    scheme: InitScheme,
    fan_in: usize,
    fan_out: usize,
    count: usize,
) -> Result<Vec<f32>, TmacError> {
    let fan_sum = (fan_in + fan_out) as f32;
    match scheme {
        InitScheme::Uniform => {
            let bound = (6.0 / fan_sum).sqrt();
            Ok((0..count).map(|_| rng.gen_range(-bound..bound)).collect())
        }
        InitScheme::Normal => {
            let std = (2.0 / fan_sum).sqrt();
            let normal = Normal::new(0.0f32, std).map_err(|e| TmacError::Internal {
                message: format!("xavier normal: {e}"),
            })?;
            Ok((0..count).map(|_| normal.sample(rng)).collect())
        }
    }
}

/// Total number of scalar parameters under `prefix`, excluding batch-norm
/// running statistics.
///
/// # Errors
///
/// Returns [`TmacError::Internal`] if the var map lock is poisoned.
pub fn count_parameters(var_map: &VarMap, prefix: &str) -> Result<usize, TmacError> {
    let data = var_map.data().lock().map_err(|_| TmacError::Internal {
        message: "count_parameters: var map lock poisoned".to_string(),
    })?;
    Ok(data
        .iter()
        .filter(|(name, _)| {
            name.starts_with(prefix)
                && !name.ends_with("running_mean")
                && !name.ends_with("running_var")
        })
        .map(|(_, var)| var.elem_count())
        .sum())
}
