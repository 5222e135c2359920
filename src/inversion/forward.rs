//! Forward (inversion) driver.
//!
//! 1. Draw independent noisy versions of `w0` at every inference timestep.
//! 2. Walk from the noisiest latent towards `w0`; at each step predict the
//!    noise, compute the posterior mean `μ`, and record the residual
//!    `z = (x_{t-1} - μ) / (η σ_t)` that the reverse step needs to land
//!    exactly on `x_{t-1}`.
//! 3. With the numerical fix, store `μ + η σ_t z` as `x_{t-1}` so the replay
//!    reproduces the stored latent bit for bit.

use std::time::Instant;

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

use super::{Trajectory, guide};
use crate::error::Stage;
use crate::model::DiffusionModel;
use crate::scheduler::DdpmScheduler;
use crate::{Error, Result};

/// Below this, a step's noise scale is treated as zero.
const MIN_NOISE_SCALE: f64 = 1e-12;

/// Inputs to [`invert`] besides the model and the latent.
#[derive(Debug, Clone)]
pub struct InversionParams {
    /// Description of the input; empty means unconditional.
    pub source_prompt: String,
    pub cfg_scale: f64,
    /// Fraction of the posterior noise kept (1.0 = full DDPM).
    pub eta: f64,
    /// Store `μ + η σ z` instead of the sampled latent.
    pub numerical_fix: bool,
    /// Seeds the forward noise draws.
    pub seed: u64,
}

impl Default for InversionParams {
    fn default() -> Self {
        Self {
            source_prompt: String::new(),
            cfg_scale: crate::config::EditDefaults::CFG_SCALE_SRC,
            eta: 1.0,
            numerical_fix: true,
            seed: crate::config::EditDefaults::SEED,
        }
    }
}

/// Invert `w0` into noise and latent trajectories.
///
/// `scheduler` must already have its timesteps set. Any model failure voids
/// the whole inversion.
pub fn invert(
    model: &dyn DiffusionModel,
    scheduler: &DdpmScheduler,
    w0: &Tensor,
    params: &InversionParams,
) -> Result<Trajectory> {
    let timesteps = scheduler.timesteps();
    let num_steps = timesteps.len();
    if num_steps == 0 {
        return Err(Error::InvalidParameter(
            "scheduler has no timesteps; call set_timesteps first".into(),
        ));
    }
    if params.eta <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "inversion needs eta > 0, got {}",
            params.eta
        )));
    }

    let start = Instant::now();
    let uncond = model.encode_prompt("")?;
    let cond = if params.source_prompt.trim().is_empty() {
        None
    } else {
        Some(model.encode_prompt(&params.source_prompt)?)
    };

    let mut latents = sample_noisy_latents(scheduler, w0, params.seed)?;
    let mut noise = vec![None; num_steps];

    for (step, &t) in timesteps.iter().enumerate() {
        let idx = num_steps - step - 1;
        let run_step = || -> Result<(Tensor, Tensor)> {
            let xt = &latents[idx + 1];
            let uncond_pred = model.predict_noise(xt, t, &uncond)?;
            let noise_pred = match &cond {
                Some(cond) => {
                    let cond_pred = model.predict_noise(xt, t, cond)?;
                    guide(&uncond_pred, &cond_pred, params.cfg_scale)?
                }
                None => uncond_pred,
            };

            let mean = scheduler.posterior_mean(&noise_pred, t, xt, params.eta)?;
            let scale = scheduler.noise_scale(t, params.eta);
            if scale < MIN_NOISE_SCALE {
                return Ok((mean.zeros_like()?, mean));
            }
            let z = ((&latents[idx] - &mean)? / scale)?;
            let x_prev = if params.numerical_fix {
                (&mean + z.affine(scale, 0.0)?)?
            } else {
                latents[idx].clone()
            };
            Ok((z, x_prev))
        };
        let (z, x_prev) = run_step().map_err(Error::in_step(Stage::Inversion, step))?;

        tracing::trace!(step, timestep = t, "inversion step");
        noise[idx] = Some(z);
        latents[idx] = x_prev;
    }

    let noise = noise.into_iter().flatten().collect();
    let trajectory = Trajectory::new(noise, latents)?;
    tracing::debug!(
        steps = num_steps,
        conditioned = cond.is_some(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "inversion done"
    );
    Ok(trajectory)
}

/// `latents[0] = w0`, `latents[i] = sqrt(ᾱ) w0 + sqrt(1-ᾱ) ε_i` at `τ_{N-i}`.
///
/// Draws are made from the least to the most noisy timestep.
fn sample_noisy_latents(scheduler: &DdpmScheduler, w0: &Tensor, seed: u64) -> Result<Vec<Tensor>> {
    let timesteps = scheduler.timesteps();
    let num_steps = timesteps.len();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut latents = Vec::with_capacity(num_steps + 1);
    latents.push(w0.clone());
    for idx in 1..=num_steps {
        let t = timesteps[num_steps - idx];
        let epsilon = gaussian_like(w0, &mut rng)?;
        latents.push(scheduler.add_noise(w0, &epsilon, t)?);
    }
    Ok(latents)
}

/// Standard normal tensor with `like`'s shape, dtype and device.
fn gaussian_like(like: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    use rand::Rng;

    let values: Vec<f32> = (0..like.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    let tensor = Tensor::from_vec(values, like.shape(), like.device())?;
    if like.dtype() == DType::F32 {
        Ok(tensor)
    } else {
        Ok(tensor.to_dtype(like.dtype())?)
    }
}
