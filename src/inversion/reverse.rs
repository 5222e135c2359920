//! Reverse (editing) driver.
//!
//! Starts from `latents[T_start]` and runs the last `T_start` timesteps,
//! conditioned on the target prompt, injecting the recorded noise
//! `noise[T_start-1], …, noise[0]` at each step.

use std::time::Instant;

use candle_core::Tensor;

use super::{Trajectory, guide};
use crate::error::Stage;
use crate::model::DiffusionModel;
use crate::scheduler::DdpmScheduler;
use crate::{Error, Result};

/// Inputs to [`sample`] besides the model and the trajectory.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub target_prompt: String,
    /// Empty = no negative conditioning (the unconditional embedding).
    pub negative_prompt: String,
    pub cfg_scale: f64,
    /// Must match the eta the trajectory was inverted with.
    pub eta: f64,
    /// Number of reverse steps to run, in `1..=steps`. Higher = stronger edit.
    pub t_start: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            target_prompt: String::new(),
            negative_prompt: String::new(),
            cfg_scale: crate::config::EditDefaults::CFG_SCALE_TAR,
            eta: 1.0,
            t_start: crate::config::EditDefaults::T_START,
        }
    }
}

/// Replay `trajectory` under the target prompt and return the edited latent.
pub fn sample(
    model: &dyn DiffusionModel,
    scheduler: &DdpmScheduler,
    trajectory: &Trajectory,
    params: &SamplingParams,
) -> Result<Tensor> {
    let timesteps = scheduler.timesteps();
    let num_steps = timesteps.len();
    trajectory.check_compatible(num_steps, params.t_start)?;

    let start = Instant::now();
    let negative = model.encode_prompt(&params.negative_prompt)?;
    let target = model.encode_prompt(&params.target_prompt)?;

    let noise = &trajectory.noise()[..params.t_start];
    let mut xt = trajectory.latents()[params.t_start].clone();

    for (step, &t) in timesteps[num_steps - params.t_start..].iter().enumerate() {
        let idx = params.t_start - step - 1;
        let run_step = || -> Result<Tensor> {
            let uncond_pred = model.predict_noise(&xt, t, &negative)?;
            let cond_pred = model.predict_noise(&xt, t, &target)?;
            let noise_pred = guide(&uncond_pred, &cond_pred, params.cfg_scale)?;
            scheduler.step(&noise_pred, t, &xt, params.eta, &noise[idx])
        };
        xt = run_step().map_err(Error::in_step(Stage::Sampling, step))?;
        tracing::trace!(step, timestep = t, "sampling step");
    }

    tracing::debug!(
        t_start = params.t_start,
        steps = num_steps,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "sampling done"
    );
    Ok(xt)
}
