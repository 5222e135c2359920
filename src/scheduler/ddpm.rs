//! DDPM scheduler with edit-friendly inversion support.
//!
//! Per inference timestep `t` with predecessor `t' = t - T/n`:
//! ```text
//! x̂_0  = (x_t - sqrt(1 - ᾱ_t) ε̂) / sqrt(ᾱ_t)
//! σ²_t = (1 - ᾱ_t') / (1 - ᾱ_t) · (1 - ᾱ_t / ᾱ_t')
//! μ_t  = sqrt(ᾱ_t') x̂_0 + sqrt(1 - ᾱ_t' - η σ²_t) ε̂
//! x_t' = μ_t + η σ_t z
//! ```
//! Inversion solves the last line for `z`; sampling replays it.

use candle_core::Tensor;

use super::SchedulerConfig;
use crate::{Error, Result};

/// DDPM scheduler state for one step count.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    /// Inference timesteps, noisiest first.
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdpmScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.verify()?;
        let alphas_cumprod = config.alphas_cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Ok(Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps: Vec::new(),
            step_ratio: 0,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Set up "leading" timesteps: `[(n-1)·r, …, r, 0] + offset` with `r = T / n`.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let max = self.config.max_inference_steps();
        if num_inference_steps == 0 || num_inference_steps > max {
            return Err(Error::InvalidParameter(format!(
                "step count must be in 1..={max} for this scheduler, got {num_inference_steps}"
            )));
        }
        self.step_ratio = self.config.num_train_timesteps / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .rev()
            .map(|i| i * self.step_ratio + self.config.steps_offset)
            .collect();
        Ok(())
    }

    /// Inference timesteps, noisiest first.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// `ᾱ_t`.
    pub fn alpha_prod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// `ᾱ` at the timestep one inference step closer to the data.
    pub fn alpha_prod_prev(&self, timestep: usize) -> f64 {
        match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.alphas_cumprod[prev],
            None => self.final_alpha_cumprod,
        }
    }

    /// Posterior variance `σ²_t`.
    pub fn variance(&self, timestep: usize) -> f64 {
        let alpha_prod_t = self.alpha_prod(timestep);
        let alpha_prod_t_prev = self.alpha_prod_prev(timestep);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
        (beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev)
    }

    /// Standard deviation of the injected noise, `η σ_t`.
    pub fn noise_scale(&self, timestep: usize, eta: f64) -> f64 {
        eta * self.variance(timestep).sqrt()
    }

    /// Forward-diffuse a clean sample to `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let alpha_prod_t = self.alpha_prod(timestep);
        let signal = original.affine(alpha_prod_t.sqrt(), 0.0)?;
        let noise = noise.affine((1.0 - alpha_prod_t).sqrt(), 0.0)?;
        Ok((signal + noise)?)
    }

    /// Deterministic part `μ_t` of the step from `timestep` to its predecessor.
    pub fn posterior_mean(
        &self,
        noise_pred: &Tensor,
        timestep: usize,
        sample: &Tensor,
        eta: f64,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alpha_prod(timestep);
        let alpha_prod_t_prev = self.alpha_prod_prev(timestep);
        let variance = self.variance(timestep);

        // x̂_0 = (x_t - sqrt(1 - ᾱ_t) ε̂) / sqrt(ᾱ_t)
        let pred_original = (sample.affine(1.0 / alpha_prod_t.sqrt(), 0.0)?
            - noise_pred.affine((1.0 - alpha_prod_t).sqrt() / alpha_prod_t.sqrt(), 0.0)?)?;

        let direction_scale = (1.0 - alpha_prod_t_prev - eta * variance).max(0.0).sqrt();
        let mean = (pred_original.affine(alpha_prod_t_prev.sqrt(), 0.0)?
            + noise_pred.affine(direction_scale, 0.0)?)?;
        Ok(mean)
    }

    /// One reverse step, injecting `variance_noise` scaled by `η σ_t`.
    pub fn step(
        &self,
        noise_pred: &Tensor,
        timestep: usize,
        sample: &Tensor,
        eta: f64,
        variance_noise: &Tensor,
    ) -> Result<Tensor> {
        let mean = self.posterior_mean(noise_pred, timestep, sample, eta)?;
        if eta <= 0.0 {
            return Ok(mean);
        }
        let noise = variance_noise.affine(self.noise_scale(timestep, eta), 0.0)?;
        Ok((mean + noise)?)
    }
}
