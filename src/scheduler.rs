//! Discrete-time DDPM noise schedule.
//!
//! The forward process is `x_t = sqrt(ᾱ_t) x_0 + sqrt(1 - ᾱ_t) ε`, with
//! `ᾱ_t = Π (1 - β_s)` over a fixed number of training timesteps. Inference
//! visits a strided subset of those timesteps ("leading" spacing plus an
//! offset), see [`ddpm::DdpmScheduler::set_timesteps`].
//!
//! - [`ddpm`]: schedule tables, posterior mean and variance, reverse step

pub mod ddpm;

pub use ddpm::DdpmScheduler;

use serde::{Deserialize, Serialize};

/// How betas are spaced between `beta_start` and `beta_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    /// Linear in `sqrt(β)`, then squared.
    ScaledLinear,
}

/// Scheduler configuration. Defaults match the AudioLDM2 checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,

    /// Added to every inference timestep (default: 1).
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,

    /// When false, the step past the last timestep uses `ᾱ_0` instead of 1.
    #[serde(default)]
    pub set_alpha_to_one: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            steps_offset: default_steps_offset(),
            set_alpha_to_one: false,
        }
    }
}

impl SchedulerConfig {
    /// The beta for every training timestep.
    pub fn betas(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let lerp = |start: f64, end: f64, i: usize| {
            if n == 1 {
                start
            } else {
                start + (end - start) * i as f64 / (n - 1) as f64
            }
        };
        match self.beta_schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| lerp(self.beta_start, self.beta_end, i))
                .collect(),
            BetaSchedule::ScaledLinear => (0..n)
                .map(|i| lerp(self.beta_start.sqrt(), self.beta_end.sqrt(), i).powi(2))
                .collect(),
        }
    }

    /// Cumulative products `ᾱ_t`.
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        self.betas()
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect()
    }

    /// Largest inference step count whose timesteps stay inside the table.
    pub fn max_inference_steps(&self) -> usize {
        // (n - 1) * (T / n) + offset < T
        (1..=self.num_train_timesteps)
            .rev()
            .find(|&n| (n - 1) * (self.num_train_timesteps / n) + self.steps_offset < self.num_train_timesteps)
            .unwrap_or(0)
    }

    pub fn verify(&self) -> crate::Result<()> {
        if self.num_train_timesteps == 0 {
            return Err(crate::Error::Config(
                "num_train_timesteps must be positive".into(),
            ));
        }
        if !(0.0 < self.beta_start && self.beta_start < self.beta_end && self.beta_end < 1.0) {
            return Err(crate::Error::Config(format!(
                "betas must satisfy 0 < beta_start < beta_end < 1, got {} and {}",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.0015
}

fn default_beta_end() -> f64 {
    0.0195
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}

fn default_steps_offset() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn scaled_linear_endpoints() {
        let config = SchedulerConfig::default();
        let betas = config.betas();
        assert_eq!(betas.len(), 1000);
        assert_abs_diff_eq!(betas[0], 0.0015, epsilon = 1e-12);
        assert_abs_diff_eq!(betas[999], 0.0195, epsilon = 1e-12);
    }

    #[test]
    fn alphas_cumprod_decreasing() {
        let config = SchedulerConfig::default();
        let alphas = config.alphas_cumprod();
        assert_abs_diff_eq!(alphas[0], 1.0 - 0.0015, epsilon = 1e-12);
        for i in 1..alphas.len() {
            assert!(alphas[i] < alphas[i - 1], "not decreasing at {i}");
        }
        // Most of the signal is gone by the last timestep.
        assert!(alphas[999] < 0.01, "alpha_bar_T = {}", alphas[999]);
    }

    #[test]
    fn max_inference_steps_respects_offset() {
        let config = SchedulerConfig::default();
        // 1000 steps with offset 1 would need timestep 1000.
        assert_eq!(config.max_inference_steps(), 999);

        let no_offset = SchedulerConfig {
            steps_offset: 0,
            ..Default::default()
        };
        assert_eq!(no_offset.max_inference_steps(), 1000);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"beta_schedule": "linear", "steps_offset": 0}"#).unwrap();
        assert_eq!(config.beta_schedule, BetaSchedule::Linear);
        assert_eq!(config.steps_offset, 0);
        assert_eq!(config.num_train_timesteps, 1000);
        config.verify().unwrap();
    }

    #[test]
    fn bad_betas_rejected() {
        let config = SchedulerConfig {
            beta_start: 0.02,
            beta_end: 0.01,
            ..Default::default()
        };
        assert!(config.verify().is_err());
    }
}
