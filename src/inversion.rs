//! Edit-friendly DDPM inversion and replay.
//!
//! - [`forward`]: inversion: latent + source prompt → [`Trajectory`]
//! - [`reverse`]: editing: trajectory + target prompt → edited latent
//!
//! Indexing convention, for `N` inference steps with timesteps
//! `τ_0 > τ_1 > … > τ_{N-1}`:
//! - `latents[0]` is the clean latent, `latents[i]` sits at `τ_{N-i}`, so
//!   `latents[N]` is the noisiest one.
//! - `noise[i]` is the residual that carries `latents[i + 1]` to `latents[i]`.
//!
//! Editing with `T_start = k` starts at `latents[k]` and replays
//! `noise[k-1], …, noise[0]`.

pub mod forward;
pub mod reverse;

pub use forward::{InversionParams, invert};
pub use reverse::{SamplingParams, sample};

use candle_core::Tensor;

use crate::{Error, Result};

/// Recorded noise and latent trajectories from one inversion.
#[derive(Debug, Clone)]
pub struct Trajectory {
    noise: Vec<Tensor>,
    latents: Vec<Tensor>,
}

impl Trajectory {
    pub(crate) fn new(noise: Vec<Tensor>, latents: Vec<Tensor>) -> Result<Self> {
        if latents.len() != noise.len() + 1 {
            return Err(Error::InvalidParameter(format!(
                "trajectory needs one more latent than noise entries, got {} and {}",
                latents.len(),
                noise.len()
            )));
        }
        Ok(Self { noise, latents })
    }

    /// Number of diffusion steps the trajectory covers.
    pub fn num_steps(&self) -> usize {
        self.noise.len()
    }

    /// Per-step noise residuals, `zs`.
    pub fn noise(&self) -> &[Tensor] {
        &self.noise
    }

    /// Intermediate latents, `wts`.
    pub fn latents(&self) -> &[Tensor] {
        &self.latents
    }

    /// The clean latent the trajectory was inverted from.
    pub fn clean_latent(&self) -> &Tensor {
        &self.latents[0]
    }

    /// Check the trajectory can drive an edit of `steps` steps from `t_start`.
    pub fn check_compatible(&self, steps: usize, t_start: usize) -> Result<()> {
        if self.num_steps() != steps {
            return Err(Error::InvalidParameter(format!(
                "trajectory covers {} steps but the scheduler is set to {steps}",
                self.num_steps()
            )));
        }
        if t_start == 0 || t_start > steps {
            return Err(Error::InvalidParameter(format!(
                "T_start must be in 1..={steps}, got {t_start}"
            )));
        }
        Ok(())
    }
}

/// Classifier-free guidance: `ε_u + s (ε_c - ε_u)`.
pub(crate) fn guide(uncond: &Tensor, cond: &Tensor, scale: f64) -> Result<Tensor> {
    let delta = (cond - uncond)?;
    Ok((uncond + delta.affine(scale, 0.0)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zeros() -> Tensor {
        Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn trajectory_shape_invariant() {
        assert!(Trajectory::new(vec![zeros(); 3], vec![zeros(); 4]).is_ok());
        assert!(Trajectory::new(vec![zeros(); 3], vec![zeros(); 3]).is_err());
    }

    #[test]
    fn compatibility_checks() {
        let trajectory = Trajectory::new(vec![zeros(); 5], vec![zeros(); 6]).unwrap();
        assert!(trajectory.check_compatible(5, 5).is_ok());
        assert!(trajectory.check_compatible(5, 1).is_ok());
        assert!(trajectory.check_compatible(5, 0).is_err());
        assert!(trajectory.check_compatible(5, 6).is_err());
        assert!(trajectory.check_compatible(6, 3).is_err());
    }

    #[test]
    fn guidance_blend() {
        let device = Device::Cpu;
        let uncond = Tensor::new(&[1.0_f32, 2.0], &device).unwrap();
        let cond = Tensor::new(&[2.0_f32, 0.0], &device).unwrap();
        let guided: Vec<f32> = guide(&uncond, &cond, 3.0).unwrap().to_vec1().unwrap();
        assert_eq!(guided, vec![4.0, -4.0]);
        let unguided: Vec<f32> = guide(&uncond, &cond, 1.0).unwrap().to_vec1().unwrap();
        assert_eq!(unguided, vec![2.0, 0.0]);
    }
}
