//! Closed-form reference model with a Gaussian data prior.
//!
//! Latents are assumed distributed as `N(μ_c, s² I)`, where the per-band mean
//! `μ_c` is derived from the prompt (zero for the empty prompt). Under that
//! prior the optimal noise predictor is exact:
//! ```text
//! E[ε | x_t] = sqrt(1 - ᾱ_t) (x_t - sqrt(ᾱ_t) μ_c) / (ᾱ_t s² + 1 - ᾱ_t)
//! ```
//! The autoencoder is an affine map of the log-mel spectrogram and the vocoder
//! resynthesises each mel band as a sinusoid at its centre frequency. This is
//! enough to drive the whole editing pipeline deterministically without
//! pretrained weights.

use candle_core::{DType, Device, Tensor};
use sha2::{Digest, Sha256};

use super::{DiffusionModel, ModelProvider, PromptEmbedding};
use crate::audio::mel::{self, LOG_FLOOR, MelConfig};
use crate::config::ModelId;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Log-mel value mapped to latent zero.
const MEL_OFFSET: f64 = -5.0;
/// Latent units per log-mel unit.
const LATENT_SCALE: f64 = 0.25;
/// Peak magnitude of a prompt-derived band mean, in latent units.
const PROMPT_STRENGTH: f64 = 1.5;

/// Loads [`GaussianPriorModel`] for [`ModelId::GaussianPrior`].
pub struct GaussianPriorProvider;

impl ModelProvider for GaussianPriorProvider {
    fn load(
        &self,
        model_id: &ModelId,
        device: &Device,
        num_steps: usize,
    ) -> Result<Box<dyn DiffusionModel>> {
        if model_id != &ModelId::GaussianPrior {
            return Err(Error::ModelLoad {
                model: model_id.to_string(),
                reason: "the reference provider only serves reference/gaussian-prior".into(),
            });
        }
        tracing::debug!(num_steps, device = ?device, "loading reference model");
        Ok(Box::new(GaussianPriorModel::new(device.clone())))
    }
}

/// See the module docs.
pub struct GaussianPriorModel {
    model_id: ModelId,
    device: Device,
    mel_config: MelConfig,
    scheduler_config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    /// Prior standard deviation `s`.
    data_std: f64,
}

impl GaussianPriorModel {
    pub fn new(device: Device) -> Self {
        let scheduler_config = SchedulerConfig::default();
        Self {
            model_id: ModelId::GaussianPrior,
            device,
            mel_config: MelConfig::default(),
            alphas_cumprod: scheduler_config.alphas_cumprod(),
            scheduler_config,
            data_std: 1.0,
        }
    }

    /// Report a different identifier, for serving the model under another name.
    pub fn with_model_id(mut self, model_id: ModelId) -> Self {
        self.model_id = model_id;
        self
    }

    fn n_mels(&self) -> usize {
        self.mel_config.n_mels - self.mel_config.n_mels % 2
    }

    /// Per-band prior mean for a prompt, in `[-PROMPT_STRENGTH, PROMPT_STRENGTH]`.
    fn prompt_mean(&self, prompt: &str) -> Vec<f32> {
        let n_mels = self.n_mels();
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return vec![0.0; n_mels];
        }
        let digest = Sha256::digest(prompt.to_lowercase().as_bytes());
        (0..n_mels)
            .map(|band| {
                let byte = digest[band % digest.len()] as f64;
                (PROMPT_STRENGTH * (byte / 127.5 - 1.0)) as f32
            })
            .collect()
    }
}

impl DiffusionModel for GaussianPriorModel {
    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn mel_config(&self) -> MelConfig {
        self.mel_config.clone()
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        self.scheduler_config.clone()
    }

    fn encode_prompt(&self, prompt: &str) -> Result<PromptEmbedding> {
        let mean = self.prompt_mean(prompt);
        let n_mels = mean.len();
        let hidden_states = Tensor::from_vec(mean, (1, 1, 1, n_mels), &self.device)?;
        Ok(PromptEmbedding::new(hidden_states))
    }

    fn predict_noise(
        &self,
        latent: &Tensor,
        timestep: usize,
        prompt: &PromptEmbedding,
    ) -> Result<Tensor> {
        let alpha_prod = *self.alphas_cumprod.get(timestep).ok_or_else(|| {
            Error::InvalidParameter(format!("timestep {timestep} outside the training schedule"))
        })?;
        let variance = alpha_prod * self.data_std * self.data_std + 1.0 - alpha_prod;
        let mean = prompt.hidden_states.affine(alpha_prod.sqrt(), 0.0)?;
        let centred = latent.broadcast_sub(&mean)?;
        Ok(centred.affine((1.0 - alpha_prod).sqrt() / variance, 0.0)?)
    }

    fn encode(&self, mel: &Tensor) -> Result<Tensor> {
        Ok(mel.affine(LATENT_SCALE, -MEL_OFFSET * LATENT_SCALE)?)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        Ok(latent.affine(1.0 / LATENT_SCALE, MEL_OFFSET)?)
    }

    fn decode_to_waveform(&self, mel: &Tensor) -> Result<Tensor> {
        let (batch, _channels, frames, n_mels) = mel.dims4()?;
        let hop = self.mel_config.hop_length;
        let sample_rate = self.mel_config.sample_rate as f64;
        let centres = mel::mel_center_frequencies(&self.mel_config);
        // Hann-windowed STFT magnitude of a unit sine is about n_fft / 4.
        let gain = 4.0 / self.mel_config.n_fft as f64;

        let values = mel.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut waveform = Vec::with_capacity(batch * frames * hop);

        for b in 0..batch {
            let mut phases = vec![0.0_f64; n_mels];
            for frame in 0..frames {
                let row = &values[(b * frames + frame) * n_mels..][..n_mels];
                let amplitudes: Vec<f64> = row
                    .iter()
                    .map(|&v| {
                        let magnitude = (v as f64).exp();
                        if magnitude <= LOG_FLOOR * 1.01 {
                            0.0
                        } else {
                            magnitude * gain
                        }
                    })
                    .collect();
                for _ in 0..hop {
                    let mut sample = 0.0;
                    for band in 0..n_mels {
                        sample += amplitudes[band] * phases[band].sin();
                        phases[band] = (phases[band]
                            + 2.0 * std::f64::consts::PI * centres[band] / sample_rate)
                            % (2.0 * std::f64::consts::PI);
                    }
                    waveform.push(sample.clamp(-1.0, 1.0) as f32);
                }
            }
        }

        Ok(Tensor::from_vec(waveform, (batch, frames * hop), &self.device)?)
    }
}
