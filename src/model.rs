//! The seam to pretrained text-conditioned latent audio diffusion models.
//!
//! The editing loop only needs five things from a model: a prompt encoder, a
//! noise-prediction network, a latent autoencoder (mel ↔ latent), and a
//! vocoder (mel → waveform). [`DiffusionModel`] captures exactly those;
//! [`ModelProvider`] loads one for a given [`ModelId`].
//!
//! - [`reference`]: closed-form Gaussian-prior model, no weights needed

pub mod reference;

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::audio::mel::MelConfig;
use crate::config::ModelId;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Encoded text condition.
///
/// Models with several text encoders pack their outputs here; the editing
/// loop never looks inside.
#[derive(Debug, Clone)]
pub struct PromptEmbedding {
    pub hidden_states: Tensor,
    pub attention_mask: Option<Tensor>,
    /// Secondary embedding (pooled or generated), when the model has one.
    pub extra: Option<Tensor>,
}

impl PromptEmbedding {
    pub fn new(hidden_states: Tensor) -> Self {
        Self {
            hidden_states,
            attention_mask: None,
            extra: None,
        }
    }
}

/// A loaded pretrained latent diffusion model.
pub trait DiffusionModel: Send {
    fn model_id(&self) -> &ModelId;

    fn device(&self) -> &Device;

    /// STFT settings the autoencoder was trained on.
    fn mel_config(&self) -> MelConfig;

    /// Noise schedule the network was trained with.
    fn scheduler_config(&self) -> SchedulerConfig;

    /// Encode a prompt. The empty string is the unconditional embedding.
    fn encode_prompt(&self, prompt: &str) -> Result<PromptEmbedding>;

    /// Predict the noise in `latent` at `timestep`.
    fn predict_noise(
        &self,
        latent: &Tensor,
        timestep: usize,
        prompt: &PromptEmbedding,
    ) -> Result<Tensor>;

    /// Log-mel `[1, 1, T, F]` → latent.
    fn encode(&self, mel: &Tensor) -> Result<Tensor>;

    /// Latent → log-mel `[1, 1, T, F]`.
    fn decode(&self, latent: &Tensor) -> Result<Tensor>;

    /// Log-mel `[B, 1, T, F]` → waveform `[B, samples]` at the decoder rate.
    fn decode_to_waveform(&self, mel: &Tensor) -> Result<Tensor>;
}

/// Loads models by identifier.
pub trait ModelProvider: Send + Sync {
    fn load(
        &self,
        model_id: &ModelId,
        device: &Device,
        num_steps: usize,
    ) -> Result<Box<dyn DiffusionModel>>;
}

/// Maps model identifiers to the provider that can load them.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    providers: HashMap<ModelId, Arc<dyn ModelProvider>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in reference model.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ModelId::GaussianPrior, Arc::new(reference::GaussianPriorProvider));
        registry
    }

    pub fn register(&mut self, model_id: ModelId, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(model_id, provider);
    }

    pub fn contains(&self, model_id: &ModelId) -> bool {
        self.providers.contains_key(model_id)
    }

    /// Fail with [`Error::ModelLoad`] unless `model_id` has a backend.
    pub fn check(&self, model_id: &ModelId) -> Result<()> {
        if self.contains(model_id) {
            Ok(())
        } else {
            Err(self.unregistered(model_id))
        }
    }

    fn unregistered(&self, model_id: &ModelId) -> Error {
        let registered: Vec<&str> = self.model_ids().into_iter().map(ModelId::as_str).collect();
        Error::ModelLoad {
            model: model_id.to_string(),
            reason: format!(
                "no backend registered for this checkpoint (available: {})",
                registered.join(", ")
            ),
        }
    }

    /// Registered identifiers, sorted.
    pub fn model_ids(&self) -> Vec<&ModelId> {
        let mut ids: Vec<_> = self.providers.keys().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

impl ModelProvider for ModelRegistry {
    fn load(
        &self,
        model_id: &ModelId,
        device: &Device,
        num_steps: usize,
    ) -> Result<Box<dyn DiffusionModel>> {
        let provider = self
            .providers
            .get(model_id)
            .ok_or_else(|| self.unregistered(model_id))?;
        provider.load(model_id, device, num_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_loads_reference_model() {
        let registry = ModelRegistry::with_builtin();
        assert!(registry.contains(&ModelId::GaussianPrior));
        let model = registry
            .load(&ModelId::GaussianPrior, &Device::Cpu, 50)
            .unwrap();
        assert_eq!(model.model_id(), &ModelId::GaussianPrior);
    }

    #[test]
    fn check_names_the_registered_models() {
        let registry = ModelRegistry::with_builtin();
        assert!(registry.check(&ModelId::default()).is_ok());
        match registry.check(&ModelId::AudioLdm2Large) {
            Err(Error::ModelLoad { model, reason }) => {
                assert_eq!(model, "cvssp/audioldm2-large");
                assert!(reason.contains("reference/gaussian-prior"), "{reason}");
            }
            other => panic!("expected ModelLoad, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_model_is_a_load_error() {
        let registry = ModelRegistry::with_builtin();
        let result = registry.load(&ModelId::AudioLdm2Music, &Device::Cpu, 200);
        match result {
            Err(Error::ModelLoad { model, .. }) => assert_eq!(model, "cvssp/audioldm2-music"),
            Err(other) => panic!("expected ModelLoad, got {other}"),
            Ok(_) => panic!("expected ModelLoad, got a model"),
        }
    }
}
