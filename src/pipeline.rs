//! End-to-end edit pipeline.
//!
//! One call to [`EditPipeline::edit`]:
//! 1. Validate the request and resolve the seed
//! 2. Make sure the requested model is the loaded one (swap if not)
//! 3. Load the input clip as a log-mel spectrogram and encode it
//! 4. Invert it, or reuse the session's cached trajectory
//! 5. Replay the last `T_start` steps under the target prompt
//! 6. Decode latent → mel → waveform

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device};
use rand::Rng;

use crate::audio::load_audio;
use crate::cache::{CachedInversion, InversionDecision, InversionKey, decide};
use crate::config::{EditDefaults, ModelId};
use crate::inversion::{InversionParams, SamplingParams, Trajectory, invert, sample};
use crate::model::{DiffusionModel, ModelProvider, ModelRegistry};
use crate::scheduler::DdpmScheduler;
use crate::{Error, Result};

/// Parameters for one edit.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// Input audio file (WAV).
    pub input: PathBuf,
    pub model_id: ModelId,
    /// Description of the input. Empty = unconditional inversion.
    pub source_prompt: String,
    /// Description of the desired result.
    pub target_prompt: String,
    pub steps: usize,
    pub cfg_scale_src: f64,
    pub cfg_scale_tar: f64,
    /// Reverse steps to run. Higher = stronger edit, less faithful to the input.
    pub t_start: usize,
    pub seed: u64,
    /// Draw a fresh seed, which also forces a new inversion.
    pub randomize_seed: bool,
    /// Recompute the inversion even if the cache looks valid.
    pub redo_inversion: bool,
}

impl EditRequest {
    /// A request with default settings for `input`.
    pub fn new(input: impl Into<PathBuf>, target_prompt: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            model_id: ModelId::default(),
            source_prompt: String::new(),
            target_prompt: target_prompt.into(),
            steps: EditDefaults::STEPS,
            cfg_scale_src: EditDefaults::CFG_SCALE_SRC,
            cfg_scale_tar: EditDefaults::CFG_SCALE_TAR,
            t_start: EditDefaults::T_START,
            seed: EditDefaults::SEED,
            randomize_seed: false,
            redo_inversion: false,
        }
    }

    /// Reject out-of-range parameters before any model work.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(Error::InvalidParameter("no input audio given".into()));
        }
        if !(EditDefaults::MIN_STEPS..=EditDefaults::MAX_STEPS).contains(&self.steps) {
            return Err(Error::InvalidParameter(format!(
                "steps must be in {}..={}, got {}",
                EditDefaults::MIN_STEPS,
                EditDefaults::MAX_STEPS,
                self.steps
            )));
        }
        for (name, scale) in [
            ("cfg_scale_src", self.cfg_scale_src),
            ("cfg_scale_tar", self.cfg_scale_tar),
        ] {
            if !(EditDefaults::MIN_CFG_SCALE..=EditDefaults::MAX_CFG_SCALE).contains(&scale) {
                return Err(Error::InvalidParameter(format!(
                    "{name} must be in {}..={}, got {scale}",
                    EditDefaults::MIN_CFG_SCALE,
                    EditDefaults::MAX_CFG_SCALE
                )));
            }
        }
        if self.t_start == 0 || self.t_start > self.steps {
            return Err(Error::InvalidParameter(format!(
                "t_start must be in 1..={}, got {}",
                self.steps, self.t_start
            )));
        }
        Ok(())
    }
}

/// Result of a successful edit.
#[derive(Debug, Clone)]
pub struct EditedAudio {
    /// Mono samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Seed the trajectory in use was inverted with.
    pub seed: u64,
    /// Whether this edit ran a fresh inversion.
    pub inverted: bool,
    pub duration_s: f64,
}

impl EditedAudio {
    pub const CHANNELS: u16 = 1;
}

/// Draw a fresh seed in `0..=i32::MAX` when `randomize` is set.
pub fn resolve_seed(seed: u64, randomize: bool) -> u64 {
    if randomize {
        rand::thread_rng().gen_range(0..=i32::MAX as u64)
    } else {
        seed
    }
}

/// Per-session state: the cached inversion and a staleness flag.
#[derive(Debug, Default)]
pub struct EditSession {
    cache: Option<CachedInversion>,
    stale: bool,
}

impl EditSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> Option<&CachedInversion> {
        self.cache.as_ref()
    }

    /// Force the next edit to re-invert. The cached trajectory stays until
    /// a new one replaces it.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// The single loaded model. Swapping needs `&mut`, so nothing can observe a
/// half-swapped slot.
#[derive(Default)]
pub struct ModelSlot {
    /// Requested id and the model the provider returned for it.
    loaded: Option<(ModelId, Box<dyn DiffusionModel>)>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded_id(&self) -> Option<&ModelId> {
        self.loaded.as_ref().map(|(model_id, _)| model_id)
    }

    /// Return the model for `model_id`, dropping and replacing the loaded one
    /// if it differs. A failed load leaves the slot empty.
    pub fn ensure_loaded(
        &mut self,
        provider: &dyn ModelProvider,
        model_id: &ModelId,
        device: &Device,
        num_steps: usize,
    ) -> Result<&dyn DiffusionModel> {
        if self.loaded_id() != Some(model_id) {
            if let Some((previous, _)) = self.loaded.take() {
                tracing::info!(from = %previous, to = %model_id, "swapping model");
            }
            let start = Instant::now();
            let model = provider.load(model_id, device, num_steps)?;
            tracing::info!(
                model = %model_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "model loaded"
            );
            self.loaded = Some((model_id.clone(), model));
        }
        self.loaded
            .as_ref()
            .map(|(_, model)| &**model)
            .ok_or_else(|| Error::Manager("model slot is empty after load".into()))
    }

    /// Drop the loaded model. Returns whether one was loaded.
    pub fn unload(&mut self) -> bool {
        match self.loaded.take() {
            Some((model_id, _)) => {
                tracing::info!(model = %model_id, "model unloaded");
                true
            }
            None => false,
        }
    }
}

/// Editing pipeline bound to a model provider and a device.
pub struct EditPipeline<P = ModelRegistry> {
    provider: P,
    device: Device,
    slot: ModelSlot,
}

impl<P: ModelProvider> EditPipeline<P> {
    pub fn new(provider: P, device: Device) -> Self {
        Self {
            provider,
            device,
            slot: ModelSlot::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn loaded_model(&self) -> Option<&ModelId> {
        self.slot.loaded_id()
    }

    pub fn unload(&mut self) -> bool {
        self.slot.unload()
    }

    /// Switch devices. The loaded model is dropped and reloads on next use.
    pub fn move_to(&mut self, device: Device) {
        self.slot.unload();
        self.device = device;
    }

    /// Run one edit, reusing or refreshing `session`'s cached inversion.
    ///
    /// On any failure `session` keeps its previous cache.
    pub fn edit(&mut self, session: &mut EditSession, request: &EditRequest) -> Result<EditedAudio> {
        request.validate()?;
        let start = Instant::now();
        let seed = resolve_seed(request.seed, request.randomize_seed);

        let model = self.slot.ensure_loaded(
            &self.provider,
            &request.model_id,
            &self.device,
            request.steps,
        )?;

        let mut scheduler = DdpmScheduler::new(model.scheduler_config())?;
        scheduler.set_timesteps(request.steps)?;

        let audio = load_audio(&request.input, &model.mel_config(), model.device())?;

        let key = InversionKey::new(
            request.model_id.clone(),
            audio.fingerprint.clone(),
            request.source_prompt.clone(),
            request.steps,
            request.cfg_scale_src,
            seed,
        );
        let decision = decide(
            session.cache.as_ref().map(|cached| &cached.key),
            &key,
            request.redo_inversion || session.stale,
            request.randomize_seed,
        );

        let reusable = match (decision, &session.cache) {
            (InversionDecision::Reuse, Some(cached)) => Some((cached.trajectory.clone(), cached.key.seed)),
            _ => None,
        };
        let (trajectory, seed, inverted): (Arc<Trajectory>, u64, bool) = match reusable {
            Some((trajectory, cached_seed)) => {
                tracing::debug!(seed = cached_seed, "reusing cached inversion");
                (trajectory, cached_seed, false)
            }
            None => {
                if let InversionDecision::Recompute(reason) = decision {
                    tracing::info!(%reason, seed, steps = request.steps, "inverting source");
                }
                let w0 = model.encode(&audio.mel)?;
                let params = InversionParams {
                    source_prompt: request.source_prompt.clone(),
                    cfg_scale: request.cfg_scale_src,
                    seed,
                    ..Default::default()
                };
                let trajectory = Arc::new(invert(model, &scheduler, &w0, &params)?);
                session.cache = Some(CachedInversion {
                    key,
                    trajectory: trajectory.clone(),
                });
                session.stale = false;
                (trajectory, seed, true)
            }
        };

        let params = SamplingParams {
            target_prompt: request.target_prompt.clone(),
            cfg_scale: request.cfg_scale_tar,
            t_start: request.t_start,
            ..Default::default()
        };
        let latent = sample(model, &scheduler, &trajectory, &params)?;

        let mut mel = model.decode(&latent)?;
        if mel.rank() < 4 {
            mel = mel.unsqueeze(0)?;
        }
        let waveform = model.decode_to_waveform(&mel)?;
        let samples = waveform.get(0)?.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let sample_rate = model.mel_config().sample_rate;
        let duration_s = samples.len() as f64 / sample_rate as f64;

        tracing::info!(
            model = %request.model_id,
            t_start = request.t_start,
            inverted,
            duration_s,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "edit done"
        );

        Ok(EditedAudio {
            samples,
            sample_rate,
            seed,
            inverted,
            duration_s,
        })
    }
}
