//! End-to-end editing with the built-in reference model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use audio_ddpm_edit::audio::mel::MelConfig;
use audio_ddpm_edit::audio::{load_audio, write_audio, write_wav};
use audio_ddpm_edit::config::ModelId;
use audio_ddpm_edit::inversion::{InversionParams, SamplingParams, invert, sample};
use audio_ddpm_edit::model::reference::GaussianPriorModel;
use audio_ddpm_edit::model::{DiffusionModel, ModelProvider, ModelRegistry, PromptEmbedding};
use audio_ddpm_edit::pipeline::{EditPipeline, EditRequest, EditSession, EditedAudio};
use audio_ddpm_edit::scheduler::{DdpmScheduler, SchedulerConfig};
use audio_ddpm_edit::{Error, Result, Stage};
use candle_core::{Device, Tensor};

const TWIN: &str = "test/gaussian-twin";
const FLAKY: &str = "test/flaky";

/// Serves the reference model under another name.
struct TwinProvider;

impl ModelProvider for TwinProvider {
    fn load(&self, model_id: &ModelId, device: &Device, _steps: usize) -> Result<Box<dyn DiffusionModel>> {
        Ok(Box::new(
            GaussianPriorModel::new(device.clone()).with_model_id(model_id.clone()),
        ))
    }
}

/// Reference model whose noise prediction fails below timestep 500.
struct FlakyModel(GaussianPriorModel);

impl DiffusionModel for FlakyModel {
    fn model_id(&self) -> &ModelId {
        self.0.model_id()
    }
    fn device(&self) -> &Device {
        self.0.device()
    }
    fn mel_config(&self) -> MelConfig {
        self.0.mel_config()
    }
    fn scheduler_config(&self) -> SchedulerConfig {
        self.0.scheduler_config()
    }
    fn encode_prompt(&self, prompt: &str) -> Result<PromptEmbedding> {
        self.0.encode_prompt(prompt)
    }
    fn predict_noise(&self, latent: &Tensor, timestep: usize, prompt: &PromptEmbedding) -> Result<Tensor> {
        if timestep < 500 {
            return Err(Error::InvalidParameter("simulated network failure".into()));
        }
        self.0.predict_noise(latent, timestep, prompt)
    }
    fn encode(&self, mel: &Tensor) -> Result<Tensor> {
        self.0.encode(mel)
    }
    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        self.0.decode(latent)
    }
    fn decode_to_waveform(&self, mel: &Tensor) -> Result<Tensor> {
        self.0.decode_to_waveform(mel)
    }
}

struct FlakyProvider;

impl ModelProvider for FlakyProvider {
    fn load(&self, model_id: &ModelId, device: &Device, _steps: usize) -> Result<Box<dyn DiffusionModel>> {
        let inner = GaussianPriorModel::new(device.clone()).with_model_id(model_id.clone());
        Ok(Box::new(FlakyModel(inner)))
    }
}

fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::with_builtin();
    registry.register(ModelId::Custom(TWIN.into()), Arc::new(TwinProvider));
    registry.register(ModelId::Custom(FLAKY.into()), Arc::new(FlakyProvider));
    registry
}

/// A chord with a slow tremolo, so the spectrogram is not flat.
fn write_clip(path: &Path, seconds: f32, sample_rate: u32, channels: u16) {
    let n = (seconds * sample_rate as f32) as usize;
    let samples: Vec<f32> = (0..n)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let tremolo = 0.6 + 0.4 * (2.0 * std::f32::consts::PI * 2.0 * t).sin();
            let v = tremolo
                * (0.4 * (2.0 * std::f32::consts::PI * 261.6 * t).sin()
                    + 0.3 * (2.0 * std::f32::consts::PI * 329.6 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 392.0 * t).sin());
            std::iter::repeat_n(v, channels as usize)
        })
        .collect();
    write_wav(path, &samples, sample_rate, channels).unwrap();
}

fn clip(dir: &Path) -> PathBuf {
    let path = dir.join("clip.wav");
    write_clip(&path, 1.0, 16000, 1);
    path
}

fn request(input: &Path, target: &str) -> EditRequest {
    EditRequest {
        model_id: ModelId::GaussianPrior,
        steps: 40,
        t_start: 24,
        ..EditRequest::new(input, target)
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn edit_produces_16k_mono_wav_of_input_length() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("stereo.wav");
    write_clip(&input, 2.0, 44100, 2);

    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();
    let request = EditRequest {
        model_id: ModelId::GaussianPrior,
        source_prompt: String::new(),
        steps: 150,
        t_start: 90,
        cfg_scale_src: 3.0,
        cfg_scale_tar: 12.0,
        seed: 0,
        ..EditRequest::new(&input, "A dog barking")
    };
    let audio = pipeline.edit(&mut session, &request).unwrap();
    assert!(audio.inverted);
    assert_eq!(audio.seed, 0);
    assert_eq!(audio.sample_rate, 16000);

    let output = dir.path().join("edited.wav");
    write_audio(&output, &audio.samples, audio.sample_rate, EditedAudio::CHANNELS).unwrap();

    let reader = hound::WavReader::open(&output).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.channels, 1);
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    assert!(!samples.is_empty());
    assert!(samples.iter().any(|s| s.abs() > 1e-4), "output is silent");

    let hop = MelConfig::default().hop_length as i64;
    let expected = 2 * 16000_i64;
    assert!(
        (samples.len() as i64 - expected).abs() <= hop,
        "got {} samples, expected {expected} ± {hop}",
        samples.len()
    );
}

#[test]
fn default_request_edits_with_builtin_registry() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());

    let mut pipeline = EditPipeline::new(ModelRegistry::with_builtin(), Device::Cpu);
    let mut session = EditSession::new();
    let audio = pipeline
        .edit(&mut session, &EditRequest::new(&input, "A dog barking"))
        .unwrap();

    assert!(audio.inverted);
    assert_eq!(audio.sample_rate, 16000);
    assert!(!audio.samples.is_empty());
    assert_eq!(pipeline.loaded_model(), Some(&ModelId::default()));
}

#[test]
fn same_inputs_same_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);

    let a = pipeline
        .edit(&mut EditSession::new(), &request(&input, "A dog barking"))
        .unwrap();
    let b = pipeline
        .edit(&mut EditSession::new(), &request(&input, "A dog barking"))
        .unwrap();
    assert_eq!(a.samples.len(), b.samples.len());
    let max_diff = a
        .samples
        .iter()
        .zip(&b.samples)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0_f32, f32::max);
    assert!(max_diff < 1e-5, "outputs differ by {max_diff}");
}

#[test]
fn inversion_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let model = GaussianPriorModel::new(Device::Cpu);
    let loaded = load_audio(&input, &model.mel_config(), &Device::Cpu).unwrap();
    let w0 = model.encode(&loaded.mel).unwrap();

    let mut scheduler = DdpmScheduler::new(model.scheduler_config()).unwrap();
    scheduler.set_timesteps(30).unwrap();
    let params = InversionParams {
        source_prompt: "a chord".into(),
        seed: 11,
        ..Default::default()
    };
    let first = invert(&model, &scheduler, &w0, &params).unwrap();
    let second = invert(&model, &scheduler, &w0, &params).unwrap();
    for (a, b) in first.noise().iter().zip(second.noise()) {
        assert!(max_abs_diff(a, b) < 1e-5);
    }
    for (a, b) in first.latents().iter().zip(second.latents()) {
        assert!(max_abs_diff(a, b) < 1e-5);
    }
}

#[test]
fn full_replay_with_source_prompt_reconstructs_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let model = GaussianPriorModel::new(Device::Cpu);
    let loaded = load_audio(&input, &model.mel_config(), &Device::Cpu).unwrap();
    let w0 = model.encode(&loaded.mel).unwrap();

    let mut scheduler = DdpmScheduler::new(model.scheduler_config()).unwrap();
    scheduler.set_timesteps(60).unwrap();
    let prompt = "a major chord with tremolo";
    let inversion = InversionParams {
        source_prompt: prompt.into(),
        cfg_scale: 3.0,
        ..Default::default()
    };
    let trajectory = invert(&model, &scheduler, &w0, &inversion).unwrap();
    let replay = SamplingParams {
        target_prompt: prompt.into(),
        negative_prompt: String::new(),
        cfg_scale: 3.0,
        eta: 1.0,
        t_start: 60,
    };
    let rebuilt = sample(&model, &scheduler, &trajectory, &replay).unwrap();
    let err = max_abs_diff(&rebuilt, &w0);
    assert!(err < 1e-3, "reconstruction error {err}");

    let mel = model.decode(&rebuilt).unwrap();
    assert!(max_abs_diff(&mel, &loaded.mel) < 1e-2);
}

#[test]
fn target_only_change_reuses_cached_trajectory() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();

    let first = pipeline.edit(&mut session, &request(&input, "A dog barking")).unwrap();
    assert!(first.inverted);
    let cached = session.cached().unwrap().trajectory.clone();

    let second_request = EditRequest {
        cfg_scale_tar: 6.0,
        t_start: 30,
        ..request(&input, "Rain on a tin roof")
    };
    let second = pipeline.edit(&mut session, &second_request).unwrap();
    assert!(!second.inverted);
    assert!(Arc::ptr_eq(&cached, &session.cached().unwrap().trajectory));
    assert_ne!(first.samples, second.samples);
}

#[test]
fn source_prompt_change_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();

    pipeline.edit(&mut session, &request(&input, "A dog barking")).unwrap();
    let cached = session.cached().unwrap().trajectory.clone();

    let changed = EditRequest {
        source_prompt: "a chord".into(),
        ..request(&input, "A dog barking")
    };
    assert!(pipeline.edit(&mut session, &changed).unwrap().inverted);
    assert!(!Arc::ptr_eq(&cached, &session.cached().unwrap().trajectory));
}

#[test]
fn model_change_forces_recompute_without_redo() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();

    pipeline.edit(&mut session, &request(&input, "A dog barking")).unwrap();
    let cached = session.cached().unwrap().trajectory.clone();

    let swapped = EditRequest {
        model_id: ModelId::Custom(TWIN.into()),
        redo_inversion: false,
        ..request(&input, "A dog barking")
    };
    let audio = pipeline.edit(&mut session, &swapped).unwrap();
    assert!(audio.inverted);
    assert_eq!(pipeline.loaded_model(), Some(&ModelId::Custom(TWIN.into())));
    assert!(!Arc::ptr_eq(&cached, &session.cached().unwrap().trajectory));
    assert_eq!(session.cached().unwrap().key.model_id, ModelId::Custom(TWIN.into()));
}

#[test]
fn randomized_seed_recomputes_and_reports_seed() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();

    pipeline.edit(&mut session, &request(&input, "A dog barking")).unwrap();
    let randomized = EditRequest {
        randomize_seed: true,
        ..request(&input, "A dog barking")
    };
    let audio = pipeline.edit(&mut session, &randomized).unwrap();
    assert!(audio.inverted);
    assert!(audio.seed <= i32::MAX as u64);
    assert_eq!(session.cached().unwrap().key.seed, audio.seed);
}

#[test]
fn failed_inversion_keeps_previous_cache() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let mut session = EditSession::new();

    pipeline.edit(&mut session, &request(&input, "A dog barking")).unwrap();
    let cached = session.cached().unwrap().trajectory.clone();

    let flaky = EditRequest {
        model_id: ModelId::Custom(FLAKY.into()),
        steps: 20,
        t_start: 10,
        redo_inversion: true,
        ..request(&input, "A dog barking")
    };
    match pipeline.edit(&mut session, &flaky) {
        Err(Error::Diffusion { stage, step, .. }) => {
            assert_eq!(stage, Stage::Inversion);
            // Timesteps run 951, 901, …; 451 is the first one below 500.
            assert_eq!(step, 10);
        }
        Err(other) => panic!("expected a diffusion error, got {other}"),
        Ok(_) => panic!("expected a diffusion error"),
    }
    assert!(Arc::ptr_eq(&cached, &session.cached().unwrap().trajectory));
    assert_eq!(session.cached().unwrap().key.model_id, ModelId::GaussianPrior);
}

#[test]
fn unknown_checkpoint_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = clip(dir.path());
    let mut pipeline = EditPipeline::new(registry(), Device::Cpu);
    let request = EditRequest {
        model_id: ModelId::AudioLdm2Large,
        ..request(&input, "A dog barking")
    };
    assert!(matches!(
        pipeline.edit(&mut EditSession::new(), &request),
        Err(Error::ModelLoad { .. })
    ));
}
