//! Input loading: file → normalized log-mel tensor ready for the encoder.

use std::io::BufReader;
use std::path::Path;

use candle_core::{Device, Tensor};
use sha2::{Digest, Sha256};

use super::mel::{MelConfig, MelSpectrogram};
use super::{resample, wav};
use crate::config::EditDefaults;
use crate::{Error, Result};

/// An input clip prepared for the autoencoder.
#[derive(Debug, Clone)]
pub struct LoadedAudio {
    /// Log-mel spectrogram `[1, 1, frames, n_mels]`.
    pub mel: Tensor,
    /// SHA-256 of the input file bytes, hex encoded.
    pub fingerprint: String,
    /// Duration actually used (after the cap), in seconds.
    pub duration_s: f64,
}

impl LoadedAudio {
    pub fn num_frames(&self) -> Result<usize> {
        Ok(self.mel.dim(2)?)
    }
}

/// SHA-256 of a file's contents.
pub fn fingerprint(path: impl AsRef<Path>) -> Result<String> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Load a WAV file as a log-mel tensor.
///
/// The clip is downmixed, capped at 30 s, resampled to the mel rate,
/// DC-centred and scaled to a 0.5 peak, then cut to
/// `duration · frames_per_second` frames. An odd mel-bin count drops its top
/// bin.
pub fn load_audio(path: impl AsRef<Path>, config: &MelConfig, device: &Device) -> Result<LoadedAudio> {
    let path = path.as_ref();
    let fingerprint = fingerprint(path)?;
    let clip = wav::read_wav(path)?;
    let (sample_rate, channels) = (clip.sample_rate, clip.channels);
    let mono = clip.into_mono();
    let capped = cap_duration(&mono, sample_rate, EditDefaults::MAX_DURATION_S);
    let mut waveform = resample::resample(capped, sample_rate, config.sample_rate)?;

    let duration_s = (waveform.len() as f64 / config.sample_rate as f64)
        .min(EditDefaults::MAX_DURATION_S);
    let target_frames = (duration_s * config.frames_per_second()).floor() as usize;
    if target_frames == 0 {
        return Err(Error::Audio(format!(
            "{} is too short to edit ({duration_s:.3}s)",
            path.display()
        )));
    }

    normalize_waveform(&mut waveform);
    waveform.resize(target_frames * config.hop_length, 0.0);

    let mel = MelSpectrogram::new(config.clone());
    let mut frames = mel.process(&waveform);
    frames.truncate(target_frames);

    let n_mels = config.n_mels - config.n_mels % 2;
    let flat: Vec<f32> = frames
        .iter()
        .flat_map(|frame| frame[..n_mels].iter().map(|&v| v as f32))
        .collect();
    let mel = Tensor::from_vec(flat, (1, 1, target_frames, n_mels), device)?;

    tracing::debug!(
        path = %path.display(),
        sample_rate,
        channels,
        duration_s,
        frames = target_frames,
        "loaded input audio"
    );

    Ok(LoadedAudio {
        mel,
        fingerprint,
        duration_s,
    })
}

/// The first `max_s` seconds of `samples`.
fn cap_duration(samples: &[f32], sample_rate: u32, max_s: f64) -> &[f32] {
    let max_len = (max_s * sample_rate as f64).ceil() as usize;
    &samples[..samples.len().min(max_len)]
}

/// Remove DC and scale to a peak of 0.5.
fn normalize_waveform(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let mut peak = 0.0_f32;
    for s in samples.iter_mut() {
        *s -= mean;
        peak = peak.max(s.abs());
    }
    let scale = 0.5 / (peak + 1e-8);
    for s in samples.iter_mut() {
        *s *= scale;
    }
}
