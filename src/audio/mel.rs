//! Log-mel spectrogram via STFT + mel filterbank.
//!
//! Matches the Tacotron-style STFT the AudioLDM autoencoders were trained on:
//! - Sample rate: 16000 Hz
//! - FFT size: 1024 (giving 513 frequency bins)
//! - Window: periodic Hann, length 1024
//! - Hop length: 160 (100 frames per second)
//! - Mel bins: 64, range 0–8000 Hz
//! - Mel scale/norm: Slaney
//! - Padding: centered reflect, `n_fft / 2` on each side
//! - Log compression: `ln(clamp(magnitude_mel, min=1e-5))`

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Configuration for the mel spectrogram. Defaults match AudioLDM2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 1024,
            win_length: 1024,
            hop_length: 160,
            n_mels: 64,
            f_min: 0.0,
            f_max: 8000.0,
        }
    }
}

impl MelConfig {
    /// Spectrogram frames per second of audio.
    pub fn frames_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length as f64
    }
}

/// Floor applied before the log.
pub const LOG_FLOOR: f64 = 1e-5;

/// Mel spectrogram processor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on construction.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let window = hann_window(config.win_length, config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Compute a log-mel spectrogram from mono samples at the configured rate.
    ///
    /// Output is frame-major: `[num_frames][n_mels]`, with
    /// `num_frames = samples.len() / hop_length + 1`.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f64>> {
        let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();

        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples_f64, pad, pad);

        self.stft(&padded)
            .iter()
            .map(|frame_magnitudes| {
                self.filterbank
                    .iter()
                    .map(|filter| {
                        let sum: f64 = filter
                            .iter()
                            .zip(frame_magnitudes)
                            .filter(|(weight, _)| **weight > 0.0)
                            .map(|(weight, magnitude)| weight * magnitude)
                            .sum();
                        sum.max(LOG_FLOOR).ln()
                    })
                    .collect()
            })
            .collect()
    }

    /// Short-time Fourier transform. Returns magnitude spectra per frame.
    ///
    /// Each inner vec has `n_fft/2 + 1` elements (one-sided).
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;

        if padded.len() < n_fft {
            return Vec::new();
        }
        let num_frames = (padded.len() - n_fft) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;

            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();

            self.fft.process(&mut buffer);

            let magnitudes: Vec<f64> = buffer[..num_bins].iter().map(|c| c.norm()).collect();
            frames.push(magnitudes);
        }

        frames
    }
}

/// Centre frequency (Hz) of each mel band.
pub fn mel_center_frequencies(config: &MelConfig) -> Vec<f64> {
    mel_edges_hz(config.n_mels, config.f_min, config.f_max)[1..=config.n_mels].to_vec()
}

/// Periodic Hann window of `win_length`, zero-padded to `n_fft` and centred.
fn hann_window(win_length: usize, n_fft: usize) -> Vec<f64> {
    let mut window = vec![0.0; n_fft];
    let offset = (n_fft - win_length.min(n_fft)) / 2;
    for i in 0..win_length.min(n_fft) {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = 0.5 * (1.0 - phase.cos());
    }
    window
}

/// Reflect-pad a signal on both sides.
///
/// Signals shorter than the pad are reflected repeatedly (index folding).
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    if len == 0 {
        return vec![0.0; pad_left + pad_right];
    }
    if len == 1 {
        return vec![signal[0]; pad_left + 1 + pad_right];
    }

    let period = 2 * (len - 1);
    let fold = |i: isize| -> f64 {
        let m = i.rem_euclid(period as isize) as usize;
        signal[if m < len { m } else { period - m }]
    };

    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    padded.extend((0..pad_left).map(|k| fold(k as isize - pad_left as isize)));
    padded.extend_from_slice(signal);
    padded.extend((0..pad_right).map(|k| fold((len + k) as isize)));
    padded
}

/// `n_mels + 2` band edges in Hz, equally spaced on the Slaney mel scale.
fn mel_edges_hz(n_mels: usize, f_min: f64, f_max: f64) -> Vec<f64> {
    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);
    (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .map(mel_to_hz_slaney)
        .collect()
}

/// Build a Slaney-normalized mel filterbank.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let hz_points = mel_edges_hz(n_mels, f_min, f_max);

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let f_left = hz_points[i];
            let f_center = hz_points[i + 1];
            let f_right = hz_points[i + 2];

            // Slaney normalization: 2 / (f_right - f_left)
            let norm = 2.0 / (f_right - f_left);

            bin_freqs
                .iter()
                .map(|&f| {
                    if f < f_left || f > f_right {
                        0.0
                    } else if f <= f_center {
                        norm * (f - f_left) / (f_center - f_left)
                    } else {
                        norm * (f_right - f) / (f_right - f_center)
                    }
                })
                .collect()
        })
        .collect()
}

/// Convert frequency in Hz to Slaney mel scale.
///
/// Below 1000 Hz: linear mapping (mel = 3 * f / 200).
/// Above 1000 Hz: logarithmic (mel = 15 + 27 * ln(f / 1000) / ln(6.4)).
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}
