//! WAV decoding and encoding with hound.

use std::path::Path;

use crate::{Error, Result};

/// A decoded WAV file.
#[derive(Debug, Clone)]
pub struct WavClip {
    /// Interleaved samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavClip {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_s(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average the channels into one.
    pub fn into_mono(self) -> Vec<f32> {
        downmix(&self.samples, self.channels)
    }
}

/// Read a WAV file. Integer PCM of any depth is scaled into `[-1, 1]`.
pub fn read_wav(path: impl AsRef<Path>) -> Result<WavClip> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(Error::Audio(format!(
            "{}: invalid header ({} channels at {} Hz)",
            path.display(),
            spec.channels,
            spec.sample_rate
        )));
    }

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let full_scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(WavClip {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Write interleaved samples as 32-bit float WAV.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: num_channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    samples
        .iter()
        .try_for_each(|&sample| writer.write_sample(sample))?;
    writer.finalize()?;
    Ok(())
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], num_channels: u16) -> Vec<f32> {
    match num_channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect(),
    }
}
