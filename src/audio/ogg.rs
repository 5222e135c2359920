//! OGG/Vorbis audio encoding.

use std::num::{NonZeroU8, NonZeroU32};
use std::path::Path;

use crate::{Error, Result};

/// Write interleaved f32 samples as an OGG/Vorbis file.
pub fn write_ogg(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let rate = NonZeroU32::new(sample_rate)
        .ok_or_else(|| Error::Audio("vorbis: sample rate must be positive".into()))?;
    let channel_count = u8::try_from(num_channels)
        .ok()
        .and_then(NonZeroU8::new)
        .ok_or_else(|| Error::Audio(format!("vorbis: unsupported channel count {num_channels}")))?;

    let file = std::fs::File::create(path.as_ref())?;

    let mut encoder = vorbis_rs::VorbisEncoderBuilder::new(rate, channel_count, file)
        .map_err(|e| Error::Audio(format!("vorbis init: {e}")))?
        .build()
        .map_err(|e| Error::Audio(format!("vorbis build: {e}")))?;

    // Convert interleaved to channel-separated
    let channels: Vec<Vec<f32>> = (0..num_channels as usize)
        .map(|ch| {
            samples
                .iter()
                .skip(ch)
                .step_by(num_channels as usize)
                .copied()
                .collect()
        })
        .collect();

    encoder
        .encode_audio_block(&channels)
        .map_err(|e| Error::Audio(format!("vorbis encode: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Audio(format!("vorbis finish: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_nonempty_ogg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.ogg");
        let samples: Vec<f32> = (0..16000)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        write_ogg(&path, &samples, 16000, 1).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"OggS"));
    }

    #[test]
    fn zero_channels_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_ogg(dir.path().join("x.ogg"), &[], 16000, 0).is_err());
    }
}
