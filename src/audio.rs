//! Audio I/O utilities.
//!
//! Input WAV decoding, resampling to the decoder rate, the log-mel front end,
//! and output encoding (WAV or OGG, chosen by file extension).

pub mod loader;
pub mod mel;
mod ogg;
pub mod resample;
mod wav;

use std::path::Path;

pub use loader::{LoadedAudio, load_audio};
pub use ogg::write_ogg;
pub use wav::{WavClip, downmix, read_wav, write_wav};

use crate::{Error, Result};

/// Output container, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Ogg,
}

impl AudioFormat {
    /// Parse an extension (case-insensitive, without the dot).
    pub fn parse(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            "ogg" => Some(Self::Ogg),
            _ => None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        path.as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::parse)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Ogg => "ogg",
        }
    }
}

/// Write interleaved samples, encoding by the path's extension.
pub fn write_audio(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let path = path.as_ref();
    match AudioFormat::from_path(path) {
        Some(AudioFormat::Wav) => write_wav(path, samples, sample_rate, num_channels),
        Some(AudioFormat::Ogg) => write_ogg(path, samples, sample_rate, num_channels),
        None => Err(Error::Audio(format!(
            "unsupported output format for {}. Use .wav or .ogg",
            path.display()
        ))),
    }
}
