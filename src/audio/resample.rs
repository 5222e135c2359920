//! Audio resampling using rubato.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

const SINC_LEN: usize = 256;

/// Resample a mono signal from `from_sr` to `to_sr`.
///
/// Output length is `round(len * to_sr / from_sr)`, aligned with the input
/// (the filter delay is trimmed).
pub fn resample(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
    if from_sr == to_sr || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_sr == 0 || to_sr == 0 {
        return Err(Error::Audio(format!(
            "cannot resample between {from_sr} Hz and {to_sr} Hz"
        )));
    }

    let ratio = to_sr as f64 / from_sr as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    // One chunk holding the whole signal plus enough silence to flush the filter.
    let mut padded = samples.to_vec();
    padded.resize(samples.len() + 2 * SINC_LEN, 0.0);

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, padded.len(), 1)
        .map_err(|e| Error::Audio(format!("resampler init: {e}")))?;
    let delay = resampler.output_delay();

    let output = resampler
        .process(&[padded], None)
        .map_err(|e| Error::Audio(format!("resample: {e}")))?;

    let mut channel = output.into_iter().next().unwrap_or_default();
    let start = delay.min(channel.len());
    channel.drain(..start);
    channel.resize(expected, 0.0);
    Ok(channel)
}
