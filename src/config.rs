//! Configuration: model identifiers, edit defaults and daemon settings.
//!
//! Defaults follow the published AudioLDM2 editing demo.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A pretrained checkpoint identifier.
///
/// Known checkpoints get their own variant; anything else shaped like
/// `org/name` is carried verbatim and resolved by the model registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelId {
    AudioLdm2,
    AudioLdm2Large,
    AudioLdm2Music,
    /// Built-in closed-form model, see [`crate::model::reference`].
    GaussianPrior,
    Custom(String),
}

impl ModelId {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AudioLdm2 => "cvssp/audioldm2",
            Self::AudioLdm2Large => "cvssp/audioldm2-large",
            Self::AudioLdm2Music => "cvssp/audioldm2-music",
            Self::GaussianPrior => "reference/gaussian-prior",
            Self::Custom(id) => id,
        }
    }

    /// The checkpoints offered by default, in display order.
    pub fn known() -> &'static [ModelId] {
        &[
            ModelId::AudioLdm2,
            ModelId::AudioLdm2Large,
            ModelId::AudioLdm2Music,
            ModelId::GaussianPrior,
        ]
    }
}

/// The built-in reference model, which needs no weights.
impl Default for ModelId {
    fn default() -> Self {
        Self::GaussianPrior
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(known) = Self::known().iter().find(|id| id.as_str() == s) {
            return Ok(known.clone());
        }
        match s.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::Custom(s.to_string()))
            }
            _ => Err(Error::InvalidParameter(format!(
                "model id must look like 'org/name', got '{s}'"
            ))),
        }
    }
}

impl TryFrom<String> for ModelId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.as_str().to_string()
    }
}

/// Default values and accepted bounds for an edit request.
pub struct EditDefaults;

impl EditDefaults {
    pub const STEPS: usize = 200;
    pub const MIN_STEPS: usize = 20;
    /// Leading spacing with `steps_offset = 1` runs out of trained timesteps
    /// past 999.
    pub const MAX_STEPS: usize = 999;

    pub const CFG_SCALE_SRC: f64 = 3.0;
    pub const CFG_SCALE_TAR: f64 = 12.0;
    pub const MIN_CFG_SCALE: f64 = 0.5;
    pub const MAX_CFG_SCALE: f64 = 25.0;

    pub const T_START: usize = 110;
    pub const SEED: u64 = 0;

    /// Output sample rate expected by the decoder.
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Inputs longer than this are truncated.
    pub const MAX_DURATION_S: f64 = 30.0;

    /// Default T_start for `steps`: 110/200 of the step count, snapped into
    /// the recommended range.
    pub fn t_start_for(steps: usize) -> usize {
        TStartRange::for_steps(steps).clamp(Self::T_START * steps / Self::STEPS)
    }
}

/// Recommended T_start bounds for a given step count.
///
/// At 200 steps the range is 30..=160; other step counts scale linearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TStartRange {
    pub min: usize,
    pub max: usize,
}

impl TStartRange {
    pub fn for_steps(steps: usize) -> Self {
        Self {
            min: 30 * steps / 200,
            max: 160 * steps / 200,
        }
    }

    /// Snap a value into the range.
    pub fn clamp(&self, t_start: usize) -> usize {
        t_start.clamp(self.min, self.max)
    }

    pub fn contains(&self, t_start: usize) -> bool {
        (self.min..=self.max).contains(&t_start)
    }
}

/// Settings for the edit daemon, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket path to listen on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// CUDA device ordinal. Ignored when CUDA is unavailable.
    #[serde(default)]
    pub cuda_device: usize,

    /// Model used when a request does not name one.
    #[serde(default)]
    pub default_model: ModelId,

    /// Directory for edited audio files. `None` = per-user data dir.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    /// Maximum number of queued requests.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            cuda_device: 0,
            default_model: ModelId::default(),
            spool_dir: None,
            queue_depth: default_queue_depth(),
        }
    }
}

impl DaemonConfig {
    /// Read a config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.verify()?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the spool directory, creating it if needed.
    pub fn resolve_spool_dir(&self) -> Result<PathBuf> {
        let dir = match &self.spool_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("audio-ddpm-edit/spool"),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("/tmp/audio-ddpm-edit.sock")
}

fn default_queue_depth() -> usize {
    16
}
