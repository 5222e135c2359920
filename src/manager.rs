//! Edit manager: keeps the model resident and serializes requests.
//!
//! The manager owns one [`EditPipeline`] on a dedicated blocking thread.
//! Callers submit commands over a bounded queue and get replies over oneshot
//! channels. Per-session inversion caches live on the same thread, so no
//! locking is needed. On a CUDA OOM the manager moves to CPU and retries once.
//!
//! # Example
//!
//! ```no_run
//! use audio_ddpm_edit::manager::{EditManager, ManagerConfig};
//! use audio_ddpm_edit::model::ModelRegistry;
//! use audio_ddpm_edit::pipeline::EditRequest;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = EditManager::start(ModelRegistry::with_builtin(), ManagerConfig::default());
//!     let request = EditRequest::new("input.wav", "A dog barking");
//!     let _audio = manager.edit("default", request).await.unwrap();
//! }
//! ```

use std::collections::HashMap;

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::config::DaemonConfig;
use crate::model::ModelProvider;
use crate::pipeline::{EditPipeline, EditRequest, EditSession, EditedAudio};
use crate::{Error, Result};

/// Configuration for the edit manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,

    /// Maximum number of commands waiting for the worker.
    pub queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cuda_device: 0,
            queue_depth: 16,
        }
    }
}

impl From<&DaemonConfig> for ManagerConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            cuda_device: config.cuda_device,
            queue_depth: config.queue_depth,
        }
    }
}

enum Command {
    Edit {
        session: String,
        request: EditRequest,
        reply: oneshot::Sender<Result<EditedAudio>>,
    },
    Reset {
        session: String,
        reply: oneshot::Sender<bool>,
    },
    Unload {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle for submitting commands to a running manager.
#[derive(Clone)]
pub struct EditManager {
    tx: mpsc::Sender<Command>,
}

impl EditManager {
    /// Start the worker thread and return a handle to it.
    ///
    /// Models load lazily on the first edit that names them. Must be called
    /// from within a tokio runtime.
    pub fn start<P>(provider: P, config: ManagerConfig) -> Self
    where
        P: ModelProvider + 'static,
    {
        let device = preferred_device(config.cuda_device);
        tracing::info!(device = ?device, queue_depth = config.queue_depth, "starting edit manager");
        let pipeline = EditPipeline::new(provider, device);
        let (tx, rx) = mpsc::channel::<Command>(config.queue_depth.max(1));
        tokio::task::spawn_blocking(move || run_manager(pipeline, rx));
        Self { tx }
    }

    /// Run an edit in `session` and wait for the result.
    pub async fn edit(&self, session: impl Into<String>, request: EditRequest) -> Result<EditedAudio> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Edit {
            session: session.into(),
            request,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Force the next edit in `session` to re-invert.
    ///
    /// Returns whether the session existed.
    pub async fn reset(&self, session: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset {
            session: session.into(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))
    }

    /// Drop the loaded model. Returns whether one was loaded.
    pub async fn unload(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unload { reply }).await?;
        rx.await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))
    }
}

/// The manager loop. Runs on a dedicated blocking thread.
fn run_manager<P: ModelProvider>(mut pipeline: EditPipeline<P>, mut rx: mpsc::Receiver<Command>) {
    // TODO: evict sessions that have been idle for a while; each one pins a full trajectory.
    let mut sessions: HashMap<String, EditSession> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Edit {
                session,
                request,
                reply,
            } => {
                let result = edit_with_retry(&mut pipeline, &mut sessions, &session, &request);
                if let Err(error) = &result {
                    tracing::warn!(session = %session, %error, "edit failed");
                }
                // Ignore send errors; the caller may have timed out.
                let _ = reply.send(result);
            }
            Command::Reset { session, reply } => {
                let existed = match sessions.get_mut(&session) {
                    Some(state) => {
                        state.mark_stale();
                        true
                    }
                    None => false,
                };
                tracing::debug!(session = %session, existed, "session reset");
                let _ = reply.send(existed);
            }
            Command::Unload { reply } => {
                let _ = reply.send(pipeline.unload());
            }
        }
    }
    tracing::info!("edit manager shut down");
}

/// Run an edit. On CUDA OOM, move the pipeline to CPU and retry once.
fn edit_with_retry<P: ModelProvider>(
    pipeline: &mut EditPipeline<P>,
    sessions: &mut HashMap<String, EditSession>,
    session: &str,
    request: &EditRequest,
) -> Result<EditedAudio> {
    let state = sessions.entry(session.to_string()).or_default();
    match pipeline.edit(state, request) {
        Err(error) if is_oom_error(&error) && matches!(pipeline.device(), Device::Cuda(_)) => {
            tracing::warn!(%error, "CUDA OOM, moving pipeline to CPU and retrying");
            pipeline.move_to(Device::Cpu);
            // Cached trajectories live on the old device.
            for state in sessions.values_mut() {
                state.mark_stale();
            }
            let state = sessions.entry(session.to_string()).or_default();
            pipeline
                .edit(state, request)
                .map_err(|e| Error::Manager(format!("edit failed even on CPU: {e}")))
        }
        result => result,
    }
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}

/// Return true if the error looks like a CUDA out-of-memory condition.
///
/// Candle surfaces CUDA errors as `candle_core::Error::Cuda(Box<dyn Error>)` whose
/// `Display` contains the cudarc error string. We match on substrings
/// rather than types because the concrete error type is not exported.
pub fn is_oom_error(error: &Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use crate::config::ModelId;
    use crate::error::Stage;
    use crate::model::ModelRegistry;

    fn tone(path: &std::path::Path) {
        let samples: Vec<f32> = (0..8000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        write_wav(path, &samples, 16000, 1).unwrap();
    }

    fn request(input: &std::path::Path, target: &str) -> EditRequest {
        EditRequest {
            model_id: ModelId::GaussianPrior,
            steps: 20,
            t_start: 12,
            ..EditRequest::new(input, target)
        }
    }

    #[test]
    fn test_is_oom_error_matches_known_patterns() {
        fn make_err(msg: &str) -> Error {
            Error::Manager(msg.to_string())
        }

        assert!(is_oom_error(&make_err("CUDA out of memory")));
        assert!(is_oom_error(&make_err("cudaErrorMemoryAllocation")));
        assert!(is_oom_error(&make_err("CUDA_ERROR_OUT_OF_MEMORY")));
        assert!(is_oom_error(&make_err("alloc failed")));
        assert!(!is_oom_error(&make_err("shape mismatch")));
        assert!(!is_oom_error(&make_err("invalid index")));
    }

    #[test]
    fn test_oom_detected_through_diffusion_wrapper() {
        let error = Error::in_step(Stage::Sampling, 7)(Error::Manager("CUDA out of memory".into()));
        assert!(is_oom_error(&error));
    }

    #[test]
    fn test_manager_config_from_daemon_config() {
        let daemon = DaemonConfig {
            cuda_device: 2,
            queue_depth: 4,
            ..Default::default()
        };
        let config = ManagerConfig::from(&daemon);
        assert_eq!(config.cuda_device, 2);
        assert_eq!(config.queue_depth, 4);
    }

    #[tokio::test]
    async fn test_edit_reuses_then_resets_session() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        tone(&input);

        let manager = EditManager::start(ModelRegistry::with_builtin(), ManagerConfig::default());

        let first = manager.edit("s1", request(&input, "A dog barking")).await.unwrap();
        assert!(first.inverted);
        assert_eq!(first.sample_rate, 16000);

        let second = manager.edit("s1", request(&input, "A cat meowing")).await.unwrap();
        assert!(!second.inverted, "target-only change should reuse the inversion");

        assert!(manager.reset("s1").await.unwrap());
        assert!(!manager.reset("unknown").await.unwrap());
        let third = manager.edit("s1", request(&input, "A cat meowing")).await.unwrap();
        assert!(third.inverted);

        // Sessions do not share caches.
        let other = manager.edit("s2", request(&input, "A dog barking")).await.unwrap();
        assert!(other.inverted);
    }

    #[tokio::test]
    async fn test_unload_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        tone(&input);

        let manager = EditManager::start(ModelRegistry::with_builtin(), ManagerConfig::default());
        assert!(!manager.unload().await.unwrap());

        manager.edit("s", request(&input, "rain")).await.unwrap();
        assert!(manager.unload().await.unwrap());

        let bad = EditRequest {
            t_start: 0,
            ..request(&input, "rain")
        };
        assert!(matches!(
            manager.edit("s", bad).await,
            Err(Error::InvalidParameter(_))
        ));

        let missing = EditRequest {
            model_id: ModelId::AudioLdm2,
            ..request(&input, "rain")
        };
        assert!(matches!(
            manager.edit("s", missing).await,
            Err(Error::ModelLoad { .. })
        ));
    }
}
