//! Audio edit daemon: Unix socket, line-delimited JSON.
//!
//! Keeps the model and per-session inversion caches resident across requests.
//! Each client connection sends one JSON request line and receives one JSON
//! response line, then closes.
//!
//! # Socket path
//!
//! Default: `/tmp/audio-ddpm-edit.sock`. Override with `--socket` or the
//! `socket` field of `--config`.
//!
//! # Protocol
//!
//! **Edit request** (one JSON line):
//! ```json
//! {
//!   "input": "/tmp/clip.wav",
//!   "target_prompt": "A dog barking",
//!   "source_prompt": "",                // optional
//!   "session": "default",               // optional, scopes the inversion cache
//!   "model": "reference/gaussian-prior", // optional, daemon default otherwise
//!   "steps": 200,                       // optional
//!   "cfg_scale_src": 3.0,               // optional
//!   "cfg_scale_tar": 12.0,              // optional
//!   "t_start": 110,                     // optional, 110/200 of steps otherwise
//!   "seed": 0,                          // optional
//!   "randomize_seed": false,            // optional
//!   "redo_inversion": false,            // optional
//!   "output": "/tmp/edited.wav"         // optional, auto-generated if omitted
//! }
//! ```
//!
//! **Other actions**: `{"action": "reset", "session": "default"}` forces the
//! next edit in a session to re-invert; `{"action": "unload"}` drops the model.
//!
//! **Response on success** (one JSON line):
//! ```json
//! {"ok": true, "path": "/tmp/edited.wav", "seed": 0, "inverted": true, "duration_s": 10.0, "sample_rate": 16000}
//! ```
//!
//! **Response on error** (one JSON line):
//! ```json
//! {"ok": false, "error": "edit failed: ..."}
//! ```
//!
//! # Example (shell)
//!
//! ```sh
//! echo '{"input":"/tmp/clip.wav","target_prompt":"A dog barking"}' \
//!   | socat - UNIX-CONNECT:/tmp/audio-ddpm-edit.sock
//! ```

use std::path::{Path, PathBuf};

use audio_ddpm_edit::{
    audio::{AudioFormat, write_audio},
    config::{DaemonConfig, EditDefaults, ModelId},
    manager::{EditManager, ManagerConfig},
    model::ModelRegistry,
    pipeline::{EditRequest, EditedAudio},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "edit-daemon",
    about = "Audio edit daemon: resident model, Unix socket JSON interface"
)]
struct Args {
    /// JSON config file. Command-line flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path to listen on.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long)]
    device: Option<usize>,

    /// Model used when a request does not name one.
    #[arg(long)]
    model: Option<ModelId>,
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Action {
    #[default]
    Edit,
    Reset,
    Unload,
}

/// A request received over the socket.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    action: Action,

    #[serde(default = "default_session")]
    session: String,

    #[serde(default)]
    input: Option<PathBuf>,

    #[serde(default)]
    target_prompt: String,

    #[serde(default)]
    source_prompt: String,

    /// `null` or absent = the daemon's default model.
    #[serde(default)]
    model: Option<ModelId>,

    #[serde(default = "default_steps")]
    steps: usize,

    #[serde(default = "default_cfg_src")]
    cfg_scale_src: f64,

    #[serde(default = "default_cfg_tar")]
    cfg_scale_tar: f64,

    /// `null` or absent = scaled to `steps`, as the CLI does.
    #[serde(default)]
    t_start: Option<usize>,

    #[serde(default)]
    seed: u64,

    #[serde(default)]
    randomize_seed: bool,

    #[serde(default)]
    redo_inversion: bool,

    /// Output file path. `null` or absent = auto-generated in the spool dir.
    #[serde(default)]
    output: Option<PathBuf>,
}

fn default_session() -> String {
    "default".into()
}

fn default_steps() -> usize {
    EditDefaults::STEPS
}

fn default_cfg_src() -> f64 {
    EditDefaults::CFG_SCALE_SRC
}

fn default_cfg_tar() -> f64 {
    EditDefaults::CFG_SCALE_TAR
}

impl Request {
    /// Check the edit fields and fill in daemon defaults.
    fn into_edit(self, default_model: &ModelId) -> Result<(String, EditRequest), String> {
        let Some(input) = self.input else {
            return Err("'input' field is required for edits".into());
        };
        if self.target_prompt.trim().is_empty() {
            return Err("'target_prompt' field is required and must not be empty".into());
        }
        let request = EditRequest {
            input,
            model_id: self.model.unwrap_or_else(|| default_model.clone()),
            source_prompt: self.source_prompt,
            target_prompt: self.target_prompt,
            steps: self.steps,
            cfg_scale_src: self.cfg_scale_src,
            cfg_scale_tar: self.cfg_scale_tar,
            t_start: self
                .t_start
                .unwrap_or_else(|| EditDefaults::t_start_for(self.steps)),
            seed: self.seed,
            randomize_seed: self.randomize_seed,
            redo_inversion: self.redo_inversion,
        };
        request.validate().map_err(|e| e.to_string())?;
        Ok((self.session, request))
    }
}

/// Response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Edited {
        ok: bool, // always true
        path: String,
        seed: u64,
        inverted: bool,
        duration_s: f64,
        sample_rate: u32,
    },
    Done {
        ok: bool, // always true
        changed: bool,
    },
    Err {
        ok: bool, // always false
        error: String,
    },
}

impl Response {
    fn edited(path: &Path, audio: &EditedAudio) -> Self {
        Self::Edited {
            ok: true,
            path: path.to_string_lossy().into_owned(),
            seed: audio.seed,
            inverted: audio.inverted,
            duration_s: audio.duration_s,
            sample_rate: audio.sample_rate,
        }
    }

    fn done(changed: bool) -> Self {
        Self::Done { ok: true, changed }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: msg.into(),
        }
    }
}

/// Settings every connection handler needs.
#[derive(Clone)]
struct Context {
    manager: EditManager,
    default_model: ModelId,
    spool_dir: PathBuf,
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args)?;
    let registry = ModelRegistry::with_builtin();
    registry.check(&config.default_model)?;
    let spool_dir = config.resolve_spool_dir()?;

    // Remove stale socket file if present.
    if config.socket.exists() {
        std::fs::remove_file(&config.socket)?;
    }

    let listener = UnixListener::bind(&config.socket)?;
    tracing::info!(
        socket = %config.socket.display(),
        default_model = %config.default_model,
        spool = %spool_dir.display(),
        "listening"
    );

    let context = Context {
        manager: EditManager::start(registry, ManagerConfig::from(&config)),
        default_model: config.default_model.clone(),
        spool_dir,
    };

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &context).await {
                        tracing::warn!("connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }
}

fn load_config(args: Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket = socket;
    }
    if let Some(device) = args.device {
        config.cuda_device = device;
    }
    if let Some(model) = args.model {
        config.default_model = model;
    }
    Ok(config)
}

// ── Connection handler ────────────────────────────────────────────────────────

async fn handle_connection(stream: UnixStream, context: &Context) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Read exactly one line (the JSON request).
    let line = match lines.next_line().await? {
        Some(l) if !l.trim().is_empty() => l,
        _ => {
            send_response(&mut writer, Response::err("empty request")).await?;
            return Ok(());
        }
    };

    let response = process_request(&line, context).await;
    send_response(&mut writer, response).await?;
    Ok(())
}

async fn process_request(line: &str, context: &Context) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::err(format!("invalid JSON request: {e}")),
    };

    match req.action {
        Action::Reset => match context.manager.reset(&req.session).await {
            Ok(existed) => Response::done(existed),
            Err(e) => Response::err(e.to_string()),
        },
        Action::Unload => match context.manager.unload().await {
            Ok(unloaded) => Response::done(unloaded),
            Err(e) => Response::err(e.to_string()),
        },
        Action::Edit => process_edit(req, context).await,
    }
}

async fn process_edit(mut req: Request, context: &Context) -> Response {
    let output = req.output.take();
    let (session, request) = match req.into_edit(&context.default_model) {
        Ok(parts) => parts,
        Err(e) => return Response::err(e),
    };
    let output = match resolve_output(output, &context.spool_dir) {
        Ok(path) => path,
        Err(e) => return Response::err(e),
    };

    tracing::info!(
        session = %session,
        model = %request.model_id,
        target = %request.target_prompt,
        steps = request.steps,
        t_start = request.t_start,
        output = %output.display(),
        "editing"
    );

    let audio = match context.manager.edit(session, request).await {
        Ok(a) => a,
        Err(ref e) if e.to_string().contains("manager has shut down") => {
            // The worker thread is gone. Exit so a supervisor can restart us.
            tracing::error!("edit manager has shut down, exiting for restart");
            std::process::exit(1);
        }
        Err(e) => return Response::err(format!("edit failed: {e}")),
    };

    if let Err(e) = write_audio(&output, &audio.samples, audio.sample_rate, EditedAudio::CHANNELS) {
        return Response::err(format!("failed to write audio file: {e}"));
    }

    tracing::info!(output = %output.display(), "done");
    Response::edited(&output, &audio)
}

/// Validate a requested output path, or pick a fresh `.wav` in the spool dir.
fn resolve_output(output: Option<PathBuf>, spool_dir: &Path) -> Result<PathBuf, String> {
    let Some(path) = output else {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        return Ok(spool_dir.join(format!("edit-{ts}.{}", AudioFormat::Wav.extension())));
    };

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if AudioFormat::parse(ext).is_none() {
        return Err(format!("unsupported output format '{ext}'. Use .wav or .ogg"));
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        return Err(format!("could not create output directory: {e}"));
    }
    Ok(path)
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: Response,
) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(&response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Request {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn request_defaults() {
        let req = parse(r#"{"input":"/tmp/clip.wav","target_prompt":"A dog barking"}"#);
        assert_eq!(req.action, Action::Edit);
        assert_eq!(req.session, "default");
        assert_eq!(req.steps, EditDefaults::STEPS);
        assert_eq!(req.t_start, None);
        assert!(req.model.is_none() && req.output.is_none());

        let (session, request) = req.into_edit(&ModelId::GaussianPrior).unwrap();
        assert_eq!(session, "default");
        assert_eq!(request.model_id, ModelId::GaussianPrior);
        assert_eq!(request.t_start, EditDefaults::T_START);
        assert_eq!(request.cfg_scale_tar, EditDefaults::CFG_SCALE_TAR);
    }

    #[test]
    fn default_t_start_scales_with_steps() {
        let req = parse(r#"{"input":"/tmp/clip.wav","target_prompt":"A dog barking","steps":100}"#);
        let (_, request) = req.into_edit(&ModelId::GaussianPrior).unwrap();
        assert_eq!(request.steps, 100);
        assert_eq!(request.t_start, 55);

        let req = parse(
            r#"{"input":"/tmp/clip.wav","target_prompt":"x","steps":100,"t_start":100}"#,
        );
        assert_eq!(req.into_edit(&ModelId::GaussianPrior).unwrap().1.t_start, 100);
    }

    #[test]
    fn edit_fields_are_checked() {
        let missing_input = parse(r#"{"target_prompt":"A dog barking"}"#);
        assert!(missing_input.into_edit(&ModelId::GaussianPrior).is_err());

        let blank_target = parse(r#"{"input":"/tmp/clip.wav","target_prompt":"  "}"#);
        assert!(blank_target.into_edit(&ModelId::GaussianPrior).is_err());

        let too_strong = parse(
            r#"{"input":"/tmp/clip.wav","target_prompt":"x","steps":100,"t_start":101}"#,
        );
        let err = too_strong.into_edit(&ModelId::GaussianPrior).unwrap_err();
        assert!(err.contains("t_start"), "{err}");
    }

    #[test]
    fn other_actions_parse() {
        let reset = parse(r#"{"action":"reset","session":"mine"}"#);
        assert_eq!(reset.action, Action::Reset);
        assert_eq!(reset.session, "mine");
        assert_eq!(parse(r#"{"action":"unload"}"#).action, Action::Unload);
        assert!(serde_json::from_str::<Request>(r#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn output_path_resolution() {
        let dir = tempfile::tempdir().unwrap();

        let spooled = resolve_output(None, dir.path()).unwrap();
        assert_eq!(spooled.parent(), Some(dir.path()));
        assert_eq!(spooled.extension().and_then(|e| e.to_str()), Some("wav"));

        let nested = dir.path().join("out/edited.ogg");
        assert_eq!(resolve_output(Some(nested.clone()), dir.path()).unwrap(), nested);
        assert!(dir.path().join("out").is_dir());

        assert!(resolve_output(Some(dir.path().join("edited.mp3")), dir.path()).is_err());
        assert!(resolve_output(Some(dir.path().join("edited")), dir.path()).is_err());
    }

    #[test]
    fn error_response_shape() {
        let json = serde_json::to_string(&Response::err("boom")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"boom"}"#);
        let json = serde_json::to_string(&Response::done(true)).unwrap();
        assert_eq!(json, r#"{"ok":true,"changed":true}"#);
    }
}
