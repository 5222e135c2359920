//! Simple command-line client for the audio edit daemon.
//!
//! Connects to the Unix socket, sends a JSON edit request, waits for the
//! response, and exits 0 on success or 1 on error.
//!
//! # Usage
//!
//! ```sh
//! edit-client \
//!   --input /tmp/clip.wav \
//!   --target-prompt "A dog barking" \
//!   --output /tmp/edited.wav
//!
//! # Stronger edit, same session (reuses the inversion):
//! edit-client --input /tmp/clip.wav --target-prompt "A dog barking" --t-start 150
//!
//! # Force the next edit to re-invert:
//! edit-client --reset
//!
//! # Unload the model to free VRAM:
//! edit-client --unload
//! ```

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    time::timeout,
};

#[derive(Parser)]
#[command(name = "edit-client", about = "Send an edit request to the audio edit daemon")]
struct Args {
    /// Input audio file (WAV)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Description of the desired output
    #[arg(long)]
    target_prompt: Option<String>,

    /// Optional description of the input audio
    #[arg(long)]
    source_prompt: Option<String>,

    /// Output file path (.wav or .ogg)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Checkpoint, e.g. cvssp/audioldm2-music (default: the daemon's)
    #[arg(long)]
    model: Option<String>,

    /// Diffusion steps
    #[arg(long)]
    steps: Option<usize>,

    /// Source guidance scale
    #[arg(long)]
    cfg_src: Option<f64>,

    /// Target guidance scale
    #[arg(long)]
    cfg_tar: Option<f64>,

    /// Edit strength: number of reverse steps
    #[arg(long)]
    t_start: Option<usize>,

    /// Seed for the inversion noise
    #[arg(long)]
    seed: Option<u64>,

    /// Draw a random seed (forces a new inversion)
    #[arg(long)]
    randomize_seed: bool,

    /// Re-invert even if the cached inversion looks valid
    #[arg(long)]
    redo_inversion: bool,

    /// Session whose inversion cache to use
    #[arg(long, default_value = "default")]
    session: String,

    /// Socket path (default: /tmp/audio-ddpm-edit.sock)
    #[arg(long, default_value = "/tmp/audio-ddpm-edit.sock")]
    socket: PathBuf,

    /// Timeout in seconds to wait for the edit (default: 600)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Mark the session's inversion stale instead of editing
    #[arg(long, conflicts_with = "unload")]
    reset: bool,

    /// Unload the model instead of editing
    #[arg(long)]
    unload: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Request {
    Edit(EditRequest),
    Command(CommandRequest),
}

#[derive(Serialize)]
struct EditRequest {
    session: String,
    input: String,
    target_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cfg_scale_src: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cfg_scale_tar: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    t_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    randomize_seed: bool,
    redo_inversion: bool,
}

#[derive(Serialize)]
struct CommandRequest {
    action: &'static str,
    session: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Response {
    // Tried first: only error responses carry `error`.
    Error(ErrorResponse),
    Success(SuccessResponse),
}

#[derive(Deserialize)]
struct SuccessResponse {
    ok: bool,
    path: Option<String>,
    seed: Option<u64>,
    inverted: Option<bool>,
    duration_s: Option<f64>,
    changed: Option<bool>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[allow(dead_code)]
    ok: bool,
    error: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let request = if args.unload || args.reset {
        Request::Command(CommandRequest {
            action: if args.unload { "unload" } else { "reset" },
            session: args.session,
        })
    } else {
        let input = args.input.context("--input is required for edits")?;
        let target_prompt = args
            .target_prompt
            .context("--target-prompt is required for edits")?;
        Request::Edit(EditRequest {
            session: args.session,
            input: input.to_string_lossy().into_owned(),
            target_prompt,
            source_prompt: args.source_prompt,
            output: args.output.map(|p| p.to_string_lossy().into_owned()),
            model: args.model,
            steps: args.steps,
            cfg_scale_src: args.cfg_src,
            cfg_scale_tar: args.cfg_tar,
            t_start: args.t_start,
            seed: args.seed,
            randomize_seed: args.randomize_seed,
            redo_inversion: args.redo_inversion,
        })
    };

    let request_line = serde_json::to_string(&request)? + "\n";

    let stream = timeout(Duration::from_secs(10), UnixStream::connect(&args.socket))
        .await
        .context("timed out connecting to daemon socket")?
        .with_context(|| format!("failed to connect to {}", args.socket.display()))?;

    let (reader, mut writer) = stream.into_split();

    writer
        .write_all(request_line.as_bytes())
        .await
        .context("failed to send request")?;
    writer.flush().await?;
    // Signal EOF so the daemon knows we're done writing.
    drop(writer);

    let mut reader = BufReader::new(reader);
    let mut response_line = String::new();

    timeout(Duration::from_secs(args.timeout_secs), reader.read_line(&mut response_line))
        .await
        .context("timed out waiting for daemon response")?
        .context("failed to read response")?;

    if response_line.is_empty() {
        bail!("daemon closed connection without sending a response");
    }

    let response: Response =
        serde_json::from_str(response_line.trim()).context("failed to parse daemon response")?;

    match response {
        Response::Success(r) if r.ok => {
            if let Some(path) = r.path {
                let inverted = if r.inverted.unwrap_or(false) { "inverted" } else { "cached inversion" };
                match (r.duration_s, r.seed) {
                    (Some(duration), Some(seed)) => {
                        eprintln!("edited {duration:.1}s of audio (seed {seed}, {inverted}) → {path}")
                    }
                    _ => eprintln!("done → {path}"),
                }
                println!("{path}");
            } else if let Some(changed) = r.changed {
                eprintln!("ok (changed: {changed})");
            } else {
                eprintln!("ok");
            }
            Ok(())
        }
        Response::Success(r) => {
            bail!("daemon returned ok=false without error field (raw: {:?})", r.path);
        }
        Response::Error(r) => {
            bail!("edit failed: {}", r.error);
        }
    }
}
