//! One-shot CLI: edit an audio clip with a text prompt.
//!
//! Runs inversion and editing in-process, writes the result to `--output`
//! (or a temporary `.wav`), and prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"path":"/tmp/edited.wav","seed":0,"inverted":true,"duration_s":10.0,"sample_rate":16000}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use anyhow::Context;
use audio_ddpm_edit::{
    audio::{AudioFormat, write_audio},
    config::{EditDefaults, ModelId, TStartRange},
    manager::preferred_device,
    model::ModelRegistry,
    pipeline::{EditPipeline, EditRequest, EditSession, EditedAudio},
};
use clap::Parser;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "audio-edit",
    about = "Zero-shot text-based audio editing via DDPM inversion",
    long_about = "Invert an input clip under a pretrained latent diffusion model, then\n\
                  regenerate it conditioned on a target prompt.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Input audio file (WAV). Only the first 30 s are used.
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Description of the desired output.
    #[arg(long, short = 't')]
    target_prompt: String,

    /// Optional description of the input audio.
    #[arg(long, short = 's', default_value = "")]
    source_prompt: String,

    /// Checkpoint to use. Must have a registered backend.
    #[arg(long, short = 'm', default_value_t = ModelId::default())]
    model: ModelId,

    /// Diffusion steps. More steps tend to give better results.
    #[arg(long, default_value_t = EditDefaults::STEPS)]
    steps: usize,

    /// Source guidance scale. Only used when a source prompt is given.
    #[arg(long, default_value_t = EditDefaults::CFG_SCALE_SRC)]
    cfg_src: f64,

    /// Target guidance scale. Higher = closer to the prompt, lower quality.
    #[arg(long, default_value_t = EditDefaults::CFG_SCALE_TAR)]
    cfg_tar: f64,

    /// Edit strength: number of reverse steps to run. Defaults to 110/200 of --steps.
    #[arg(long)]
    t_start: Option<usize>,

    /// Seed for the inversion noise.
    #[arg(long, default_value_t = EditDefaults::SEED)]
    seed: u64,

    /// Draw a random seed instead of --seed.
    #[arg(long)]
    randomize_seed: bool,

    /// Output file path (.wav or .ogg). Defaults to a temporary .wav.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, default_value_t = 0)]
    device: usize,
}

#[derive(Serialize)]
struct Summary<'a> {
    path: &'a str,
    seed: u64,
    inverted: bool,
    duration_s: f64,
    sample_rate: u32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let range = TStartRange::for_steps(args.steps);
    let t_start = args
        .t_start
        .unwrap_or_else(|| EditDefaults::t_start_for(args.steps));
    if !range.contains(t_start) {
        tracing::warn!(
            t_start,
            min = range.min,
            max = range.max,
            "t_start outside the recommended range"
        );
    }

    let request = EditRequest {
        input: args.input,
        model_id: args.model,
        source_prompt: args.source_prompt,
        target_prompt: args.target_prompt,
        steps: args.steps,
        cfg_scale_src: args.cfg_src,
        cfg_scale_tar: args.cfg_tar,
        t_start,
        seed: args.seed,
        randomize_seed: args.randomize_seed,
        redo_inversion: false,
    };
    request.validate()?;

    let registry = ModelRegistry::with_builtin();
    registry.check(&request.model_id)?;

    let output = resolve_output(args.output)?;

    let device = preferred_device(args.device);
    tracing::info!("Using device: {:?}", device);

    let mut pipeline = EditPipeline::new(registry, device);
    let mut session = EditSession::new();
    let audio = pipeline
        .edit(&mut session, &request)
        .map_err(|e| anyhow::anyhow!("edit failed: {e}"))?;

    write_audio(&output, &audio.samples, audio.sample_rate, EditedAudio::CHANNELS)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;

    let path = output.to_string_lossy();
    let summary = Summary {
        path: &path,
        seed: audio.seed,
        inverted: audio.inverted,
        duration_s: audio.duration_s,
        sample_rate: audio.sample_rate,
    };
    println!("{}", serde_json::to_string(&summary)?);

    Ok(())
}

/// Validate the output extension, or make a temporary `.wav` that outlives the process.
fn resolve_output(output: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let Some(path) = output else {
        let file = tempfile::Builder::new()
            .prefix("audio-edit-")
            .suffix(".wav")
            .tempfile()
            .context("failed to create temporary output file")?;
        let (_, path) = file.keep().context("failed to keep temporary output file")?;
        return Ok(path);
    };

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    if AudioFormat::parse(ext).is_none() {
        anyhow::bail!("unsupported output format '{}'. Use .wav or .ogg", ext);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}
