//! Text-based audio editing with edit-friendly DDPM inversion.
//!
//! Given a clip, an optional description of it and a description of the
//! desired result, the crate inverts the clip's latent into a noise trajectory
//! under a pretrained latent diffusion model, then replays the last `T_start`
//! steps of that trajectory conditioned on the new description.
//!
//! ## Architecture
//!
//! ```text
//! wav → resample → log-mel → encode ──→ w0
//!                                        ↓
//!               source prompt → forward inversion (N steps) → zs, wts
//!                                        ↓
//!               target prompt → reverse replay (T_start steps)
//!                                        ↓
//!                          decode (latent → mel) → vocoder → wav
//! ```
//!
//! ## Modules
//!
//! - [`audio`]: WAV/OGG I/O, resampling, log-mel front end, input loading
//! - [`model`]: the model seam, registry, and a closed-form reference model
//! - [`scheduler`]: DDPM noise schedule and posterior step
//! - [`inversion`]: forward inversion and reverse replay
//! - [`cache`]: reuse/recompute decision for inversions
//! - [`pipeline`]: end-to-end edit with per-session caching
//! - [`manager`]: resident worker serializing edits for the daemon
//! - [`config`]: model ids, defaults, daemon settings

pub mod audio;
pub mod cache;
pub mod config;
pub mod inversion;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod scheduler;

mod error;

pub use error::{Error, Result, Stage};
